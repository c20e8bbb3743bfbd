use forge_store_core::{
    now_millis, update_opt_lock, SortOrder, StoreError, Trigger, Webhook, WebhookExecutionResult,
    WebhookFilter, WebhookParent, WebhookSort,
};
use rusqlite::{params, params_from_iter, types::Value, Connection, Row};

use crate::{collect_rows, invalid_column, map_sqlite_error};

const WEBHOOK_COLUMNS: &str = "webhook_id, webhook_version, webhook_repo_id, webhook_space_id, \
     webhook_created_by, webhook_created, webhook_updated, webhook_uid, webhook_display_name, \
     webhook_description, webhook_url, webhook_secret, webhook_enabled, webhook_insecure, \
     webhook_internal, webhook_triggers, webhook_latest_execution_result";

pub struct WebhookStore<'a> {
    conn: &'a Connection,
}

impl<'a> WebhookStore<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn find(&self, id: i64) -> Result<Webhook, StoreError> {
        let query = format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE webhook_id = ?1");
        self.conn
            .query_row(&query, params![id], map_webhook_row)
            .map_err(|err| map_sqlite_error(err, "failed to find webhook"))
    }

    /// Finds a webhook by identifier under the given parent. Matching is
    /// case-insensitive.
    pub fn find_by_identifier(
        &self,
        parent: WebhookParent,
        parent_id: i64,
        identifier: &str,
    ) -> Result<Webhook, StoreError> {
        let query = format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks
             WHERE {} = ?1 AND LOWER(webhook_uid) = ?2",
            parent_column(parent)
        );
        self.conn
            .query_row(
                &query,
                params![parent_id, identifier.to_lowercase()],
                map_webhook_row,
            )
            .map_err(|err| map_sqlite_error(err, "failed to find webhook by identifier"))
    }

    pub fn create(&self, hook: &mut Webhook) -> Result<(), StoreError> {
        let triggers = serialize_triggers(&hook.triggers)?;
        self.conn
            .execute(
                "INSERT INTO webhooks (
                    webhook_version, webhook_repo_id, webhook_space_id, webhook_created_by,
                    webhook_created, webhook_updated, webhook_uid, webhook_display_name,
                    webhook_description, webhook_url, webhook_secret, webhook_enabled,
                    webhook_insecure, webhook_internal, webhook_triggers,
                    webhook_latest_execution_result
                 ) VALUES (0, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    hook.repo_id,
                    hook.space_id,
                    hook.created_by,
                    hook.created,
                    hook.updated,
                    hook.identifier,
                    hook.display_name,
                    hook.description,
                    hook.url,
                    hook.secret,
                    hook.enabled,
                    hook.insecure,
                    hook.internal,
                    triggers,
                    hook.latest_execution_result.map(WebhookExecutionResult::as_str),
                ],
            )
            .map_err(|err| map_sqlite_error(err, "failed to insert webhook"))?;

        hook.id = self.conn.last_insert_rowid();
        hook.version = 0;
        Ok(())
    }

    pub fn update(&self, hook: &mut Webhook) -> Result<(), StoreError> {
        let next_version = hook.version + 1;
        let updated = now_millis();
        let triggers = serialize_triggers(&hook.triggers)?;

        let affected = self
            .conn
            .execute(
                "UPDATE webhooks SET
                     webhook_version = ?1
                    ,webhook_updated = ?2
                    ,webhook_uid = ?3
                    ,webhook_display_name = ?4
                    ,webhook_description = ?5
                    ,webhook_url = ?6
                    ,webhook_secret = ?7
                    ,webhook_enabled = ?8
                    ,webhook_insecure = ?9
                    ,webhook_triggers = ?10
                    ,webhook_latest_execution_result = ?11
                 WHERE webhook_id = ?12 AND webhook_version = ?1 - 1",
                params![
                    next_version,
                    updated,
                    hook.identifier,
                    hook.display_name,
                    hook.description,
                    hook.url,
                    hook.secret,
                    hook.enabled,
                    hook.insecure,
                    triggers,
                    hook.latest_execution_result.map(WebhookExecutionResult::as_str),
                    hook.id,
                ],
            )
            .map_err(|err| map_sqlite_error(err, "failed to update webhook"))?;

        if affected == 0 {
            return Err(StoreError::VersionConflict);
        }

        hook.version = next_version;
        hook.updated = updated;
        Ok(())
    }

    /// Applies `mutate` to the latest webhook state and persists it, retrying
    /// on version conflicts.
    pub fn update_opt_lock<M>(&self, hook: &Webhook, mutate: M) -> Result<Webhook, StoreError>
    where
        M: FnMut(&mut Webhook) -> Result<(), StoreError>,
    {
        let id = hook.id;
        update_opt_lock(hook, mutate, || self.find(id), |dup| self.update(dup))
    }

    /// Deletes by id. Deleting a missing row is not an error.
    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM webhooks WHERE webhook_id = ?1", params![id])
            .map_err(|err| map_sqlite_error(err, "failed to delete webhook"))?;
        Ok(())
    }

    pub fn list(
        &self,
        parent: WebhookParent,
        parent_id: i64,
        filter: &WebhookFilter,
    ) -> Result<Vec<Webhook>, StoreError> {
        let (mut query, args) = list_query(WEBHOOK_COLUMNS, parent, parent_id, filter);

        query.push_str(" ORDER BY ");
        query.push_str(match filter.sort {
            WebhookSort::Id => "webhook_id",
            WebhookSort::Identifier => "LOWER(webhook_uid)",
            WebhookSort::Created => "webhook_created",
            WebhookSort::Updated => "webhook_updated",
        });
        query.push_str(match filter.order {
            SortOrder::Asc => " ASC",
            SortOrder::Desc => " DESC",
        });
        query.push_str(&format!(
            " LIMIT {} OFFSET {}",
            filter.list.limit(),
            filter.list.offset()
        ));

        let mut stmt = self
            .conn
            .prepare(&query)
            .map_err(|err| map_sqlite_error(err, "failed to prepare webhook list query"))?;
        let rows = stmt
            .query_map(params_from_iter(args), map_webhook_row)
            .map_err(|err| map_sqlite_error(err, "failed to list webhooks"))?;

        collect_rows(rows).map_err(|err| map_sqlite_error(err, "failed to read webhook rows"))
    }

    pub fn count(
        &self,
        parent: WebhookParent,
        parent_id: i64,
        filter: &WebhookFilter,
    ) -> Result<i64, StoreError> {
        let (query, args) = list_query("COUNT(*)", parent, parent_id, filter);
        self.conn
            .query_row(&query, params_from_iter(args), |row| row.get(0))
            .map_err(|err| map_sqlite_error(err, "failed to count webhooks"))
    }
}

fn parent_column(parent: WebhookParent) -> &'static str {
    match parent {
        WebhookParent::Repo => "webhook_repo_id",
        WebhookParent::Space => "webhook_space_id",
    }
}

fn list_query(
    columns: &str,
    parent: WebhookParent,
    parent_id: i64,
    filter: &WebhookFilter,
) -> (String, Vec<Value>) {
    let mut query = format!(
        "SELECT {columns} FROM webhooks WHERE {} = ?",
        parent_column(parent)
    );
    let mut args = vec![Value::from(parent_id)];

    if let Some(term) = filter.list.query_term() {
        query.push_str(" AND LOWER(webhook_uid) LIKE ?");
        args.push(Value::from(format!("%{term}%")));
    }
    if filter.skip_internal {
        query.push_str(" AND webhook_internal = 0");
    }

    (query, args)
}

fn serialize_triggers(triggers: &[Trigger]) -> Result<String, StoreError> {
    serde_json::to_string(triggers)
        .map_err(|err| StoreError::internal("failed to serialize webhook triggers", err))
}

fn map_webhook_row(row: &Row<'_>) -> rusqlite::Result<Webhook> {
    let triggers_raw: String = row.get(15)?;
    let triggers: Vec<Trigger> = serde_json::from_str(&triggers_raw)
        .map_err(|err| invalid_column(15, format!("invalid webhook_triggers: {err}")))?;

    let result_raw: Option<String> = row.get(16)?;
    let latest_execution_result = result_raw
        .as_deref()
        .map(|raw| {
            WebhookExecutionResult::parse(raw).ok_or_else(|| {
                invalid_column(16, format!("invalid webhook_latest_execution_result: {raw}"))
            })
        })
        .transpose()?;

    Ok(Webhook {
        id: row.get(0)?,
        version: row.get(1)?,
        repo_id: row.get(2)?,
        space_id: row.get(3)?,
        created_by: row.get(4)?,
        created: row.get(5)?,
        updated: row.get(6)?,
        identifier: row.get(7)?,
        display_name: row.get(8)?,
        description: row.get(9)?,
        url: row.get(10)?,
        secret: row.get(11)?,
        enabled: row.get(12)?,
        insecure: row.get(13)?,
        internal: row.get(14)?,
        triggers,
        latest_execution_result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use forge_store_core::ListFilter;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_err<T>(result: Result<T, StoreError>) -> StoreError {
        match result {
            Err(err) => err,
            Ok(_) => panic!("expected an error"),
        }
    }

    fn fixture_db() -> Database {
        let db = must(Database::open_in_memory());
        must(db.migrate());
        db
    }

    fn fixture_webhook(parent: WebhookParent, parent_id: i64, identifier: &str) -> Webhook {
        let now = now_millis();
        Webhook {
            id: 0,
            version: 0,
            repo_id: (parent == WebhookParent::Repo).then_some(parent_id),
            space_id: (parent == WebhookParent::Space).then_some(parent_id),
            created_by: 1,
            created: now,
            updated: now,
            identifier: identifier.to_string(),
            display_name: identifier.to_string(),
            description: String::new(),
            url: "https://example.com/hook".to_string(),
            secret: String::new(),
            enabled: true,
            insecure: false,
            internal: false,
            triggers: vec![Trigger::BranchUpdated, Trigger::PullReqCreated],
            latest_execution_result: None,
        }
    }

    #[test]
    fn create_and_find_round_trips_triggers() {
        let db = fixture_db();
        let store = WebhookStore::new(db.conn());

        let mut hook = fixture_webhook(WebhookParent::Repo, 10, "notify");
        must(store.create(&mut hook));
        assert!(hook.id > 0);

        let found = must(store.find(hook.id));
        assert_eq!(found, hook);
        assert_eq!(
            found.triggers,
            vec![Trigger::BranchUpdated, Trigger::PullReqCreated]
        );
        assert_eq!(found.parent(), Some((WebhookParent::Repo, 10)));
    }

    #[test]
    fn identifier_is_unique_per_parent_only() {
        let db = fixture_db();
        let store = WebhookStore::new(db.conn());

        let mut repo_hook = fixture_webhook(WebhookParent::Repo, 10, "shared");
        must(store.create(&mut repo_hook));

        let mut clash = fixture_webhook(WebhookParent::Repo, 10, "SHARED");
        assert!(matches!(store.create(&mut clash), Err(StoreError::Duplicate)));

        // same identifier on a space parent does not clash
        let mut space_hook = fixture_webhook(WebhookParent::Space, 10, "shared");
        must(store.create(&mut space_hook));

        let found = must(store.find_by_identifier(WebhookParent::Space, 10, "Shared"));
        assert_eq!(found.id, space_hook.id);
    }

    #[test]
    fn update_opt_lock_records_execution_result() {
        let db = fixture_db();
        let store = WebhookStore::new(db.conn());

        let mut hook = fixture_webhook(WebhookParent::Repo, 10, "delivery");
        must(store.create(&mut hook));
        let stale = hook.clone();

        // delivery bookkeeping races with a user edit of the same hook
        hook.enabled = false;
        must(store.update(&mut hook));

        let result = must(store.update_opt_lock(&stale, |h| {
            h.latest_execution_result = Some(WebhookExecutionResult::RetriableError);
            Ok(())
        }));

        assert_eq!(result.version, 2);
        assert_eq!(
            result.latest_execution_result,
            Some(WebhookExecutionResult::RetriableError)
        );
        assert!(!result.enabled);
    }

    #[test]
    fn stale_direct_update_conflicts() {
        let db = fixture_db();
        let store = WebhookStore::new(db.conn());

        let mut hook = fixture_webhook(WebhookParent::Space, 3, "stale");
        must(store.create(&mut hook));

        let mut other = hook.clone();
        must(store.update(&mut hook));

        assert!(must_err(store.update(&mut other)).is_version_conflict());
    }

    #[test]
    fn delete_is_idempotent() {
        let db = fixture_db();
        let store = WebhookStore::new(db.conn());

        let mut hook = fixture_webhook(WebhookParent::Repo, 10, "gone");
        must(store.create(&mut hook));

        must(store.delete(hook.id));
        must(store.delete(hook.id));
        assert!(must_err(store.find(hook.id)).is_not_found());
    }

    #[test]
    fn list_respects_parent_scope_and_internal_flag() {
        let db = fixture_db();
        let store = WebhookStore::new(db.conn());

        let mut visible = fixture_webhook(WebhookParent::Repo, 10, "ci-notify");
        must(store.create(&mut visible));

        let mut internal = fixture_webhook(WebhookParent::Repo, 10, "system-sync");
        internal.internal = true;
        must(store.create(&mut internal));

        let mut elsewhere = fixture_webhook(WebhookParent::Repo, 11, "ci-notify");
        must(store.create(&mut elsewhere));

        let all = must(store.list(WebhookParent::Repo, 10, &WebhookFilter::default()));
        assert_eq!(all.len(), 2);

        let external_only = WebhookFilter {
            skip_internal: true,
            ..WebhookFilter::default()
        };
        let listed = must(store.list(WebhookParent::Repo, 10, &external_only));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].identifier, "ci-notify");
        assert_eq!(
            must(store.count(WebhookParent::Repo, 10, &external_only)),
            1
        );

        let queried = WebhookFilter {
            list: ListFilter {
                query: Some("sync".to_string()),
                page: 0,
                size: 0,
            },
            sort: WebhookSort::Identifier,
            order: SortOrder::Asc,
            skip_internal: false,
        };
        let matched = must(store.list(WebhookParent::Repo, 10, &queried));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].identifier, "system-sync");
    }
}
