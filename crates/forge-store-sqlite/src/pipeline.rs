use forge_store_core::{now_millis, update_opt_lock, ListFilter, Pipeline, StoreError};
use rusqlite::{params, params_from_iter, types::Value, Connection, Row};

use crate::{collect_rows, map_sqlite_error};

const PIPELINE_COLUMNS: &str = "pipeline_id, pipeline_version, pipeline_repo_id, pipeline_uid, \
     pipeline_description, pipeline_disabled, pipeline_created_by, pipeline_seq, \
     pipeline_config_path, pipeline_created, pipeline_updated";

pub struct PipelineStore<'a> {
    conn: &'a Connection,
}

impl<'a> PipelineStore<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn find(&self, id: i64) -> Result<Pipeline, StoreError> {
        let query = format!("SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE pipeline_id = ?1");
        self.conn
            .query_row(&query, params![id], map_pipeline_row)
            .map_err(|err| map_sqlite_error(err, "failed to find pipeline"))
    }

    pub fn find_by_identifier(
        &self,
        repo_id: i64,
        identifier: &str,
    ) -> Result<Pipeline, StoreError> {
        let query = format!(
            "SELECT {PIPELINE_COLUMNS} FROM pipelines
             WHERE pipeline_repo_id = ?1 AND LOWER(pipeline_uid) = ?2"
        );
        self.conn
            .query_row(
                &query,
                params![repo_id, identifier.to_lowercase()],
                map_pipeline_row,
            )
            .map_err(|err| map_sqlite_error(err, "failed to find pipeline by identifier"))
    }

    pub fn create(&self, pipeline: &mut Pipeline) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO pipelines (
                    pipeline_version, pipeline_repo_id, pipeline_uid, pipeline_description,
                    pipeline_disabled, pipeline_created_by, pipeline_seq, pipeline_config_path,
                    pipeline_created, pipeline_updated
                 ) VALUES (0, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    pipeline.repo_id,
                    pipeline.identifier,
                    pipeline.description,
                    pipeline.disabled,
                    pipeline.created_by,
                    pipeline.seq,
                    pipeline.config_path,
                    pipeline.created,
                    pipeline.updated,
                ],
            )
            .map_err(|err| map_sqlite_error(err, "failed to insert pipeline"))?;

        pipeline.id = self.conn.last_insert_rowid();
        pipeline.version = 0;
        Ok(())
    }

    pub fn update(&self, pipeline: &mut Pipeline) -> Result<(), StoreError> {
        let next_version = pipeline.version + 1;
        let updated = now_millis();

        let affected = self
            .conn
            .execute(
                "UPDATE pipelines SET
                     pipeline_version = ?1
                    ,pipeline_updated = ?2
                    ,pipeline_uid = ?3
                    ,pipeline_description = ?4
                    ,pipeline_disabled = ?5
                    ,pipeline_seq = ?6
                    ,pipeline_config_path = ?7
                 WHERE pipeline_id = ?8 AND pipeline_version = ?1 - 1",
                params![
                    next_version,
                    updated,
                    pipeline.identifier,
                    pipeline.description,
                    pipeline.disabled,
                    pipeline.seq,
                    pipeline.config_path,
                    pipeline.id,
                ],
            )
            .map_err(|err| map_sqlite_error(err, "failed to update pipeline"))?;

        if affected == 0 {
            return Err(StoreError::VersionConflict);
        }

        pipeline.version = next_version;
        pipeline.updated = updated;
        Ok(())
    }

    pub fn update_opt_lock<M>(&self, pipeline: &Pipeline, mutate: M) -> Result<Pipeline, StoreError>
    where
        M: FnMut(&mut Pipeline) -> Result<(), StoreError>,
    {
        let id = pipeline.id;
        update_opt_lock(pipeline, mutate, || self.find(id), |dup| self.update(dup))
    }

    /// Allocates the next execution number for the pipeline. Safe against
    /// concurrent allocators: each caller ends up with a distinct `seq`.
    pub fn increment_seq(&self, pipeline: &Pipeline) -> Result<Pipeline, StoreError> {
        self.update_opt_lock(pipeline, |dup| {
            dup.seq += 1;
            Ok(())
        })
    }

    /// Deletes by id. Deleting a missing row is not an error.
    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM pipelines WHERE pipeline_id = ?1", params![id])
            .map_err(|err| map_sqlite_error(err, "failed to delete pipeline"))?;
        Ok(())
    }

    pub fn list(&self, repo_id: i64, filter: &ListFilter) -> Result<Vec<Pipeline>, StoreError> {
        let (mut query, args) = list_query(PIPELINE_COLUMNS, repo_id, filter);
        query.push_str(&format!(
            " ORDER BY LOWER(pipeline_uid) ASC LIMIT {} OFFSET {}",
            filter.limit(),
            filter.offset()
        ));

        let mut stmt = self
            .conn
            .prepare(&query)
            .map_err(|err| map_sqlite_error(err, "failed to prepare pipeline list query"))?;
        let rows = stmt
            .query_map(params_from_iter(args), map_pipeline_row)
            .map_err(|err| map_sqlite_error(err, "failed to list pipelines"))?;

        collect_rows(rows).map_err(|err| map_sqlite_error(err, "failed to read pipeline rows"))
    }

    pub fn count(&self, repo_id: i64, filter: &ListFilter) -> Result<i64, StoreError> {
        let (query, args) = list_query("COUNT(*)", repo_id, filter);
        self.conn
            .query_row(&query, params_from_iter(args), |row| row.get(0))
            .map_err(|err| map_sqlite_error(err, "failed to count pipelines"))
    }
}

fn list_query(columns: &str, repo_id: i64, filter: &ListFilter) -> (String, Vec<Value>) {
    let mut query = format!("SELECT {columns} FROM pipelines WHERE pipeline_repo_id = ?");
    let mut args = vec![Value::from(repo_id)];

    if let Some(term) = filter.query_term() {
        query.push_str(" AND LOWER(pipeline_uid) LIKE ?");
        args.push(Value::from(format!("%{term}%")));
    }

    (query, args)
}

fn map_pipeline_row(row: &Row<'_>) -> rusqlite::Result<Pipeline> {
    Ok(Pipeline {
        id: row.get(0)?,
        version: row.get(1)?,
        repo_id: row.get(2)?,
        identifier: row.get(3)?,
        description: row.get(4)?,
        disabled: row.get(5)?,
        created_by: row.get(6)?,
        seq: row.get(7)?,
        config_path: row.get(8)?,
        created: row.get(9)?,
        updated: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, RepoStore};
    use forge_store_core::Repository;

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

    fn seed_repo(db: &Database) -> Repository {
        let now = now_millis();
        let mut repo = Repository {
            id: 0,
            version: 0,
            parent_id: 1,
            identifier: "ci-home".to_string(),
            description: String::new(),
            created_by: 1,
            created: now,
            updated: now,
            deleted: None,
            default_branch: "main".to_string(),
            pullreq_seq: 0,
            num_pulls: 0,
            num_open_pulls: 0,
            num_merged_pulls: 0,
        };
        must(RepoStore::new(db.conn()).create(&mut repo));
        repo
    }

    fn fixture_pipeline(repo_id: i64, identifier: &str) -> Pipeline {
        let now = now_millis();
        Pipeline {
            id: 0,
            version: 0,
            repo_id,
            identifier: identifier.to_string(),
            description: String::new(),
            disabled: false,
            created_by: 1,
            seq: 0,
            config_path: ".ci/pipeline.yml".to_string(),
            created: now,
            updated: now,
        }
    }

    #[test]
    fn create_requires_existing_repository() {
        let db = fixture_db();
        let store = PipelineStore::new(db.conn());

        let mut orphan = fixture_pipeline(999, "orphan");
        assert!(matches!(
            store.create(&mut orphan),
            Err(StoreError::ForeignKey)
        ));
    }

    #[test]
    fn create_and_find_by_identifier() {
        let db = fixture_db();
        let repo = seed_repo(&db);
        let store = PipelineStore::new(db.conn());

        let mut pipeline = fixture_pipeline(repo.id, "Deploy");
        must(store.create(&mut pipeline));

        let found = must(store.find_by_identifier(repo.id, "deploy"));
        assert_eq!(found, pipeline);

        let mut clash = fixture_pipeline(repo.id, "DEPLOY");
        assert!(matches!(store.create(&mut clash), Err(StoreError::Duplicate)));
    }

    #[test]
    fn increment_seq_from_stale_snapshots_allocates_distinct_numbers() {
        let db = fixture_db();
        let repo = seed_repo(&db);
        let store = PipelineStore::new(db.conn());

        let mut pipeline = fixture_pipeline(repo.id, "build");
        must(store.create(&mut pipeline));

        // both allocators start from the same snapshot; one must retry
        let first = must(store.increment_seq(&pipeline));
        let second = must(store.increment_seq(&pipeline));

        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(second.version, 2);

        let stored = must(store.find(pipeline.id));
        assert_eq!(stored.seq, 2);
    }

    #[test]
    fn disable_via_opt_lock_survives_concurrent_edit() {
        let db = fixture_db();
        let repo = seed_repo(&db);
        let store = PipelineStore::new(db.conn());

        let mut pipeline = fixture_pipeline(repo.id, "flaky");
        must(store.create(&mut pipeline));
        let stale = pipeline.clone();

        pipeline.description = "edited concurrently".to_string();
        must(store.update(&mut pipeline));

        let disabled = must(store.update_opt_lock(&stale, |p| {
            p.disabled = true;
            Ok(())
        }));

        assert!(disabled.disabled);
        assert_eq!(disabled.description, "edited concurrently");
        assert_eq!(disabled.version, 2);
    }

    #[test]
    fn deleting_repo_cascades_to_pipelines() {
        let db = fixture_db();
        let repo = seed_repo(&db);
        let store = PipelineStore::new(db.conn());

        let mut pipeline = fixture_pipeline(repo.id, "doomed");
        must(store.create(&mut pipeline));

        must(RepoStore::new(db.conn()).purge(repo.id));
        assert!(must_err(store.find(pipeline.id)).is_not_found());
    }

    #[test]
    fn list_and_count_scope_to_repo() {
        let db = fixture_db();
        let repo = seed_repo(&db);
        let store = PipelineStore::new(db.conn());

        for name in ["build", "deploy", "lint"] {
            let mut pipeline = fixture_pipeline(repo.id, name);
            must(store.create(&mut pipeline));
        }

        let listed = must(store.list(repo.id, &ListFilter::default()));
        assert_eq!(
            listed
                .iter()
                .map(|p| p.identifier.as_str())
                .collect::<Vec<_>>(),
            vec!["build", "deploy", "lint"]
        );

        let filter = ListFilter {
            query: Some("de".to_string()),
            page: 0,
            size: 0,
        };
        assert_eq!(must(store.count(repo.id, &filter)), 1);
        assert_eq!(must(store.count(999, &ListFilter::default())), 0);
    }
}
