use forge_store_core::{
    now_millis, update_opt_lock, RepoFilter, RepoSort, Repository, SortOrder, StoreError,
};
use rusqlite::{params, params_from_iter, types::Value, Connection, Row};

use crate::{collect_rows, map_sqlite_error};

const REPO_COLUMNS: &str = "repo_id, repo_version, repo_parent_id, repo_uid, repo_description, \
     repo_created_by, repo_created, repo_updated, repo_deleted, repo_default_branch, \
     repo_pullreq_seq, repo_num_pulls, repo_num_open_pulls, repo_num_merged_pulls";

/// Store for repository rows. Soft-deleted rows are invisible to `find` and
/// `list`; `find_deleted` and `purge` operate on them explicitly.
pub struct RepoStore<'a> {
    conn: &'a Connection,
}

impl<'a> RepoStore<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Finds a live repository by id.
    pub fn find(&self, id: i64) -> Result<Repository, StoreError> {
        let query = format!(
            "SELECT {REPO_COLUMNS} FROM repositories WHERE repo_id = ?1 AND repo_deleted IS NULL"
        );
        self.conn
            .query_row(&query, params![id], map_repo_row)
            .map_err(|err| map_sqlite_error(err, "failed to find repository"))
    }

    /// Finds a soft-deleted repository by id.
    pub fn find_deleted(&self, id: i64) -> Result<Repository, StoreError> {
        let query = format!(
            "SELECT {REPO_COLUMNS} FROM repositories WHERE repo_id = ?1 AND repo_deleted IS NOT NULL"
        );
        self.conn
            .query_row(&query, params![id], map_repo_row)
            .map_err(|err| map_sqlite_error(err, "failed to find deleted repository"))
    }

    /// Finds a live repository by its identifier within a parent space.
    /// Identifier matching is case-insensitive.
    pub fn find_by_identifier(
        &self,
        parent_id: i64,
        identifier: &str,
    ) -> Result<Repository, StoreError> {
        let query = format!(
            "SELECT {REPO_COLUMNS} FROM repositories
             WHERE repo_parent_id = ?1 AND LOWER(repo_uid) = ?2 AND repo_deleted IS NULL"
        );
        self.conn
            .query_row(
                &query,
                params![parent_id, identifier.to_lowercase()],
                map_repo_row,
            )
            .map_err(|err| map_sqlite_error(err, "failed to find repository by identifier"))
    }

    fn find_any(&self, id: i64) -> Result<Repository, StoreError> {
        let query = format!("SELECT {REPO_COLUMNS} FROM repositories WHERE repo_id = ?1");
        self.conn
            .query_row(&query, params![id], map_repo_row)
            .map_err(|err| map_sqlite_error(err, "failed to re-fetch repository"))
    }

    /// Inserts the repository and writes the generated id back onto it.
    /// The stored version always starts at 0 regardless of the input.
    pub fn create(&self, repo: &mut Repository) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO repositories (
                    repo_version, repo_parent_id, repo_uid, repo_description,
                    repo_created_by, repo_created, repo_updated, repo_deleted,
                    repo_default_branch, repo_pullreq_seq, repo_num_pulls,
                    repo_num_open_pulls, repo_num_merged_pulls
                 ) VALUES (0, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    repo.parent_id,
                    repo.identifier,
                    repo.description,
                    repo.created_by,
                    repo.created,
                    repo.updated,
                    repo.deleted,
                    repo.default_branch,
                    repo.pullreq_seq,
                    repo.num_pulls,
                    repo.num_open_pulls,
                    repo.num_merged_pulls,
                ],
            )
            .map_err(|err| map_sqlite_error(err, "failed to insert repository"))?;

        repo.id = self.conn.last_insert_rowid();
        repo.version = 0;
        Ok(())
    }

    /// Persists the caller's snapshot, accepted only if no concurrent writer
    /// advanced the row since the snapshot was read. On success the entity's
    /// `version` and `updated` fields are refreshed in place.
    pub fn update(&self, repo: &mut Repository) -> Result<(), StoreError> {
        let next_version = repo.version + 1;
        let updated = now_millis();

        let affected = self
            .conn
            .execute(
                "UPDATE repositories SET
                     repo_version = ?1
                    ,repo_updated = ?2
                    ,repo_deleted = ?3
                    ,repo_parent_id = ?4
                    ,repo_uid = ?5
                    ,repo_description = ?6
                    ,repo_default_branch = ?7
                    ,repo_pullreq_seq = ?8
                    ,repo_num_pulls = ?9
                    ,repo_num_open_pulls = ?10
                    ,repo_num_merged_pulls = ?11
                 WHERE repo_id = ?12 AND repo_version = ?1 - 1",
                params![
                    next_version,
                    updated,
                    repo.deleted,
                    repo.parent_id,
                    repo.identifier,
                    repo.description,
                    repo.default_branch,
                    repo.pullreq_seq,
                    repo.num_pulls,
                    repo.num_open_pulls,
                    repo.num_merged_pulls,
                    repo.id,
                ],
            )
            .map_err(|err| map_sqlite_error(err, "failed to update repository"))?;

        if affected == 0 {
            return Err(StoreError::VersionConflict);
        }

        repo.version = next_version;
        repo.updated = updated;
        Ok(())
    }

    /// Applies `mutate` to the latest state of a live repository and persists
    /// it, retrying on version conflicts. Returns the updated entity.
    /// Fails with [`StoreError::NotFound`] if the row has been soft-deleted.
    pub fn update_opt_lock<M>(
        &self,
        repo: &Repository,
        mut mutate: M,
    ) -> Result<Repository, StoreError>
    where
        M: FnMut(&mut Repository) -> Result<(), StoreError>,
    {
        self.update_opt_lock_any(repo, |dup| {
            if dup.deleted.is_some() {
                return Err(StoreError::NotFound);
            }
            mutate(dup)
        })
    }

    fn update_opt_lock_any<M>(&self, repo: &Repository, mutate: M) -> Result<Repository, StoreError>
    where
        M: FnMut(&mut Repository) -> Result<(), StoreError>,
    {
        let id = repo.id;
        update_opt_lock(
            repo,
            mutate,
            || self.find_any(id),
            |dup| self.update(dup),
        )
    }

    /// Soft-deletes by stamping `deleted`, going through the optimistic lock
    /// so a concurrent mutation is not silently dropped.
    pub fn soft_delete(
        &self,
        repo: &Repository,
        deleted_at: i64,
    ) -> Result<Repository, StoreError> {
        self.update_opt_lock(repo, |dup| {
            dup.deleted = Some(deleted_at);
            Ok(())
        })
    }

    /// Permanently removes the row. Deleting a missing row is not an error.
    pub fn purge(&self, id: i64) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM repositories WHERE repo_id = ?1", params![id])
            .map_err(|err| map_sqlite_error(err, "failed to purge repository"))?;
        Ok(())
    }

    pub fn list(&self, parent_id: i64, filter: &RepoFilter) -> Result<Vec<Repository>, StoreError> {
        let (mut query, args) = list_query(REPO_COLUMNS, parent_id, filter);

        query.push_str(" ORDER BY ");
        query.push_str(match filter.sort {
            RepoSort::Identifier => "LOWER(repo_uid)",
            RepoSort::Created => "repo_created",
            RepoSort::Updated => "repo_updated",
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
            .map_err(|err| map_sqlite_error(err, "failed to prepare repository list query"))?;
        let rows = stmt
            .query_map(params_from_iter(args), map_repo_row)
            .map_err(|err| map_sqlite_error(err, "failed to list repositories"))?;

        collect_rows(rows).map_err(|err| map_sqlite_error(err, "failed to read repository rows"))
    }

    pub fn count(&self, parent_id: i64, filter: &RepoFilter) -> Result<i64, StoreError> {
        let (query, args) = list_query("COUNT(*)", parent_id, filter);
        self.conn
            .query_row(&query, params_from_iter(args), |row| row.get(0))
            .map_err(|err| map_sqlite_error(err, "failed to count repositories"))
    }
}

fn list_query(columns: &str, parent_id: i64, filter: &RepoFilter) -> (String, Vec<Value>) {
    let mut query = format!(
        "SELECT {columns} FROM repositories
         WHERE repo_parent_id = ? AND repo_deleted IS NULL"
    );
    let mut args = vec![Value::from(parent_id)];

    if let Some(term) = filter.list.query_term() {
        query.push_str(" AND LOWER(repo_uid) LIKE ?");
        args.push(Value::from(format!("%{term}%")));
    }

    (query, args)
}

fn map_repo_row(row: &Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        version: row.get(1)?,
        parent_id: row.get(2)?,
        identifier: row.get(3)?,
        description: row.get(4)?,
        created_by: row.get(5)?,
        created: row.get(6)?,
        updated: row.get(7)?,
        deleted: row.get(8)?,
        default_branch: row.get(9)?,
        pullreq_seq: row.get(10)?,
        num_pulls: row.get(11)?,
        num_open_pulls: row.get(12)?,
        num_merged_pulls: row.get(13)?,
    })
}
