#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use forge_store_core::{now_millis, StoreError};
use rusqlite::{params, Connection, Transaction};

mod execution;
mod pipeline;
mod repo;
mod webhook;

pub use execution::ExecutionStore;
pub use pipeline::PipelineStore;
pub use repo::RepoStore;
pub use webhook::WebhookStore;

const STORE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS repositories (
  repo_id INTEGER PRIMARY KEY AUTOINCREMENT,
  repo_version INTEGER NOT NULL DEFAULT 0 CHECK (repo_version >= 0),
  repo_parent_id INTEGER NOT NULL,
  repo_uid TEXT NOT NULL,
  repo_description TEXT NOT NULL DEFAULT '',
  repo_created_by INTEGER NOT NULL,
  repo_created INTEGER NOT NULL,
  repo_updated INTEGER NOT NULL,
  repo_deleted INTEGER,
  repo_default_branch TEXT NOT NULL,
  repo_pullreq_seq INTEGER NOT NULL DEFAULT 0,
  repo_num_pulls INTEGER NOT NULL DEFAULT 0,
  repo_num_open_pulls INTEGER NOT NULL DEFAULT 0,
  repo_num_merged_pulls INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_repositories_parent_uid
  ON repositories(repo_parent_id, LOWER(repo_uid))
  WHERE repo_deleted IS NULL;

CREATE TABLE IF NOT EXISTS webhooks (
  webhook_id INTEGER PRIMARY KEY AUTOINCREMENT,
  webhook_version INTEGER NOT NULL DEFAULT 0 CHECK (webhook_version >= 0),
  webhook_repo_id INTEGER,
  webhook_space_id INTEGER,
  webhook_created_by INTEGER NOT NULL,
  webhook_created INTEGER NOT NULL,
  webhook_updated INTEGER NOT NULL,
  webhook_uid TEXT NOT NULL,
  webhook_display_name TEXT NOT NULL,
  webhook_description TEXT NOT NULL DEFAULT '',
  webhook_url TEXT NOT NULL,
  webhook_secret TEXT NOT NULL DEFAULT '',
  webhook_enabled INTEGER NOT NULL CHECK (webhook_enabled IN (0, 1)),
  webhook_insecure INTEGER NOT NULL CHECK (webhook_insecure IN (0, 1)),
  webhook_internal INTEGER NOT NULL DEFAULT 0 CHECK (webhook_internal IN (0, 1)),
  webhook_triggers TEXT NOT NULL DEFAULT '[]',
  webhook_latest_execution_result TEXT CHECK (
    webhook_latest_execution_result IN ('success', 'retriable_error', 'fatal_error')
    OR webhook_latest_execution_result IS NULL
  ),
  CHECK ((webhook_repo_id IS NULL) <> (webhook_space_id IS NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_webhooks_repo_uid
  ON webhooks(webhook_repo_id, LOWER(webhook_uid))
  WHERE webhook_repo_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_webhooks_space_uid
  ON webhooks(webhook_space_id, LOWER(webhook_uid))
  WHERE webhook_space_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS pipelines (
  pipeline_id INTEGER PRIMARY KEY AUTOINCREMENT,
  pipeline_version INTEGER NOT NULL DEFAULT 0 CHECK (pipeline_version >= 0),
  pipeline_repo_id INTEGER NOT NULL REFERENCES repositories(repo_id) ON DELETE CASCADE,
  pipeline_uid TEXT NOT NULL,
  pipeline_description TEXT NOT NULL DEFAULT '',
  pipeline_disabled INTEGER NOT NULL DEFAULT 0 CHECK (pipeline_disabled IN (0, 1)),
  pipeline_created_by INTEGER NOT NULL,
  pipeline_seq INTEGER NOT NULL DEFAULT 0,
  pipeline_config_path TEXT NOT NULL,
  pipeline_created INTEGER NOT NULL,
  pipeline_updated INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_pipelines_repo_uid
  ON pipelines(pipeline_repo_id, LOWER(pipeline_uid));

CREATE TABLE IF NOT EXISTS executions (
  execution_id INTEGER PRIMARY KEY AUTOINCREMENT,
  execution_version INTEGER NOT NULL DEFAULT 0 CHECK (execution_version >= 0),
  execution_pipeline_id INTEGER NOT NULL REFERENCES pipelines(pipeline_id) ON DELETE CASCADE,
  execution_repo_id INTEGER NOT NULL,
  execution_number INTEGER NOT NULL CHECK (execution_number >= 1),
  execution_status TEXT NOT NULL CHECK (
    execution_status IN ('pending', 'running', 'success', 'failure', 'error', 'killed')
  ),
  execution_error TEXT NOT NULL DEFAULT '',
  execution_message TEXT NOT NULL DEFAULT '',
  execution_started INTEGER NOT NULL DEFAULT 0,
  execution_finished INTEGER NOT NULL DEFAULT 0,
  execution_created INTEGER NOT NULL,
  execution_updated INTEGER NOT NULL,
  UNIQUE (execution_pipeline_id, execution_number)
);
";

/// Owns the SQLite connection the stores execute against.
///
/// Stores borrow the connection explicitly instead of discovering it through
/// ambient state, so the same store type works against the plain connection
/// or inside a [`Transaction`] (which derefs to [`Connection`]).
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|err| {
            StoreError::internal(
                format!("failed to open sqlite database at {}", path.display()),
                err,
            )
        })?;
        Self::configure(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|err| StoreError::internal("failed to open in-memory sqlite database", err))?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|err| StoreError::internal("failed to configure sqlite pragmas", err))?;

        Ok(Self { conn })
    }

    /// Applies the store schema and registers it in `schema_migrations`.
    pub fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at INTEGER NOT NULL
                );",
            )
            .map_err(|err| StoreError::internal("failed to ensure schema_migrations exists", err))?;

        self.conn
            .execute_batch(SCHEMA_V1)
            .map_err(|err| StoreError::internal("failed to apply store schema", err))?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STORE_MIGRATION_VERSION, now_millis()],
            )
            .map_err(|err| StoreError::internal("failed to register schema migration", err))?;

        Ok(())
    }

    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn transaction(&mut self) -> Result<Transaction<'_>, StoreError> {
        self.conn
            .transaction()
            .map_err(|err| StoreError::internal("failed to begin transaction", err))
    }
}

/// Maps a raw driver error into the store taxonomy, attaching call-site
/// context to anything that is not one of the well-known cases.
pub(crate) fn map_sqlite_error(err: rusqlite::Error, context: &str) -> StoreError {
    if matches!(err, rusqlite::Error::QueryReturnedNoRows) {
        return StoreError::NotFound;
    }

    if let rusqlite::Error::SqliteFailure(code, _) = &err {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            match code.extended_code {
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => return StoreError::Duplicate,
                rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => return StoreError::ForeignKey,
                _ => {}
            }
        }
    }

    StoreError::internal(context, err)
}

pub(crate) fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> rusqlite::Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let db = must(Database::open_in_memory());
        must(db.migrate());
        must(db.migrate());

        let registered: i64 = must(db.conn().query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
            params![STORE_MIGRATION_VERSION],
            |row| row.get(0),
        ));
        assert_eq!(registered, 1);
    }

    #[test]
    fn classifier_maps_no_rows_to_not_found() {
        let err = map_sqlite_error(rusqlite::Error::QueryReturnedNoRows, "ctx");
        assert!(err.is_not_found());
    }

    #[test]
    fn classifier_maps_unique_violation_to_duplicate() {
        let db = must(Database::open_in_memory());
        must(db.migrate());
        must(db.conn().execute(
            "INSERT INTO repositories (
                repo_parent_id, repo_uid, repo_created_by, repo_created, repo_updated,
                repo_default_branch
             ) VALUES (1, 'dup', 1, 0, 0, 'main')",
            [],
        ));

        let raw = db
            .conn()
            .execute(
                "INSERT INTO repositories (
                    repo_parent_id, repo_uid, repo_created_by, repo_created, repo_updated,
                    repo_default_branch
                 ) VALUES (1, 'DUP', 1, 0, 0, 'main')",
                [],
            )
            .err();

        let raw = match raw {
            Some(err) => err,
            None => panic!("expected unique violation"),
        };
        assert!(matches!(
            map_sqlite_error(raw, "ctx"),
            StoreError::Duplicate
        ));
    }

    #[test]
    fn classifier_maps_fk_violation() {
        let db = must(Database::open_in_memory());
        must(db.migrate());

        let raw = db
            .conn()
            .execute(
                "INSERT INTO pipelines (
                    pipeline_repo_id, pipeline_uid, pipeline_created_by,
                    pipeline_config_path, pipeline_created, pipeline_updated
                 ) VALUES (999, 'p', 1, '.ci.yml', 0, 0)",
                [],
            )
            .err();

        let raw = match raw {
            Some(err) => err,
            None => panic!("expected foreign key violation"),
        };
        assert!(matches!(
            map_sqlite_error(raw, "ctx"),
            StoreError::ForeignKey
        ));
    }
}
