use forge_store_core::{
    now_millis, update_opt_lock, Execution, ExecutionStatus, ListFilter, StoreError,
};
use rusqlite::{params, Connection, Row};

use crate::{collect_rows, invalid_column, map_sqlite_error};

const EXECUTION_COLUMNS: &str = "execution_id, execution_version, execution_pipeline_id, \
     execution_repo_id, execution_number, execution_status, execution_error, execution_message, \
     execution_started, execution_finished, execution_created, execution_updated";

pub struct ExecutionStore<'a> {
    conn: &'a Connection,
}

impl<'a> ExecutionStore<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn find(&self, id: i64) -> Result<Execution, StoreError> {
        let query = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE execution_id = ?1");
        self.conn
            .query_row(&query, params![id], map_execution_row)
            .map_err(|err| map_sqlite_error(err, "failed to find execution"))
    }

    pub fn find_by_number(&self, pipeline_id: i64, number: i64) -> Result<Execution, StoreError> {
        let query = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE execution_pipeline_id = ?1 AND execution_number = ?2"
        );
        self.conn
            .query_row(&query, params![pipeline_id, number], map_execution_row)
            .map_err(|err| map_sqlite_error(err, "failed to find execution by number"))
    }

    pub fn create(&self, execution: &mut Execution) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO executions (
                    execution_version, execution_pipeline_id, execution_repo_id,
                    execution_number, execution_status, execution_error, execution_message,
                    execution_started, execution_finished, execution_created, execution_updated
                 ) VALUES (0, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    execution.pipeline_id,
                    execution.repo_id,
                    execution.number,
                    execution.status.as_str(),
                    execution.error_message,
                    execution.message,
                    execution.started,
                    execution.finished,
                    execution.created,
                    execution.updated,
                ],
            )
            .map_err(|err| map_sqlite_error(err, "failed to insert execution"))?;

        execution.id = self.conn.last_insert_rowid();
        execution.version = 0;
        Ok(())
    }

    pub fn update(&self, execution: &mut Execution) -> Result<(), StoreError> {
        let next_version = execution.version + 1;
        let updated = now_millis();

        let affected = self
            .conn
            .execute(
                "UPDATE executions SET
                     execution_version = ?1
                    ,execution_updated = ?2
                    ,execution_status = ?3
                    ,execution_error = ?4
                    ,execution_message = ?5
                    ,execution_started = ?6
                    ,execution_finished = ?7
                 WHERE execution_id = ?8 AND execution_version = ?1 - 1",
                params![
                    next_version,
                    updated,
                    execution.status.as_str(),
                    execution.error_message,
                    execution.message,
                    execution.started,
                    execution.finished,
                    execution.id,
                ],
            )
            .map_err(|err| map_sqlite_error(err, "failed to update execution"))?;

        if affected == 0 {
            return Err(StoreError::VersionConflict);
        }

        execution.version = next_version;
        execution.updated = updated;
        Ok(())
    }

    pub fn update_opt_lock<M>(
        &self,
        execution: &Execution,
        mutate: M,
    ) -> Result<Execution, StoreError>
    where
        M: FnMut(&mut Execution) -> Result<(), StoreError>,
    {
        let id = execution.id;
        update_opt_lock(execution, mutate, || self.find(id), |dup| self.update(dup))
    }

    /// Deletes by id. Deleting a missing row is not an error.
    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM executions WHERE execution_id = ?1", params![id])
            .map_err(|err| map_sqlite_error(err, "failed to delete execution"))?;
        Ok(())
    }

    /// Lists executions for a pipeline, newest first.
    pub fn list(&self, pipeline_id: i64, filter: &ListFilter) -> Result<Vec<Execution>, StoreError> {
        let query = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE execution_pipeline_id = ?1
             ORDER BY execution_number DESC
             LIMIT {} OFFSET {}",
            filter.limit(),
            filter.offset()
        );

        let mut stmt = self
            .conn
            .prepare(&query)
            .map_err(|err| map_sqlite_error(err, "failed to prepare execution list query"))?;
        let rows = stmt
            .query_map(params![pipeline_id], map_execution_row)
            .map_err(|err| map_sqlite_error(err, "failed to list executions"))?;

        collect_rows(rows).map_err(|err| map_sqlite_error(err, "failed to read execution rows"))
    }

    pub fn count(&self, pipeline_id: i64) -> Result<i64, StoreError> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM executions WHERE execution_pipeline_id = ?1",
                params![pipeline_id],
                |row| row.get(0),
            )
            .map_err(|err| map_sqlite_error(err, "failed to count executions"))
    }
}

fn map_execution_row(row: &Row<'_>) -> rusqlite::Result<Execution> {
    let status_raw: String = row.get(5)?;
    let status = ExecutionStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(5, format!("invalid execution_status: {status_raw}")))?;

    Ok(Execution {
        id: row.get(0)?,
        version: row.get(1)?,
        pipeline_id: row.get(2)?,
        repo_id: row.get(3)?,
        number: row.get(4)?,
        status,
        error_message: row.get(6)?,
        message: row.get(7)?,
        started: row.get(8)?,
        finished: row.get(9)?,
        created: row.get(10)?,
        updated: row.get(11)?,
    })
}
