//! SQL execution primitives of the server agent.
//!
//! Monitor statements go through the text protocol, so every result cell
//! arrives as text and is normalized into a [`QueryResult`] of optional
//! strings. Commands that must survive flaky networks run through
//! [`ServerAgent::execute_cmd_time_limit`], which pairs the client-side read
//! timeout with a server-side `max_statement_time` and retries at most once
//! per second until the budget runs out.

use std::time::Duration;

use sqlx::mysql::{MySqlConnectOptions, MySqlRow};
use sqlx::{Column, ConnectOptions, Executor, Row};
use tokio::time::Instant;

use super::ServerAgent;
use crate::error::{QueryError, QueryErrorKind};

/// Result rows of one query, all cells decoded to text.
///
/// Column metadata is taken from the first row; a result with zero rows has
/// zero columns.
#[derive(Debug, Default)]
pub(crate) struct QueryResult {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    fn from_rows(rows: Vec<MySqlRow>) -> QueryResult {
        let columns = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|col| col.name().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let rows = rows
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.try_get_unchecked::<Option<String>, _>(i).unwrap_or(None))
                    .collect()
            })
            .collect();
        QueryResult { columns, rows }
    }

    pub fn col_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn get_col_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col == name)
    }

    pub fn rows(&self) -> impl Iterator<Item = RowView<'_>> {
        self.rows.iter().map(|cells| RowView { cells })
    }
}

/// Borrowed view of one result row.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RowView<'a> {
    cells: &'a [Option<String>],
}

impl RowView<'_> {
    /// Cell as text, empty for NULL.
    pub fn string(&self, index: usize) -> String {
        self.cells
            .get(index)
            .and_then(|cell| cell.clone())
            .unwrap_or_default()
    }

    /// Cell as an integer, -1 for NULL or unparseable data.
    pub fn int(&self, index: usize) -> i64 {
        self.cells
            .get(index)
            .and_then(|cell| cell.as_deref())
            .and_then(|text| text.trim().parse().ok())
            .unwrap_or(-1)
    }

    /// Cell as a boolean. The server prints booleans as `0`/`1`, `ON`/`OFF`
    /// or `Yes`/`No` depending on the variable.
    pub fn bool(&self, index: usize) -> bool {
        self.cells
            .get(index)
            .and_then(|cell| cell.as_deref())
            .map(|text| {
                text == "1" || text.eq_ignore_ascii_case("yes") || text.eq_ignore_ascii_case("on")
            })
            .unwrap_or(false)
    }
}

impl ServerAgent {
    /// Connect if there is no live session. One session per backend; the
    /// monitor never pools.
    pub(crate) async fn connection(&mut self) -> Result<&mut sqlx::MySqlConnection, QueryError> {
        if self.conn.is_none() {
            let options = MySqlConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .username(&self.user)
                .password(&self.password);
            match tokio::time::timeout(self.query_timeout, options.connect()).await {
                Err(_) => {
                    return Err(QueryError::new(
                        QueryErrorKind::Network,
                        0,
                        format!(
                            "Could not connect to '{}': connection attempt timed out after {:.1} seconds.",
                            self.name,
                            self.query_timeout.as_secs_f64()
                        ),
                    ))
                }
                Ok(Err(err)) => return Err(QueryError::connect(&self.name, &err)),
                Ok(Ok(conn)) => self.conn = Some(conn),
            }
        }
        match self.conn.as_mut() {
            Some(conn) => Ok(conn),
            None => Err(QueryError::new(
                QueryErrorKind::Network,
                0,
                format!("No connection to '{}'.", self.name),
            )),
        }
    }

    /// Run a query and collect its rows. A network failure poisons the
    /// session; the next call reconnects.
    pub(crate) async fn execute_query(&mut self, sql: &str) -> Result<QueryResult, QueryError> {
        let timeout = self.query_timeout;
        let server = self.name.clone();
        let conn = self.connection().await?;
        let result = match tokio::time::timeout(timeout, conn.fetch_all(sql)).await {
            Err(_) => Err(QueryError::client_timeout(&server, sql, timeout)),
            Ok(Err(err)) => Err(QueryError::from_sqlx(&server, sql, &err)),
            Ok(Ok(rows)) => Ok(QueryResult::from_rows(rows)),
        };
        if let Err(err) = &result {
            if err.is_network() {
                self.conn = None;
            }
        }
        result
    }

    /// Run a statement that must not return data. Returned rows are an error:
    /// they mean the caller sent a read through the command path.
    pub(crate) async fn execute_cmd(&mut self, sql: &str) -> Result<(), QueryError> {
        let result = self.execute_query(sql).await?;
        if result.row_count() > 0 {
            return Err(QueryError::new(
                QueryErrorKind::UnexpectedResult,
                0,
                format!(
                    "Query '{sql}' on '{}' returned {} columns and {} rows of data when none was expected.",
                    self.name,
                    result.col_count(),
                    result.row_count()
                ),
            ));
        }
        Ok(())
    }

    /// Run a command, retrying network errors and server-side statement
    /// timeouts until `time_limit` is spent. The command must have a
    /// predictable effect when run more than once.
    ///
    /// When the backend supports `max_statement_time` the command is prefixed
    /// so the server aborts it just before the client-side read timeout
    /// would, leaving no statement lingering after a retry. Attempts that
    /// finish in under a second are padded with sleep so a flapping network
    /// costs at most one statement per second. Runs at least once even with
    /// an exhausted budget.
    pub(crate) async fn execute_cmd_time_limit(
        &mut self,
        cmd: &str,
        time_limit: Duration,
    ) -> Result<(), QueryError> {
        let max_stmt_prefix = if self.capabilities.max_statement_time {
            let secs = self.query_timeout.as_secs().max(1);
            format!("SET STATEMENT max_statement_time={secs} FOR ")
        } else {
            String::new()
        };
        let command = format!("{max_stmt_prefix}{cmd}");
        let min_query_time = Duration::from_secs(1);
        let start = Instant::now();

        loop {
            let attempt_start = Instant::now();
            let result = self.execute_cmd(&command).await;
            let query_time = attempt_start.elapsed();

            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            let retryable = err.is_network()
                || (!max_stmt_prefix.is_empty() && err.kind == QueryErrorKind::StatementTimeout);
            if !retryable {
                return Err(err);
            }
            // Budget exhaustion is reported as its own kind so callers can
            // tell "too slow" from "broken".
            let time_remaining = time_limit.saturating_sub(start.elapsed());
            if time_remaining.is_zero() {
                return Err(QueryError::new(
                    QueryErrorKind::Deadline,
                    err.errno,
                    format!("{err} No retry time remaining."),
                ));
            }

            tracing::warn!(
                server = %self.name,
                "{} Retrying with {:.1} seconds left.",
                err,
                time_remaining.as_secs_f64()
            );
            if query_time < min_query_time {
                let pause = (min_query_time - query_time).min(time_remaining);
                tokio::time::sleep(pause).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(columns: &[&str], rows: &[&[Option<&str>]]) -> QueryResult {
        QueryResult {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .iter()
                .map(|row| row.iter().map(|c| c.map(str::to_string)).collect())
                .collect(),
        }
    }

    #[test]
    fn test_column_lookup_and_row_access() {
        let result = result_with(
            &["Master_Host", "Master_Port", "Slave_IO_Running"],
            &[&[Some("db2"), Some("3306"), Some("Yes")]],
        );
        assert_eq!(result.get_col_index("Master_Port"), Some(1));
        assert_eq!(result.get_col_index("Missing"), None);

        let row = result.rows().next().expect("one row");
        assert_eq!(row.string(0), "db2");
        assert_eq!(row.int(1), 3306);
        assert!(row.bool(2));
    }

    #[test]
    fn test_null_cells_decode_to_defaults() {
        let result = result_with(&["Seconds_Behind_Master"], &[&[None]]);
        let row = result.rows().next().expect("one row");
        assert_eq!(row.string(0), "");
        assert_eq!(row.int(0), -1);
        assert!(!row.bool(0));
    }

    #[test]
    fn test_bool_decodes_server_spellings() {
        let result = result_with(
            &["a", "b", "c", "d"],
            &[&[Some("1"), Some("ON"), Some("Yes"), Some("0")]],
        );
        let row = result.rows().next().expect("one row");
        assert!(row.bool(0));
        assert!(row.bool(1));
        assert!(row.bool(2));
        assert!(!row.bool(3));
    }

    #[test]
    fn test_empty_result_has_no_columns() {
        let result = result_with(&[], &[]);
        assert_eq!(result.col_count(), 0);
        assert_eq!(result.row_count(), 0);
        assert!(result.rows().next().is_none());
    }

    #[tokio::test]
    async fn test_exhausted_budget_reports_deadline() {
        // Nothing listens on port 1, so the single mandatory attempt fails
        // with a retryable connection error; with no budget left the caller
        // must see a deadline, not the network error itself.
        let mut agent = ServerAgent::mock("db1", "127.0.0.1", 1, 1);
        let err = agent
            .execute_cmd_time_limit("FLUSH LOGS;", Duration::ZERO)
            .await
            .expect_err("no server is listening");
        assert_eq!(err.kind, QueryErrorKind::Deadline);
        assert!(err.to_string().contains("No retry time remaining"));
    }
}
