//! SQL error classification and the JSON error channel.
//!
//! Every SQL primitive returns a [`QueryError`] carrying the human message,
//! the MySQL errno when the server produced one, and a coarse classification
//! that drives retry and downgrade decisions: connector-level network errors
//! and server-side statement timeouts are retryable under a time budget,
//! access-denied errors are downgraded for privileged probes, everything else
//! fails the current operation.

use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

/// Server aborted the statement because `max_statement_time` elapsed.
pub const ER_STATEMENT_TIMEOUT: u32 = 1969;
/// Access denied for user (authentication).
pub const ER_ACCESS_DENIED_ERROR: u32 = 1045;
/// Access denied to a database.
pub const ER_DBACCESS_DENIED_ERROR: u32 = 1044;
/// Access denied to a table.
pub const ER_TABLEACCESS_DENIED_ERROR: u32 = 1142;
/// Access denied to a column.
pub const ER_COLUMNACCESS_DENIED_ERROR: u32 = 1143;
/// Operation requires a privilege the user lacks (e.g. SUPER).
pub const ER_SPECIFIC_ACCESS_DENIED_ERROR: u32 = 1227;

/// Coarse failure class of one SQL call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Connector-level failure: connection refused, reset, or the client-side
    /// read timeout elapsed. The statement may still complete on the server.
    Network,
    /// The server interrupted the statement via `max_statement_time`.
    StatementTimeout,
    /// The monitor user lacks a privilege for this statement.
    AccessDenied,
    /// Any other error reported by the server or the driver.
    Server,
    /// The query succeeded but its result did not have the expected shape
    /// (row data where none was expected, missing columns, too few columns).
    UnexpectedResult,
    /// A retryable failure persisted until the time budget ran out.
    Deadline,
}

/// Failure of one SQL primitive against one backend.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct QueryError {
    pub message: String,
    /// MySQL server errno, 0 when the failure never reached the server.
    pub errno: u32,
    pub kind: QueryErrorKind,
}

impl QueryError {
    pub fn new(kind: QueryErrorKind, errno: u32, message: impl Into<String>) -> Self {
        Self { message: message.into(), errno, kind }
    }

    /// Classify a driver error for the statement `sql` on server `server`.
    pub fn from_sqlx(server: &str, sql: &str, err: &sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => {
                let errno = db
                    .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                    .map(|e| e.number() as u32)
                    .unwrap_or(0);
                let kind = match errno {
                    ER_STATEMENT_TIMEOUT => QueryErrorKind::StatementTimeout,
                    ER_ACCESS_DENIED_ERROR
                    | ER_DBACCESS_DENIED_ERROR
                    | ER_TABLEACCESS_DENIED_ERROR
                    | ER_COLUMNACCESS_DENIED_ERROR
                    | ER_SPECIFIC_ACCESS_DENIED_ERROR => QueryErrorKind::AccessDenied,
                    _ => QueryErrorKind::Server,
                };
                Self::new(
                    kind,
                    errno,
                    format!("Query '{sql}' failed on '{server}': '{}' ({errno}).", db.message()),
                )
            }
            sqlx::Error::Io(io) => Self::new(
                QueryErrorKind::Network,
                0,
                format!("Query '{sql}' failed on '{server}': connection error: {io}."),
            ),
            // Protocol and other driver-level failures are not transport
            // errors: retrying them within the budget cannot help, and the
            // session does not need to be rebuilt. The next tick retries.
            other => Self::new(
                QueryErrorKind::Server,
                0,
                format!("Query '{sql}' failed on '{server}': {other}."),
            ),
        }
    }

    /// The client-side read timeout elapsed while waiting for the server.
    pub fn client_timeout(server: &str, sql: &str, timeout: Duration) -> Self {
        Self::new(
            QueryErrorKind::Network,
            0,
            format!(
                "Query '{sql}' timed out on '{server}' after {:.1} seconds.",
                timeout.as_secs_f64()
            ),
        )
    }

    /// No live connection and reconnecting failed.
    pub fn connect(server: &str, err: &sqlx::Error) -> Self {
        Self::new(
            QueryErrorKind::Network,
            0,
            format!("Could not connect to '{server}': {err}."),
        )
    }

    pub fn is_network(&self) -> bool {
        self.kind == QueryErrorKind::Network
    }

    pub fn is_access_denied(&self) -> bool {
        self.kind == QueryErrorKind::AccessDenied
    }
}

/// Accumulates orchestration failures as JSON objects. Every failure is also
/// written to the log; the caller reads the collected array plus an overall
/// success flag.
#[derive(Debug, Default)]
pub struct ErrorSink {
    errors: Vec<Value>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure: logged once, appended once.
    pub fn push(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{message}");
        self.errors.push(json!({ "error": message }));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.errors.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_sink_collects_json_objects() {
        let mut sink = ErrorSink::new();
        assert!(sink.is_empty());
        sink.push("first failure");
        sink.push(format!("second failure on '{}'", "db1"));
        assert_eq!(sink.len(), 2);
        let json = sink.to_json();
        assert_eq!(json[0]["error"], "first failure");
        assert_eq!(json[1]["error"], "second failure on 'db1'");
    }

    #[test]
    fn test_client_timeout_is_network_kind() {
        let err = QueryError::client_timeout("db1", "FLUSH LOGS;", Duration::from_secs(5));
        assert!(err.is_network());
        assert_eq!(err.errno, 0);
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_driver_error_classification() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ));
        let err = QueryError::from_sqlx("db1", "SELECT 1;", &io);
        assert_eq!(err.kind, QueryErrorKind::Network);

        // A protocol-level failure is not a transport error: it must not be
        // retried under a budget and must not tear down the session.
        let protocol = sqlx::Error::Protocol("unexpected packet".to_string());
        let err = QueryError::from_sqlx("db1", "SELECT 1;", &protocol);
        assert_eq!(err.kind, QueryErrorKind::Server);
        assert!(!err.is_network());
    }
}
