//! Scheduled server event handling.
//!
//! During a role swap the old master's events must stop firing and the new
//! master must pick them up. Events are altered through `ALTER DEFINER = ...
//! EVENT` with the definer quoted explicitly: a plain `ALTER EVENT` would
//! silently reassign the event to the monitor user, which may not have the
//! privileges the event body needs.

use std::collections::HashSet;

use super::ServerAgent;
use crate::error::{ErrorSink, QueryError};

/// Whether event disablement may write to the binary log. A server being
/// rejoined to the cluster must not generate new GTID events, so the
/// disable pass runs with the session binlog off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinlogMode {
    On,
    Off,
}

/// One scheduled event as read from `information_schema.EVENTS`.
#[derive(Debug, Clone)]
pub struct EventInfo {
    /// Schema-qualified name, `schema.event`.
    pub name: String,
    pub definer: String,
    pub status: String,
}

/// Quote an event definer for `ALTER DEFINER`. The host part may contain
/// `%`, so it is always single-quoted; a definer without a host is used
/// verbatim.
fn quote_definer(definer: &str) -> String {
    match definer.find('@') {
        Some(at) => format!("{}'{}'", &definer[..at + 1], &definer[at + 1..]),
        None => definer.to_string(),
    }
}

impl ServerAgent {
    /// Read all scheduled events on the server.
    async fn list_events(&mut self) -> Result<Vec<EventInfo>, QueryError> {
        let query = "SELECT * FROM information_schema.EVENTS;";
        let result = self.execute_query(query).await?;
        if result.row_count() == 0 {
            return Ok(Vec::new());
        }

        let col = |name: &str| {
            result.get_col_index(name).ok_or_else(|| {
                QueryError::new(
                    crate::error::QueryErrorKind::UnexpectedResult,
                    0,
                    format!("'{query}' returned invalid data: no '{name}' column."),
                )
            })
        };
        let i_schema = col("EVENT_SCHEMA")?;
        let i_name = col("EVENT_NAME")?;
        let i_definer = col("DEFINER")?;
        let i_status = col("STATUS")?;

        Ok(result
            .rows()
            .map(|row| EventInfo {
                name: format!("{}.{}", row.string(i_schema), row.string(i_name)),
                definer: row.string(i_definer),
                status: row.string(i_status),
            })
            .collect())
    }

    /// Set the status of one event, keeping its definer.
    async fn alter_event(
        &mut self,
        event: &EventInfo,
        target_status: &str,
        errors: &mut ErrorSink,
    ) -> bool {
        let query = format!(
            "ALTER DEFINER = {} EVENT {} {};",
            quote_definer(&event.definer),
            event.name,
            target_status
        );
        match self.execute_cmd(&query).await {
            Ok(()) => {
                tracing::info!(
                    server = %self.name,
                    event = %event.name,
                    "event set to '{target_status}'"
                );
                true
            }
            Err(err) => {
                errors.push(format!(
                    "Could not alter event '{}' on server '{}': {err}",
                    event.name, self.name
                ));
                false
            }
        }
    }

    /// Enable the named events that are currently disabled. Used on the
    /// promotion target with the event set recorded from the old master.
    pub(crate) async fn enable_events(
        &mut self,
        event_names: &HashSet<String>,
        errors: &mut ErrorSink,
    ) -> bool {
        let events = match self.list_events().await {
            Ok(events) => events,
            Err(err) => {
                tracing::error!(server = %self.name, "Could not query event status: {err}");
                return false;
            }
        };

        let mut found_disabled = 0;
        let mut enabled = 0;
        for event in &events {
            if event_names.contains(&event.name)
                && (event.status == "SLAVESIDE_DISABLED" || event.status == "DISABLED")
            {
                found_disabled += 1;
                if self.alter_event(event, "ENABLE", errors).await {
                    enabled += 1;
                }
            }
        }
        if found_disabled > 0 {
            self.warn_event_scheduler().await;
        }
        found_disabled == enabled
    }

    /// Disable every enabled event, marking them slave-side disabled so a
    /// later promotion can find them again.
    pub(crate) async fn disable_events(
        &mut self,
        binlog_mode: BinlogMode,
        errors: &mut ErrorSink,
    ) -> bool {
        if binlog_mode == BinlogMode::Off {
            if let Err(err) = self.execute_cmd("SET @@session.sql_log_bin=0;").await {
                errors.push(format!(
                    "Could not disable session binlog on '{}': {err} Server events not disabled.",
                    self.name
                ));
                return false;
            }
        }

        let mut rval = false;
        match self.list_events().await {
            Ok(events) => {
                let mut found_enabled = 0;
                let mut disabled = 0;
                for event in &events {
                    if event.status == "ENABLED" {
                        found_enabled += 1;
                        if self.alter_event(event, "DISABLE ON SLAVE", errors).await {
                            disabled += 1;
                        }
                    }
                }
                if found_enabled > 0 {
                    self.warn_event_scheduler().await;
                }
                rval = found_enabled == disabled;
            }
            Err(err) => {
                tracing::error!(server = %self.name, "Could not query event status: {err}");
            }
        }

        if binlog_mode == BinlogMode::Off {
            // The monitor should not be generating binlog events either way,
            // so a failed restore is not an error.
            let _ = self.execute_cmd("SET @@session.sql_log_bin=1;").await;
        }
        rval
    }

    /// Warn if events exist but the event scheduler is not running.
    async fn warn_event_scheduler(&mut self) {
        let query = "SELECT * FROM information_schema.PROCESSLIST \
                     WHERE User = 'event_scheduler' AND Command = 'Daemon';";
        match self.execute_query(query).await {
            Ok(result) => {
                if result.row_count() < 1 {
                    tracing::warn!(
                        server = %self.name,
                        "event scheduler is inactive although events were found"
                    );
                }
            }
            Err(err) => {
                tracing::error!(
                    server = %self.name,
                    "could not query the event scheduler status: {err}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_definer_quotes_host() {
        assert_eq!(quote_definer("admin@%"), "admin@'%'");
        assert_eq!(quote_definer("admin@10.0.0.%"), "admin@'10.0.0.%'");
        assert_eq!(quote_definer("admin@localhost"), "admin@'localhost'");
    }

    #[test]
    fn test_quote_definer_without_host() {
        assert_eq!(quote_definer("admin"), "admin");
        // A trailing @ quotes an empty host.
        assert_eq!(quote_definer("admin@"), "admin@''");
    }
}
