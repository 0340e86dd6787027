//! One replica-side replication channel as reported by `SHOW SLAVE STATUS`.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::gtid::GtidList;

/// Server id placeholder before the first successful read.
pub const SERVER_ID_UNKNOWN: i64 = -1;
/// `Seconds_Behind_Master` when the connection is not running.
pub const RLAG_UNDEFINED: i32 = -1;

/// IO thread state of a slave connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveIoState {
    No,
    Connecting,
    Yes,
}

impl SlaveIoState {
    /// Decode the `Slave_IO_Running` column.
    pub fn from_show_status(text: &str) -> SlaveIoState {
        if text == "Yes" {
            SlaveIoState::Yes
        } else if text == "Connecting" || text == "Preparing" {
            SlaveIoState::Connecting
        } else {
            SlaveIoState::No
        }
    }

    pub fn is_running(self) -> bool {
        self != SlaveIoState::No
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SlaveIoState::No => "No",
            SlaveIoState::Connecting => "Connecting",
            SlaveIoState::Yes => "Yes",
        }
    }
}

/// Snapshot of one named replication channel on one server.
///
/// Rows are rebuilt from the backend every tick; `last_data_time` and
/// `seen_connected` are carried over from the previous tick's row with the
/// same `(master_host, master_port)` identity.
#[derive(Debug, Clone)]
pub struct SlaveStatus {
    /// Name of the server this channel lives on. Only the name is stored;
    /// consumers resolve it through the agent registry.
    pub owning_server: String,
    /// Connection name, empty for the default connection.
    pub name: String,
    pub master_host: String,
    pub master_port: u16,
    pub master_server_id: i64,
    pub io_state: SlaveIoState,
    pub sql_running: bool,
    pub seconds_behind_master: i32,
    pub gtid_io_pos: GtidList,
    pub received_heartbeats: u64,
    /// Last time the channel was seen receiving data from its master.
    pub last_data_time: DateTime<Utc>,
    /// Latched once the IO thread has been seen connected with a valid
    /// master server id. Survives `Connecting` phases of the same master.
    pub seen_connected: bool,
    /// Most recent IO or SQL thread error, IO taking precedence.
    pub last_error: String,
}

impl SlaveStatus {
    pub fn new(owning_server: impl Into<String>) -> Self {
        Self {
            owning_server: owning_server.into(),
            name: String::new(),
            master_host: String::new(),
            master_port: 0,
            master_server_id: SERVER_ID_UNKNOWN,
            io_state: SlaveIoState::No,
            sql_running: false,
            seconds_behind_master: RLAG_UNDEFINED,
            gtid_io_pos: GtidList::default(),
            received_heartbeats: 0,
            last_data_time: Utc::now(),
            seen_connected: false,
            last_error: String::new(),
        }
    }

    /// Channels are compared by the parts that shape the replication graph.
    pub fn topology_equal(&self, other: &SlaveStatus) -> bool {
        self.io_state == other.io_state
            && self.sql_running == other.sql_running
            && self.master_host == other.master_host
            && self.master_port == other.master_port
            && self.master_server_id == other.master_server_id
    }

    /// Whether this channel targets the given endpoint.
    pub fn targets(&self, host: &str, port: u16) -> bool {
        self.master_host == host && self.master_port == port
    }

    /// Whether this channel qualifies for copying to another server during a
    /// role swap. On rejection the reason is returned for the warning log.
    pub fn should_be_copied(&self) -> Result<(), String> {
        if !self.seen_connected {
            Err("it has never been seen connected to its master".to_string())
        } else if self.gtid_io_pos.is_empty() {
            Err("it is not using gtid".to_string())
        } else {
            Ok(())
        }
    }

    /// Short identifier used in log and error messages.
    pub fn to_short_string(&self) -> String {
        if self.name.is_empty() {
            format!(
                "Slave connection from {} to [{}]:{}",
                self.owning_server, self.master_host, self.master_port
            )
        } else {
            format!(
                "Slave connection '{}' from {} to [{}]:{}",
                self.name, self.owning_server, self.master_host, self.master_port
            )
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "connection_name": self.name,
            "master_host": self.master_host,
            "master_port": self.master_port,
            "master_server_id": self.master_server_id,
            "slave_io_running": self.io_state.as_str(),
            "slave_sql_running": if self.sql_running { "Yes" } else { "No" },
            "seconds_behind_master":
                if self.seconds_behind_master == RLAG_UNDEFINED {
                    Value::Null
                } else {
                    json!(self.seconds_behind_master)
                },
            "gtid_io_pos":
                if self.gtid_io_pos.is_empty() {
                    Value::Null
                } else {
                    json!(self.gtid_io_pos.to_string())
                },
            "last_error": self.last_error,
        })
    }
}

/// Elementwise topology comparison of two channel arrays. Differing lengths
/// compare unequal.
pub fn arrays_topology_equal(old: &[SlaveStatus], new: &[SlaveStatus]) -> bool {
    old.len() == new.len()
        && old
            .iter()
            .zip(new.iter())
            .all(|(a, b)| a.topology_equal(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(host: &str, port: u16, id: i64) -> SlaveStatus {
        let mut row = SlaveStatus::new("db1");
        row.master_host = host.to_string();
        row.master_port = port;
        row.master_server_id = id;
        row.io_state = SlaveIoState::Yes;
        row.sql_running = true;
        row
    }

    #[test]
    fn test_topology_equal_ignores_gtid_movement() {
        let mut a = channel("master1", 3306, 1);
        let mut b = channel("master1", 3306, 1);
        a.gtid_io_pos = GtidList::from_string("0-1-100");
        b.gtid_io_pos = GtidList::from_string("0-1-200");
        b.received_heartbeats = 42;
        assert!(a.topology_equal(&b));
    }

    #[test]
    fn test_topology_equal_detects_retarget_and_state_change() {
        let a = channel("master1", 3306, 1);

        let mut retargeted = a.clone();
        retargeted.master_host = "master2".to_string();
        assert!(!a.topology_equal(&retargeted));

        let mut stopped = a.clone();
        stopped.io_state = SlaveIoState::No;
        assert!(!a.topology_equal(&stopped));
    }

    #[test]
    fn test_arrays_topology_equal_checks_length() {
        let a = vec![channel("master1", 3306, 1)];
        let b = vec![channel("master1", 3306, 1), channel("master2", 3306, 2)];
        assert!(!arrays_topology_equal(&a, &b));
        assert!(arrays_topology_equal(&a, &a.clone()));
    }

    #[test]
    fn test_should_be_copied_filter() {
        let mut row = channel("master1", 3306, 1);
        assert!(row.should_be_copied().is_err());

        row.seen_connected = true;
        let reason = row.should_be_copied().unwrap_err();
        assert!(reason.contains("gtid"));

        row.gtid_io_pos = GtidList::from_string("0-1-5");
        assert!(row.should_be_copied().is_ok());
    }

    #[test]
    fn test_io_state_decoding() {
        assert_eq!(SlaveIoState::from_show_status("Yes"), SlaveIoState::Yes);
        assert_eq!(
            SlaveIoState::from_show_status("Connecting"),
            SlaveIoState::Connecting
        );
        assert_eq!(SlaveIoState::from_show_status("No"), SlaveIoState::No);
        assert_eq!(SlaveIoState::from_show_status(""), SlaveIoState::No);
    }
}
