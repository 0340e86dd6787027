//! Per-backend server agent.
//!
//! One agent owns one MariaDB session and a cache of everything the monitor
//! knows about that backend: identity variables, capabilities, GTID
//! positions and the slave connection array. The cache is refreshed by
//! [`ServerAgent::monitor_tick`]; the replication-related parts are published
//! under a lock in [`ServerShared`] so diagnostic readers on other threads
//! always see a consistent snapshot. Role and health flags live in the
//! lock-free status word of the same shared block.

mod events;
mod exec;
mod ops;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use sqlx::MySqlConnection;

use crate::config::{MonitorConfig, ServerAddress};
use crate::error::{QueryError, QueryErrorKind};
use crate::gtid::{GtidList, MissingDomainPolicy};
use crate::slave_status::{arrays_topology_equal, SlaveIoState, SlaveStatus, RLAG_UNDEFINED, SERVER_ID_UNKNOWN};
use crate::status::{self, StatusWord};
use crate::topology::NodeData;

pub use events::{BinlogMode, EventInfo};
pub use ops::ReadOnlySetting;

/// GTID domain placeholder before the first successful read.
pub const GTID_DOMAIN_UNKNOWN: i64 = -1;

const COLUMNS_ALL_SLAVES_STATUS: usize = 42;
const COLUMNS_SLAVE_STATUS: usize = 40;

/// What kind of backend the agent is talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerType {
    /// Not yet probed, or the probe failed.
    #[default]
    Unknown,
    /// A regular MariaDB/MySQL server.
    Normal,
    /// A binlog router, identified by the `@@maxscale_version` sentinel.
    BinlogRouter,
}

/// Feature set decoded from the server version string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Version 5.5 or later. Servers below this are ignored.
    pub basic_support: bool,
    /// MariaDB 10.0.2 or later: GTID and `SHOW ALL SLAVES STATUS`.
    pub gtid: bool,
    /// MariaDB 10.1.2 or later: `SET STATEMENT max_statement_time`.
    pub max_statement_time: bool,
}

impl Capabilities {
    /// Decode a version string such as `10.4.12-MariaDB-log`.
    pub fn from_version_string(version: &str) -> Capabilities {
        let Some((major, minor, patch)) = decode_version(version) else {
            return Capabilities::default();
        };
        let mut caps = Capabilities::default();
        caps.basic_support = major > 5 || (major == 5 && minor >= 5);
        let mariadb = version.to_ascii_lowercase().contains("mariadb");
        if caps.basic_support && mariadb && major >= 10 {
            caps.gtid = major > 10 || minor >= 1 || (minor == 0 && patch >= 2);
            caps.max_statement_time = major > 10 || minor >= 2 || (minor == 1 && patch >= 2);
        }
        caps
    }
}

fn decode_version(version: &str) -> Option<(u32, u32, u32)> {
    let numeric = version
        .split(|c: char| c == '-' || c == '_' || c.is_ascii_whitespace())
        .next()?;
    let mut fields = numeric.split('.');
    let major = fields.next()?.parse().ok()?;
    let minor = fields.next()?.parse().ok()?;
    let patch = fields.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some((major, minor, patch))
}

/// Replication settings relevant for promotion decisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicationSettings {
    pub gtid_strict_mode: bool,
    pub log_bin: bool,
    pub log_slave_updates: bool,
}

/// Cheap cross-agent reference. Channels and plans name servers instead of
/// borrowing them, so operations can walk the agent array one mutable borrow
/// at a time.
#[derive(Debug, Clone)]
pub struct ServerRef {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub server_id: i64,
}

/// The replication state trio published to concurrent readers.
#[derive(Debug, Clone, Default)]
pub struct ReplicationSnapshot {
    pub slave_status: Vec<SlaveStatus>,
    pub gtid_current_pos: GtidList,
    pub gtid_binlog_pos: GtidList,
}

/// Per-server state shared with other threads: the routing-plane status word
/// and the lock-guarded replication snapshot.
#[derive(Debug, Default)]
pub struct ServerShared {
    status: StatusWord,
    repl: Mutex<ReplicationSnapshot>,
}

impl ServerShared {
    pub fn status(&self) -> &StatusWord {
        &self.status
    }

    /// Consistent copy of the slave array and both GTID positions.
    pub fn replication_snapshot(&self) -> ReplicationSnapshot {
        self.repl.lock().clone()
    }
}

/// Monitoring and manipulation engine for one backend server.
pub struct ServerAgent {
    name: String,
    host: String,
    port: u16,
    user: String,
    password: String,
    query_timeout: Duration,
    assume_unique_hostnames: bool,
    query_events: bool,

    conn: Option<MySqlConnection>,

    version: String,
    srv_type: ServerType,
    capabilities: Capabilities,
    pub(crate) rpl_settings: ReplicationSettings,

    server_id: i64,
    read_only: bool,
    gtid_domain_id: i64,
    enabled_events: HashSet<String>,

    topology_changed: bool,
    /// Cleared after logging one update failure; reset by the next success
    /// so a continuous failure run produces a single log line.
    log_update_errors: bool,
    prev_status: u64,

    pub(crate) node: NodeData,
    shared: Arc<ServerShared>,
}

impl ServerAgent {
    pub fn new(address: &ServerAddress, config: &MonitorConfig) -> ServerAgent {
        ServerAgent {
            name: address.name.clone(),
            host: address.host.clone(),
            port: address.port,
            user: config.user.clone(),
            password: config.password.clone(),
            query_timeout: Duration::from_secs(config.query_timeout_secs),
            assume_unique_hostnames: config.assume_unique_hostnames,
            query_events: config.handle_events,
            conn: None,
            version: String::new(),
            srv_type: ServerType::Unknown,
            capabilities: Capabilities::default(),
            rpl_settings: ReplicationSettings::default(),
            server_id: SERVER_ID_UNKNOWN,
            read_only: false,
            gtid_domain_id: GTID_DOMAIN_UNKNOWN,
            enabled_events: HashSet::new(),
            topology_changed: false,
            log_update_errors: true,
            prev_status: 0,
            node: NodeData::default(),
            shared: Arc::new(ServerShared::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn server_id(&self) -> i64 {
        self.server_id
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn server_type(&self) -> ServerType {
        self.srv_type
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn enabled_events(&self) -> &HashSet<String> {
        &self.enabled_events
    }

    pub fn shared(&self) -> Arc<ServerShared> {
        Arc::clone(&self.shared)
    }

    pub fn server_ref(&self) -> ServerRef {
        ServerRef {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            server_id: self.server_id,
        }
    }

    /// True when any role-shaping attribute changed since the flag was last
    /// taken.
    pub fn take_topology_changed(&mut self) -> bool {
        std::mem::take(&mut self.topology_changed)
    }

    pub(crate) fn mark_topology_changed(&mut self) {
        self.topology_changed = true;
    }

    // Status word accessors. `prev_status` freezes the word at tick start so
    // edge-triggered logging can compare against the previous round.

    pub fn has_status(&self, bits: u64) -> bool {
        self.shared.status.has(bits)
    }

    pub fn had_status(&self, bits: u64) -> bool {
        self.prev_status & bits == bits
    }

    pub fn set_status(&self, bits: u64) {
        self.shared.status.set(bits);
    }

    pub fn clear_status(&self, bits: u64) {
        self.shared.status.clear(bits);
    }

    /// Replace the role bits, leaving health and maintenance flags alone.
    pub fn store_roles(&self, roles: u64) {
        self.shared.status.store_roles(roles);
    }

    pub fn is_master(&self) -> bool {
        self.has_status(status::MASTER)
    }

    pub fn is_slave(&self) -> bool {
        self.has_status(status::SLAVE)
    }

    pub fn is_relay_master(&self) -> bool {
        self.has_status(status::RELAY_MASTER)
    }

    pub fn is_running(&self) -> bool {
        self.has_status(status::RUNNING)
    }

    pub fn is_down(&self) -> bool {
        !self.is_running()
    }

    pub fn is_in_maintenance(&self) -> bool {
        self.has_status(status::MAINTENANCE)
    }

    /// Running and not in maintenance.
    pub fn is_usable(&self) -> bool {
        self.is_running() && !self.is_in_maintenance()
    }

    pub fn is_low_on_disk_space(&self) -> bool {
        self.has_status(status::DISK_SPACE_EXHAUSTED)
    }

    pub fn binlog_on(&self) -> bool {
        self.rpl_settings.log_bin
    }

    // Cache snapshots.

    pub fn slave_status_snapshot(&self) -> Vec<SlaveStatus> {
        self.shared.repl.lock().slave_status.clone()
    }

    pub fn gtid_current_pos(&self) -> GtidList {
        self.shared.repl.lock().gtid_current_pos.clone()
    }

    pub fn gtid_binlog_pos(&self) -> GtidList {
        self.shared.repl.lock().gtid_binlog_pos.clone()
    }

    /// Unprocessed relay log events of one channel: events the IO thread has
    /// fetched but the SQL thread has not applied. Domains where the applied
    /// position is ahead of the IO position are treated as processed; that
    /// can happen when a domain is replicated through several masters.
    pub fn relay_log_events(&self, channel: &SlaveStatus) -> u64 {
        let current = self.gtid_current_pos();
        channel
            .gtid_io_pos
            .events_ahead(&current, MissingDomainPolicy::Ignore)
    }

    /// Attempt to (re)connect. Used by the monitor pass to maintain the
    /// `RUNNING` bit before issuing queries.
    pub async fn ensure_connected(&mut self) -> Result<(), QueryError> {
        self.connection().await.map(|_| ())
    }

    /// One monitor pass over this backend: maintain the connection and the
    /// `RUNNING` bit, probe version and permissions on a fresh connection,
    /// then refresh all cached state. Query errors are recorded and logged
    /// once per continuous failure run.
    pub async fn monitor_tick(&mut self) {
        self.prev_status = self.shared.status.load();

        if let Err(err) = self.ensure_connected().await {
            self.clear_status(status::RUNNING);
            if self.had_status(status::RUNNING) {
                tracing::warn!(server = %self.name, "server is down: {err}");
            }
            return;
        }

        let was_down = !self.has_status(status::RUNNING);
        self.set_status(status::RUNNING);
        if was_down {
            self.update_server_version().await;
            self.check_permissions().await;
        } else if self.srv_type == ServerType::Unknown {
            self.update_server_version().await;
        }

        match self.update_state().await {
            Ok(()) => self.log_update_errors = true,
            Err(err) => {
                if self.log_update_errors {
                    tracing::warn!(server = %self.name, "Error during monitor update: {err}");
                    self.log_update_errors = false;
                }
            }
        }
    }

    async fn update_state(&mut self) -> Result<(), QueryError> {
        match self.srv_type {
            ServerType::BinlogRouter => self.update_slave_status().await,
            ServerType::Normal if self.capabilities.basic_support => {
                self.read_server_variables().await?;
                self.update_slave_status().await?;
                if self.capabilities.gtid {
                    self.update_gtids().await?;
                }
                if self.query_events {
                    self.update_enabled_events().await?;
                }
                Ok(())
            }
            // Unsupported or unprobed server, nothing to refresh.
            _ => Ok(()),
        }
    }

    /// Probe what kind of server this is and which features it offers. The
    /// binlog router is detected by its sentinel variable; everything else is
    /// decoded from the version string.
    pub(crate) async fn update_server_version(&mut self) {
        self.srv_type = ServerType::Unknown;
        match self.execute_query("SELECT @@maxscale_version;").await {
            Ok(_) => {
                self.srv_type = ServerType::BinlogRouter;
                return;
            }
            Err(err) if err.is_network() => return,
            Err(_) => {}
        }

        self.srv_type = ServerType::Normal;
        self.capabilities = Capabilities::default();
        match self.execute_query("SELECT @@version;").await {
            Ok(result) => {
                if let Some(row) = result.rows().next() {
                    let version = row.string(0);
                    self.capabilities = Capabilities::from_version_string(&version);
                    if !self.capabilities.basic_support {
                        tracing::error!(
                            server = %self.name,
                            version = %version,
                            "server version is below 5.5 and is ignored by the monitor"
                        );
                    }
                    self.version = version;
                }
            }
            Err(err) => {
                tracing::warn!(server = %self.name, "could not read server version: {err}");
                self.srv_type = ServerType::Unknown;
            }
        }
    }

    /// Read `server_id`, `read_only` and, when supported, the GTID domain.
    pub(crate) async fn read_server_variables(&mut self) -> Result<(), QueryError> {
        let use_gtid = self.capabilities.gtid;
        let query = if use_gtid {
            "SELECT @@global.server_id, @@read_only, @@global.gtid_domain_id;"
        } else {
            "SELECT @@global.server_id, @@read_only;"
        };
        let result = self.execute_query(query).await?;
        let Some(row) = result.rows().next() else {
            return Err(QueryError::new(
                QueryErrorKind::UnexpectedResult,
                0,
                format!("'{query}' returned no rows on '{}'.", self.name),
            ));
        };

        let mut valid = true;
        let mut server_id = row.int(0);
        if server_id < 0 {
            // Requires an error in the server or the connector.
            server_id = SERVER_ID_UNKNOWN;
            valid = false;
        }
        if server_id != self.server_id {
            self.server_id = server_id;
            self.topology_changed = true;
        }

        let read_only = row.bool(1);
        if read_only != self.read_only {
            self.read_only = read_only;
            self.topology_changed = true;
        }

        if use_gtid {
            let mut domain = row.int(2);
            if domain < 0 {
                domain = GTID_DOMAIN_UNKNOWN;
                valid = false;
            }
            self.gtid_domain_id = domain;
        } else {
            self.gtid_domain_id = GTID_DOMAIN_UNKNOWN;
        }

        if valid {
            Ok(())
        } else {
            Err(QueryError::new(
                QueryErrorKind::UnexpectedResult,
                0,
                format!("'{query}' returned invalid data on '{}'.", self.name),
            ))
        }
    }

    /// Read both GTID positions. A result with zero rows means the server
    /// has no GTIDs at all.
    pub(crate) async fn update_gtids(&mut self) -> Result<(), QueryError> {
        let query = "SELECT @@gtid_current_pos, @@gtid_binlog_pos;";
        let result = self.execute_query(query).await?;

        let mut repl = self.shared.repl.lock();
        match result.rows().next() {
            Some(row) => {
                repl.gtid_current_pos = GtidList::from_string(&row.string(0));
                repl.gtid_binlog_pos = GtidList::from_string(&row.string(1));
            }
            None => {
                repl.gtid_current_pos = GtidList::default();
                repl.gtid_binlog_pos = GtidList::default();
            }
        }
        Ok(())
    }

    /// Read the settings a promotion decision depends on.
    pub(crate) async fn update_replication_settings(&mut self) -> Result<(), QueryError> {
        let query = "SELECT @@gtid_strict_mode, @@log_bin, @@log_slave_updates;";
        let result = self.execute_query(query).await?;
        let Some(row) = result.rows().next() else {
            return Err(QueryError::new(
                QueryErrorKind::UnexpectedResult,
                0,
                format!("'{query}' returned no rows on '{}'.", self.name),
            ));
        };
        self.rpl_settings.gtid_strict_mode = row.bool(0);
        self.rpl_settings.log_bin = row.bool(1);
        self.rpl_settings.log_slave_updates = row.bool(2);
        Ok(())
    }

    /// Warn about settings that make a server a fragile promotion candidate.
    pub fn warn_replication_settings(&self) {
        if !self.rpl_settings.gtid_strict_mode {
            tracing::warn!(
                server = %self.name,
                "slave has gtid_strict_mode disabled; enabling this setting is recommended"
            );
        }
        if !self.rpl_settings.log_slave_updates {
            tracing::warn!(
                server = %self.name,
                "slave has log_slave_updates disabled; replication will break for lagging slaves if it is promoted"
            );
        }
    }

    pub(crate) async fn update_slave_status(&mut self) -> Result<(), QueryError> {
        self.do_show_slave_status().await
    }

    /// Query and rebuild the slave connection array, carrying sticky fields
    /// over from the previous tick's rows.
    pub(crate) async fn do_show_slave_status(&mut self) -> Result<(), QueryError> {
        let (query, expected_columns, all_slaves) =
            if self.capabilities.gtid || self.srv_type == ServerType::BinlogRouter {
                ("SHOW ALL SLAVES STATUS;", COLUMNS_ALL_SLAVES_STATUS, true)
            } else {
                ("SHOW SLAVE STATUS;", COLUMNS_SLAVE_STATUS, false)
            };

        let result = self.execute_query(query).await?;
        let old = self.slave_status_snapshot();
        let mut new_array: Vec<SlaveStatus> = Vec::new();

        if result.row_count() > 0 {
            if result.col_count() < expected_columns {
                return Err(QueryError::new(
                    QueryErrorKind::UnexpectedResult,
                    0,
                    format!(
                        "'{query}' returned less than the expected amount of columns. Expected {expected_columns}, got {}.",
                        result.col_count()
                    ),
                ));
            }

            let col = |name: &str| {
                result.get_col_index(name).ok_or_else(|| {
                    QueryError::new(
                        QueryErrorKind::UnexpectedResult,
                        0,
                        format!("'{query}' returned invalid data: no '{name}' column."),
                    )
                })
            };
            let i_master_host = col("Master_Host")?;
            let i_master_port = col("Master_Port")?;
            let i_slave_io_running = col("Slave_IO_Running")?;
            let i_slave_sql_running = col("Slave_SQL_Running")?;
            let i_master_server_id = col("Master_Server_Id")?;
            let i_last_io_error = col("Last_IO_Error")?;
            let i_last_sql_error = col("Last_SQL_Error")?;
            let i_seconds_behind = col("Seconds_Behind_Master")?;
            let extended = if all_slaves {
                Some((
                    col("Connection_name")?,
                    col("Slave_received_heartbeats")?,
                    col("Using_Gtid")?,
                    col("Gtid_IO_Pos")?,
                ))
            } else {
                None
            };

            for row in result.rows() {
                let mut new_row = SlaveStatus::new(&self.name);
                new_row.master_host = row.string(i_master_host);
                new_row.master_port = row.int(i_master_port).clamp(0, u16::MAX as i64) as u16;

                let io_error = row.string(i_last_io_error);
                let sql_error = row.string(i_last_sql_error);
                new_row.last_error = if io_error.is_empty() { sql_error } else { io_error };

                new_row.io_state = SlaveIoState::from_show_status(&row.string(i_slave_io_running));
                new_row.sql_running = row.string(i_slave_sql_running) == "Yes";
                new_row.master_server_id = row.int(i_master_server_id);

                // A stopped connection reports NULL lag, which decodes to -1.
                let rlag = row.int(i_seconds_behind);
                new_row.seconds_behind_master = if rlag < 0 {
                    RLAG_UNDEFINED
                } else {
                    rlag.min(i32::MAX as i64) as i32
                };

                if let Some((i_name, i_heartbeats, i_using_gtid, i_io_pos)) = extended {
                    new_row.name = row.string(i_name);
                    new_row.received_heartbeats = row.int(i_heartbeats).max(0) as u64;
                    let using_gtid = row.string(i_using_gtid);
                    let io_pos = row.string(i_io_pos);
                    if !io_pos.is_empty()
                        && (using_gtid == "Current_Pos" || using_gtid == "Slave_Pos")
                    {
                        new_row.gtid_io_pos = GtidList::from_string(&io_pos);
                    }
                }

                let old_row = find_previous_row(&old, &new_row, new_array.len());
                if let Some(old_row) = old_row {
                    // No heartbeat and no IO progress since last tick: the
                    // channel is not receiving data, keep the old timestamp.
                    if new_row.received_heartbeats == old_row.received_heartbeats
                        && new_row.gtid_io_pos == old_row.gtid_io_pos
                    {
                        new_row.last_data_time = old_row.last_data_time;
                    }
                }

                match new_row.io_state {
                    SlaveIoState::Yes => {
                        if new_row.master_server_id > 0 {
                            new_row.seen_connected = true;
                        }
                    }
                    SlaveIoState::Connecting => {
                        // The id may be stale if the connection was cleared
                        // and remade between ticks, so only carry the latch
                        // when the id is unchanged.
                        if let Some(old_row) = old_row {
                            if new_row.master_server_id == old_row.master_server_id
                                && old_row.seen_connected
                            {
                                new_row.seen_connected = true;
                            }
                        }
                    }
                    SlaveIoState::No => {}
                }

                new_array.push(new_row);
            }
        }

        if !arrays_topology_equal(&old, &new_array) {
            self.topology_changed = true;
        }

        // Always publish: even a topology-equal array carries fresh GTID
        // positions and heartbeat counters.
        self.shared.repl.lock().slave_status = new_array;
        Ok(())
    }

    /// Names of all enabled scheduled events, schema-qualified. Kept current
    /// so a promotion can re-enable exactly what the old master ran.
    pub(crate) async fn update_enabled_events(&mut self) -> Result<(), QueryError> {
        let query = "SELECT Event_schema, Event_name FROM information_schema.EVENTS \
                     WHERE Status = 'ENABLED';";
        let result = self.execute_query(query).await?;
        let mut names = HashSet::with_capacity(result.row_count());
        for row in result.rows() {
            names.insert(format!("{}.{}", row.string(0), row.string(1)));
        }
        self.enabled_events = names;
        Ok(())
    }

    /// Probe that the monitor user can run the queries the tick depends on.
    /// Failures set the auth-error bit; the log line fires only on the edge.
    pub async fn check_permissions(&mut self) {
        match self.execute_query("SHOW SLAVE STATUS;").await {
            Ok(_) => self.clear_status(status::AUTH_ERROR),
            Err(err) => {
                self.set_status(status::AUTH_ERROR);
                if !self.had_status(status::AUTH_ERROR) {
                    tracing::warn!(
                        server = %self.name,
                        "Error during monitor permissions test: {err}"
                    );
                }
            }
        }
    }

    /// This server's channel to `target`, if one is live. When hostnames are
    /// unique the lookup compares endpoints; otherwise it falls back to the
    /// master server id, which requires the channel to have been seen
    /// connected.
    pub fn slave_connection_status(&self, target: &ServerRef) -> Option<SlaveStatus> {
        let repl = self.shared.repl.lock();
        let found = if self.assume_unique_hostnames {
            repl.slave_status.iter().find(|conn| {
                conn.targets(&target.host, target.port)
                    && conn.sql_running
                    && conn.io_state.is_running()
            })
        } else {
            repl.slave_status.iter().find(|conn| {
                conn.master_server_id > 0
                    && conn.master_server_id == target.server_id
                    && conn.sql_running
                    && conn.seen_connected
                    && conn.io_state.is_running()
            })
        };
        found.cloned()
    }

    /// This server's channel to the given endpoint regardless of state.
    pub fn slave_connection_status_host_port(&self, target: &ServerRef) -> Option<SlaveStatus> {
        let repl = self.shared.repl.lock();
        repl.slave_status
            .iter()
            .find(|conn| conn.targets(&target.host, target.port))
            .cloned()
    }

    /// Aligned human-readable description for the diagnostic interface.
    pub fn diagnostics(&self) -> String {
        let mut out = String::with_capacity(300);
        out.push_str(&format!("{:<23} {}\n", "Server:", self.name));
        out.push_str(&format!("{:<23} {}\n", "Server ID:", self.server_id));
        out.push_str(&format!(
            "{:<23} {}\n",
            "Read only:",
            if self.read_only { "Yes" } else { "No" }
        ));

        let repl = self.shared.repl.lock();
        if !repl.gtid_current_pos.is_empty() {
            out.push_str(&format!(
                "{:<23} {}\n",
                "Gtid current position:", repl.gtid_current_pos
            ));
        }
        if !repl.gtid_binlog_pos.is_empty() {
            out.push_str(&format!(
                "{:<23} {}\n",
                "Gtid binlog position:", repl.gtid_binlog_pos
            ));
        }
        if let Some(cycle) = self.node.cycle_id() {
            out.push_str(&format!("{:<23} {}\n", "Master group:", cycle));
        }

        if repl.slave_status.is_empty() {
            out.push_str("No slave connections\n");
        } else {
            out.push_str("Slave connections:\n");
            for conn in &repl.slave_status {
                out.push_str(&conn.to_short_string());
                out.push('\n');
            }
        }
        out
    }

    /// Diagnostic JSON export of this agent.
    pub fn to_json(&self) -> Value {
        let repl = self.shared.repl.lock();
        json!({
            "name": self.name,
            "server_id": self.server_id,
            "read_only": self.read_only,
            "gtid_current_pos":
                if repl.gtid_current_pos.is_empty() {
                    Value::Null
                } else {
                    json!(repl.gtid_current_pos.to_string())
                },
            "gtid_binlog_pos":
                if repl.gtid_binlog_pos.is_empty() {
                    Value::Null
                } else {
                    json!(repl.gtid_binlog_pos.to_string())
                },
            "master_group": match self.node.cycle_id() {
                Some(cycle) => json!(cycle),
                None => Value::Null,
            },
            "slave_connections":
                repl.slave_status.iter().map(|c| c.to_json()).collect::<Vec<_>>(),
        })
    }
}

/// Find the previous tick's row for the same channel, identified by the
/// master endpoint. The positional hint covers the common case of a stable
/// array; the scan covers insertions and removals.
fn find_previous_row<'a>(
    old: &'a [SlaveStatus],
    search: &SlaveStatus,
    hint: usize,
) -> Option<&'a SlaveStatus> {
    if let Some(row) = old.get(hint) {
        if row.targets(&search.master_host, search.master_port) {
            return Some(row);
        }
    }
    old.iter()
        .find(|row| row.targets(&search.master_host, search.master_port))
}

#[cfg(test)]
impl ServerAgent {
    /// Build a connectionless agent with the given identity for tests.
    pub(crate) fn mock(name: &str, host: &str, port: u16, server_id: i64) -> ServerAgent {
        let config = MonitorConfig::for_single_server(name, host, port);
        let mut agent = ServerAgent::new(&config.servers[0], &config);
        agent.srv_type = ServerType::Normal;
        agent.capabilities = Capabilities {
            basic_support: true,
            gtid: true,
            max_statement_time: true,
        };
        agent.server_id = server_id;
        agent.rpl_settings = ReplicationSettings {
            gtid_strict_mode: true,
            log_bin: true,
            log_slave_updates: true,
        };
        agent.set_status(status::RUNNING);
        agent
    }

    pub(crate) fn mock_channel_to(&mut self, master: &ServerRef) {
        let mut row = SlaveStatus::new(self.name.clone());
        row.name = format!("to-{}", master.name);
        row.master_host = master.host.clone();
        row.master_port = master.port;
        row.master_server_id = master.server_id;
        row.io_state = SlaveIoState::Yes;
        row.sql_running = true;
        row.seen_connected = true;
        row.gtid_io_pos = GtidList::from_string("0-1-1");
        self.shared.repl.lock().slave_status.push(row);
    }

    pub(crate) fn set_mock_gtids(&mut self, current: &str, binlog: &str) {
        let mut repl = self.shared.repl.lock();
        repl.gtid_current_pos = GtidList::from_string(current);
        repl.gtid_binlog_pos = GtidList::from_string(binlog);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_decode_capabilities() {
        let caps = Capabilities::from_version_string("10.4.12-MariaDB-log");
        assert!(caps.basic_support && caps.gtid && caps.max_statement_time);

        let caps = Capabilities::from_version_string("10.0.2-MariaDB");
        assert!(caps.basic_support && caps.gtid);
        assert!(!caps.max_statement_time);

        let caps = Capabilities::from_version_string("10.1.2-MariaDB");
        assert!(caps.gtid && caps.max_statement_time);

        // MySQL has basic support only, regardless of version.
        let caps = Capabilities::from_version_string("8.0.32");
        assert!(caps.basic_support);
        assert!(!caps.gtid && !caps.max_statement_time);

        let caps = Capabilities::from_version_string("5.1.73");
        assert!(!caps.basic_support);

        assert_eq!(
            Capabilities::from_version_string("garbage"),
            Capabilities::default()
        );
    }

    #[test]
    fn test_find_previous_row_prefers_hint() {
        let refs = [
            ("db1", 3306u16),
            ("db2", 3306),
            ("db3", 3306),
        ];
        let old: Vec<SlaveStatus> = refs
            .iter()
            .map(|(host, port)| {
                let mut row = SlaveStatus::new("me");
                row.master_host = host.to_string();
                row.master_port = *port;
                row
            })
            .collect();

        let mut search = SlaveStatus::new("me");
        search.master_host = "db2".to_string();
        search.master_port = 3306;

        let hit = find_previous_row(&old, &search, 1).expect("row found");
        assert_eq!(hit.master_host, "db2");

        // Wrong hint falls back to the scan.
        let hit = find_previous_row(&old, &search, 0).expect("row found");
        assert_eq!(hit.master_host, "db2");

        search.master_host = "absent".to_string();
        assert!(find_previous_row(&old, &search, 0).is_none());
    }

    #[test]
    fn test_mock_agent_reports_roles_from_status_word() {
        let agent = ServerAgent::mock("db1", "db1.local", 3306, 1);
        assert!(agent.is_running());
        assert!(!agent.is_master());
        agent.set_status(status::MASTER);
        assert!(agent.is_master());
        agent.clear_status(status::MASTER);
        agent.set_status(status::MAINTENANCE);
        assert!(!agent.is_usable());
    }

    #[test]
    fn test_json_export_shape() {
        let mut agent = ServerAgent::mock("db1", "db1.local", 3306, 1);
        agent.set_mock_gtids("0-1-42", "0-1-42");
        let json = agent.to_json();
        assert_eq!(json["name"], "db1");
        assert_eq!(json["server_id"], 1);
        assert_eq!(json["read_only"], false);
        assert_eq!(json["gtid_current_pos"], "0-1-42");
        assert_eq!(json["master_group"], Value::Null);
        assert!(json["slave_connections"].as_array().unwrap().is_empty());
    }
}
