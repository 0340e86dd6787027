//! Cluster manipulation operations of one server agent.
//!
//! Everything a role swap needs on a single server: the gate predicates that
//! decide whether a server may take part, stopping and recreating slave
//! connections, toggling `read_only`, waiting for GTID catchup, kicking out
//! privileged writers and running operator-supplied SQL files. All mutating
//! steps draw from the shared time budget in [`OperationContext`] and report
//! failures through its JSON error sink.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;

use super::{BinlogMode, ServerAgent, ServerRef};
use crate::error::ErrorSink;
use crate::gtid::{GtidList, MissingDomainPolicy};
use crate::orchestrator::{OperationContext, OperationKind, ServerOperation};
use crate::slave_status::{SlaveIoState, SlaveStatus};
use crate::status;

/// Target state for `SET GLOBAL read_only`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOnlySetting {
    Enable,
    Disable,
}

/// How far to tear down a slave connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    StopOnly,
    ResetAll,
}

impl ServerAgent {
    /// Can this server be demoted in a switchover? The server is alive, so
    /// its settings are re-read before deciding.
    pub async fn can_be_demoted_switchover(&mut self) -> Result<(), String> {
        if !self.is_usable() {
            return Err("it is not running or it is in maintenance.".to_string());
        }
        if let Err(err) = self.update_replication_settings().await {
            return Err(format!("it could not be queried: {err}"));
        }
        if !self.binlog_on() {
            return Err("its binary log is disabled.".to_string());
        }
        if !self.is_master() && !self.rpl_settings.log_slave_updates {
            // Without log_slave_updates the gtid_binlog_pos of a slave does
            // not cover replicated events and cannot serve as the catchup
            // target.
            return Err("it is not the master and log_slave_updates is disabled.".to_string());
        }
        if self.gtid_binlog_pos().is_empty() {
            return Err("it does not have a 'gtid_binlog_pos'.".to_string());
        }
        Ok(())
    }

    /// Can this server be demoted in a failover? It must be down, and its
    /// last observed binlog position is what the promotion target will be
    /// caught up against.
    pub fn can_be_demoted_failover(&self) -> Result<(), String> {
        if self.is_master() {
            return Err("it is a running master.".to_string());
        }
        if self.is_running() {
            return Err("it is running.".to_string());
        }
        if self.gtid_binlog_pos().is_empty() {
            return Err("it does not have a 'gtid_binlog_pos'.".to_string());
        }
        Ok(())
    }

    /// Can this server be promoted in place of `demotion_target`?
    pub async fn can_be_promoted(
        &mut self,
        kind: OperationKind,
        demotion_target: &ServerRef,
    ) -> Result<(), String> {
        let channel = self.slave_connection_status(demotion_target);
        if self.is_master() {
            return Err("it is already the master.".to_string());
        }
        if !self.is_usable() {
            return Err("it is down or in maintenance.".to_string());
        }
        if kind == OperationKind::Switchover && self.is_low_on_disk_space() {
            // A failover promotion with low disk space is still allowed since
            // it is better than having no master at all.
            return Err("it is low on disk space.".to_string());
        }
        let Some(channel) = channel else {
            return Err(format!("it is not replicating from '{}'.", demotion_target.name));
        };
        if channel.gtid_io_pos.is_empty() {
            return Err(format!(
                "its slave connection to '{}' is not using gtid.",
                demotion_target.name
            ));
        }
        if kind == OperationKind::Switchover && channel.io_state != SlaveIoState::Yes {
            return Err(format!(
                "its slave connection to '{}' is broken.",
                demotion_target.name
            ));
        }
        if let Err(err) = self.update_replication_settings().await {
            return Err(format!("it could not be queried: {err}"));
        }
        if !self.binlog_on() {
            return Err("its binary log is disabled.".to_string());
        }
        Ok(())
    }

    /// GTID-compatibility of this server with a master's binlog position.
    pub fn can_replicate_from(
        &self,
        master_name: &str,
        master_binlog_pos: &GtidList,
    ) -> Result<(), String> {
        let own_pos = self.gtid_current_pos();
        if own_pos.is_empty() {
            return Err(format!("'{}' does not have a valid gtid_current_pos.", self.name()));
        }
        if master_binlog_pos.is_empty() {
            return Err(format!("'{master_name}' does not have a valid gtid_binlog_pos."));
        }
        if !own_pos.can_replicate_from(master_binlog_pos) {
            return Err(format!(
                "gtid_current_pos of '{}' ({own_pos}) is incompatible with gtid_binlog_pos of '{master_name}' ({master_binlog_pos}).",
                self.name()
            ));
        }
        Ok(())
    }

    /// Set or clear `read_only`. Enabling can take a while when writes are in
    /// flight or table locks are held, so the command runs under the
    /// time-limited retry loop.
    pub(crate) async fn set_read_only(
        &mut self,
        setting: ReadOnlySetting,
        time_limit: Duration,
        errors: &mut ErrorSink,
    ) -> bool {
        let value = if setting == ReadOnlySetting::Enable { 1 } else { 0 };
        let cmd = format!("SET GLOBAL read_only={value};");
        match self.execute_cmd_time_limit(&cmd, time_limit).await {
            Ok(()) => true,
            Err(err) => {
                let verb = if setting == ReadOnlySetting::Enable { "enable" } else { "disable" };
                errors.push(format!("Failed to {verb} read_only on '{}': {err}", self.name()));
                false
            }
        }
    }

    /// Stop, and optionally fully deconfigure, one slave connection.
    ///
    /// STOP SLAVE sometimes takes longer than the connector read timeout and
    /// finishes on the server after the client gave up. Stopping an already
    /// stopped connection is not an error, so both statements are retried
    /// under the time limit.
    async fn stop_slave_conn(
        &mut self,
        conn_name: &str,
        mode: StopMode,
        time_limit: Duration,
        errors: &mut ErrorSink,
    ) -> bool {
        let timer = Instant::now();
        let stop = format!("STOP SLAVE '{conn_name}';");
        if let Err(err) = self.execute_cmd_time_limit(&stop, time_limit).await {
            errors.push(format!(
                "Failed to stop slave connection on '{}': {err}",
                self.name()
            ));
            return false;
        }
        if mode == StopMode::ResetAll {
            // RESET SLAVE can also take a while when there is a lot of relay
            // log to delete.
            let time_left = time_limit.saturating_sub(timer.elapsed());
            let reset = format!("RESET SLAVE '{conn_name}' ALL;");
            if let Err(err) = self.execute_cmd_time_limit(&reset, time_left).await {
                errors.push(format!(
                    "Failed to reset slave connection on '{}': {err}",
                    self.name()
                ));
                return false;
            }
        }
        true
    }

    /// Remove the given slave connections, then re-read the slave status and
    /// verify they are really gone.
    pub(crate) async fn remove_slave_conns(
        &mut self,
        op: &mut OperationContext,
        conns_to_remove: Vec<SlaveStatus>,
    ) -> bool {
        let mut stop_error = false;
        for conn in &conns_to_remove {
            let timer = Instant::now();
            let ok = self
                .stop_slave_conn(&conn.name, StopMode::ResetAll, op.time_remaining, &mut op.errors)
                .await;
            op.subtract(timer.elapsed());
            if !ok {
                stop_error = true;
                break;
            }
        }
        if stop_error {
            op.errors.push(format!(
                "Failed to remove slave connection(s) from '{}'.",
                self.name()
            ));
            return false;
        }

        let timer = Instant::now();
        let success = match self.do_show_slave_status().await {
            Ok(()) => {
                let remaining: HashSet<String> = self
                    .slave_status_snapshot()
                    .into_iter()
                    .map(|conn| conn.name)
                    .collect();
                let found = conns_to_remove
                    .iter()
                    .filter(|conn| remaining.contains(&conn.name))
                    .count();
                if found == 0 {
                    true
                } else {
                    op.errors.push(format!(
                        "'{}' still has {found} removed slave connections, RESET SLAVE must have failed.",
                        self.name()
                    ));
                    false
                }
            }
            Err(err) => {
                op.errors.push(format!(
                    "Failed to update slave connections of '{}': {err}",
                    self.name()
                ));
                false
            }
        };
        op.subtract(timer.elapsed());
        success
    }

    /// Stop and fully reset every slave connection. First failure aborts;
    /// already removed connections stay removed.
    pub async fn reset_all_slave_conns(&mut self, errors: &mut ErrorSink) -> bool {
        let conns = self.slave_status_snapshot();
        for conn in &conns {
            let stop = format!("STOP SLAVE '{}';", conn.name);
            let reset = format!("RESET SLAVE '{}' ALL;", conn.name);
            let result = match self.execute_cmd(&stop).await {
                Ok(()) => self.execute_cmd(&reset).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                let message = if conn.name.is_empty() {
                    format!(
                        "Error when reseting the default slave connection of '{}': {err}",
                        self.name()
                    )
                } else {
                    format!(
                        "Error when reseting the slave connection '{}' of '{}': {err}",
                        conn.name,
                        self.name()
                    )
                };
                errors.push(message);
                return false;
            }
        }
        if !conns.is_empty() {
            tracing::info!(
                server = %self.name(),
                "removed {} slave connection(s)",
                conns.len()
            );
        }
        true
    }

    /// Poll own GTID position until `target` has been fully processed or the
    /// budget runs out. Polls at least once even with a spent budget; the
    /// pause between polls starts at 200 ms and grows by 100 ms per round.
    pub(crate) async fn catchup_to_master(
        &mut self,
        op: &mut OperationContext,
        target: &GtidList,
    ) -> bool {
        // gtid_binlog_pos is the more reliable measure, but only covers
        // replicated events when log_slave_updates is on.
        let use_binlog_pos = self.rpl_settings.log_bin && self.rpl_settings.log_slave_updates;
        let mut sleep_time = Duration::from_millis(200);
        let mut timer = Instant::now();

        loop {
            if let Err(err) = self.update_gtids().await {
                op.errors.push(format!(
                    "Failed to update gtid on '{}' while waiting for catchup: {err}",
                    self.name()
                ));
                return false;
            }

            let compare_to = if use_binlog_pos {
                self.gtid_binlog_pos()
            } else {
                self.gtid_current_pos()
            };
            if target.events_ahead(&compare_to, MissingDomainPolicy::Ignore) == 0 {
                return true;
            }

            op.subtract(timer.elapsed());
            timer = Instant::now();
            if op.time_remaining.is_zero() {
                op.errors.push(format!("Slave catchup timed out on slave '{}'.", self.name()));
                return false;
            }

            let pause = sleep_time.min(op.time_remaining);
            tokio::time::sleep(pause).await;
            sleep_time += Duration::from_millis(100);
        }
    }

    /// Disconnect other connected super-users. `read_only` does not stop
    /// them from writing, and nothing stops them from logging right back in,
    /// but it closes the window during the swap. The monitor's own session
    /// and replication dump threads are excluded.
    pub(crate) async fn kick_out_super_users(&mut self, op: &mut OperationContext) -> bool {
        let get_ids_query = "SELECT DISTINCT * FROM (\
            SELECT P.id,P.user FROM information_schema.PROCESSLIST as P \
            INNER JOIN mysql.user as U ON (U.user = P.user) WHERE \
            (U.Super_priv = 'Y' AND P.COMMAND != 'Binlog Dump' \
            AND P.id != (SELECT CONNECTION_ID()))) as I;";

        let result = match self.execute_query(get_ids_query).await {
            Ok(result) => result,
            Err(err) if err.is_access_denied() => {
                // The monitor user may simply not be granted this; warn and
                // carry on with the demotion.
                tracing::warn!(
                    server = %self.name(),
                    "insufficient rights to query logged in super-users: {err} \
                     Super-users may perform writes during the cluster manipulation operation."
                );
                return true;
            }
            Err(err) => {
                op.errors.push(format!("Could not query connected super-users: {err}"));
                return false;
            }
        };

        let connections: Vec<(i64, String)> = result
            .rows()
            .map(|row| (row.int(0), row.string(1)))
            .collect();

        let mut error = false;
        for (conn_id, user) in connections {
            let kill_query = format!("KILL SOFT CONNECTION {conn_id};");
            let timer = Instant::now();
            match self.execute_cmd_time_limit(&kill_query, op.time_remaining).await {
                Ok(()) => {
                    tracing::warn!(
                        server = %self.name(),
                        "killed connection id {conn_id} from super-user '{user}' to prevent writes"
                    );
                }
                Err(err) => {
                    error = true;
                    op.errors.push(format!(
                        "Could not kill connection {conn_id} from super-user '{user}': {err}"
                    ));
                }
            }
            op.subtract(timer.elapsed());
        }
        !error
    }

    /// Execute an operator-supplied SQL file line by line. Empty lines and
    /// `#` comments are skipped; the first failing line aborts.
    pub(crate) async fn run_sql_from_file(&mut self, path: &Path, errors: &mut ErrorSink) -> bool {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                errors.push(format!("Could not open sql text file '{}': {err}.", path.display()));
                return false;
            }
        };

        tracing::info!(
            server = %self.name(),
            file = %path.display(),
            "executing sql queries from file"
        );
        let mut lines_executed = 0;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            // Lines may return data; results are read and discarded.
            if let Err(err) = self.execute_query(line).await {
                errors.push(format!(
                    "Failed to execute sql from text file '{}'. Query: '{line}'. Error: {err}",
                    path.display()
                ));
                return false;
            }
            lines_executed += 1;
        }
        tracing::info!(server = %self.name(), "{lines_executed} queries executed successfully");
        true
    }

    /// Everything of a `CHANGE MASTER` statement up to the password clause.
    fn change_master_base(op: &OperationContext, conn: &SlaveStatus) -> String {
        let mut cmd = format!(
            "CHANGE MASTER '{}' TO MASTER_HOST = '{}', MASTER_PORT = {}, ",
            conn.name, conn.master_host, conn.master_port
        );
        cmd.push_str("MASTER_USE_GTID = current_pos, ");
        if op.replication_ssl {
            cmd.push_str("MASTER_SSL = 1, ");
        }
        cmd.push_str(&format!("MASTER_USER = '{}', ", op.replication_user));
        cmd
    }

    /// Generate the `CHANGE MASTER` statement for a channel. The password
    /// appears only in the returned statement, never in the log.
    fn generate_change_master_cmd(&self, op: &OperationContext, conn: &SlaveStatus) -> String {
        let base = Self::change_master_base(op, conn);
        tracing::debug!(
            server = %self.name(),
            "change master command is '{base}MASTER_PASSWORD = '******';'"
        );
        format!("{base}MASTER_PASSWORD = '{}';", op.replication_password)
    }

    /// Create and start one slave connection modeled on `conn`.
    async fn create_start_slave(&mut self, op: &mut OperationContext, conn: &SlaveStatus) -> bool {
        let mut new_conn = conn.clone();
        new_conn.owning_server = self.name().to_string();
        let change_master = self.generate_change_master_cmd(op, &new_conn);

        let timer = Instant::now();
        let created = self.execute_cmd_time_limit(&change_master, op.time_remaining).await;
        op.subtract(timer.elapsed());
        if let Err(err) = created {
            tracing::error!(
                "{} could not be created: {err}",
                new_conn.to_short_string()
            );
            return false;
        }

        let start = format!("START SLAVE '{}';", new_conn.name);
        let timer = Instant::now();
        let started = self.execute_cmd_time_limit(&start, op.time_remaining).await;
        op.subtract(timer.elapsed());
        match started {
            Ok(()) => {
                tracing::info!("{} created and started.", new_conn.to_short_string());
                true
            }
            Err(err) => {
                tracing::error!(
                    "{} could not be started: {err}",
                    new_conn.to_short_string()
                );
                false
            }
        }
    }

    /// Point an existing slave connection at a new master: stop it, rewrite
    /// the master endpoint, start it again.
    pub(crate) async fn redirect_existing_slave_conn(
        &mut self,
        op: &mut OperationContext,
        old_conn: &SlaveStatus,
        new_master: &ServerRef,
    ) -> bool {
        let timer = Instant::now();
        let stopped = self
            .stop_slave_conn(&old_conn.name, StopMode::StopOnly, op.time_remaining, &mut op.errors)
            .await;
        op.subtract(timer.elapsed());
        if !stopped {
            return false;
        }

        let mut modified_conn = old_conn.clone();
        modified_conn.master_host = new_master.host.clone();
        modified_conn.master_port = new_master.port;
        let change_master = self.generate_change_master_cmd(op, &modified_conn);

        let timer = Instant::now();
        let changed = self.execute_cmd_time_limit(&change_master, op.time_remaining).await;
        op.subtract(timer.elapsed());
        if let Err(err) = changed {
            op.errors.push(format!(
                "{} could not be redirected to [{}]:{}: {err}",
                old_conn.to_short_string(),
                modified_conn.master_host,
                modified_conn.master_port
            ));
            return false;
        }

        let start = format!("START SLAVE '{}';", old_conn.name);
        let timer = Instant::now();
        let started = self.execute_cmd_time_limit(&start, op.time_remaining).await;
        op.subtract(timer.elapsed());
        match started {
            Ok(()) => true,
            Err(err) => {
                op.errors.push(format!(
                    "{} could not be started: {err}",
                    modified_conn.to_short_string()
                ));
                false
            }
        }
    }

    /// Recreate the demoted master's channels on this server after a
    /// switchover promotion. A channel that pointed at this server itself is
    /// redirected to `replacement`, the server taking over the old role.
    pub(crate) async fn copy_slave_conns(
        &mut self,
        op: &mut OperationContext,
        conns_to_copy: &[SlaveStatus],
        replacement: &ServerRef,
    ) -> bool {
        for conn in conns_to_copy {
            if let Err(reason) = conn.should_be_copied() {
                tracing::warn!(
                    "{} was not copied to '{}' because {reason}",
                    conn.to_short_string(),
                    self.name()
                );
                continue;
            }
            let mut conn = conn.clone();
            if conn.master_server_id == self.server_id() {
                conn.master_host = replacement.host.clone();
                conn.master_port = replacement.port;
            }
            if !self.create_start_slave(op, &conn).await {
                return false;
            }
        }
        true
    }

    /// Why a channel must not be merged onto this server, if any reason.
    fn merge_rejection(&self, conn: &SlaveStatus, existing: &[SlaveStatus]) -> Option<String> {
        if let Err(reason) = conn.should_be_copied() {
            return Some(reason);
        }
        if conn.master_server_id > 0 && conn.master_server_id == self.server_id() {
            return Some(format!(
                "it points to '{}' (according to server id:s).",
                self.name()
            ));
        }
        if conn.targets(self.host(), self.port()) {
            return Some(format!(
                "it points to '{}' (according to master host:port).",
                self.name()
            ));
        }
        for own_conn in existing {
            if own_conn.seen_connected && own_conn.master_server_id == conn.master_server_id {
                return Some(format!(
                    "its Master_Server_Id ({}) matches an existing slave connection on '{}'.",
                    conn.master_server_id,
                    self.name()
                ));
            }
            if own_conn.targets(&conn.master_host, conn.master_port) {
                return Some(format!(
                    "its Master_Host ({}) and Master_Port ({}) match an existing slave connection on {}.",
                    conn.master_host,
                    conn.master_port,
                    self.name()
                ));
            }
        }
        None
    }

    /// Merge the failed master's last-known channels into this server's own
    /// set after a failover promotion. This server combines both roles, so
    /// channels pointing at it, and duplicates of channels it already runs,
    /// are skipped. Colliding names get a generated `To [host]:port` name.
    pub(crate) async fn merge_slave_conns(
        &mut self,
        op: &mut OperationContext,
        conns_to_merge: &[SlaveStatus],
    ) -> bool {
        let existing = self.slave_status_snapshot();
        let mut connection_names: HashSet<String> =
            existing.iter().map(|conn| conn.name.clone()).collect();

        for conn in conns_to_merge {
            if let Some(reason) = self.merge_rejection(conn, &existing) {
                tracing::warn!(
                    "{} was ignored when promoting '{}' because {reason}",
                    conn.to_short_string(),
                    self.name()
                );
                continue;
            }

            let mut conn = conn.clone();
            if connection_names.contains(&conn.name) {
                let second_try = format!("To [{}]:{}", conn.master_host, conn.master_port);
                if connection_names.contains(&second_try) {
                    tracing::error!(
                        "could not generate a unique connection name for '{}': both '{}' and '{second_try}' are already taken",
                        self.name(),
                        conn.name
                    );
                    return false;
                }
                tracing::warn!(
                    "a slave connection with name '{}' already exists on '{}', using generated name '{second_try}' instead",
                    conn.name,
                    self.name()
                );
                conn.name = second_try;
            }

            if !self.create_start_slave(op, &conn).await {
                return false;
            }
            connection_names.insert(conn.name);
        }
        true
    }

    /// Promote this server into the demotion target's place. Assumes the
    /// gate predicates have passed.
    pub(crate) async fn promote(
        &mut self,
        op: &mut OperationContext,
        promotion: &ServerOperation,
        kind: OperationKind,
        demotion_target: &ServerRef,
    ) -> bool {
        let Some(master_conn) = self.slave_connection_status(demotion_target) else {
            op.errors.push(format!(
                "'{}' is not a slave of '{}' and cannot be promoted to its place.",
                self.name(),
                demotion_target.name
            ));
            return false;
        };

        // Step 1: stop and reset slave connections. A switchover removes all
        // of them, since the demotion target takes them over; a failover
        // removes only the channel to the dead master.
        let stopped = match kind {
            OperationKind::Switchover => {
                let all = self.slave_status_snapshot();
                self.remove_slave_conns(op, all).await
            }
            OperationKind::Failover => self.remove_slave_conns(op, vec![master_conn]).await,
        };
        if !stopped {
            return false;
        }

        // Step 2: when taking over the master role, enable writes and
        // scheduled events, and run the promotion file.
        if promotion.to_from_master {
            let timer = Instant::now();
            let limit = op.time_remaining;
            let ro_disabled = self
                .set_read_only(ReadOnlySetting::Disable, limit, &mut op.errors)
                .await;
            op.subtract(timer.elapsed());
            if !ro_disabled {
                return false;
            }

            if promotion.handle_events {
                let timer = Instant::now();
                let events_enabled = self
                    .enable_events(&promotion.events_to_enable, &mut op.errors)
                    .await;
                op.subtract(timer.elapsed());
                if !events_enabled {
                    op.errors.push(format!("Failed to enable events on '{}'.", self.name()));
                    return false;
                }
            }

            if let Some(sql_file) = &promotion.sql_file {
                let timer = Instant::now();
                let file_ok = self.run_sql_from_file(sql_file, &mut op.errors).await;
                op.subtract(timer.elapsed());
                if !file_ok {
                    op.errors.push(format!(
                        "Execution of file '{}' failed during promotion of server '{}'.",
                        sql_file.display(),
                        self.name()
                    ));
                    return false;
                }
            }
        }

        // Step 3: take over the demoted server's own channels.
        match kind {
            OperationKind::Switchover => {
                if !self
                    .copy_slave_conns(op, &promotion.conns_to_copy, demotion_target)
                    .await
                {
                    op.errors.push(format!(
                        "Could not copy slave connections from '{}' to '{}'.",
                        demotion_target.name,
                        self.name()
                    ));
                    return false;
                }
            }
            OperationKind::Failover => {
                if !self.merge_slave_conns(op, &promotion.conns_to_copy).await {
                    op.errors.push(format!(
                        "Could not merge slave connections from '{}' to '{}'.",
                        demotion_target.name,
                        self.name()
                    ));
                    return false;
                }
            }
        }
        true
    }

    /// Demote this server out of the master role. On failure after
    /// `read_only` was set, a best-effort restore runs with a zero budget;
    /// the session may still be executing the enabling statement, so even
    /// that is not guaranteed to take effect.
    pub(crate) async fn demote(&mut self, op: &mut OperationContext, demotion: &ServerOperation) -> bool {
        // Step 1: remove all slave connections. The promotion target copies
        // them from the plan's backup.
        let conns = self.slave_status_snapshot();
        if !self.remove_slave_conns(op, conns).await {
            return false;
        }

        let mut demotion_error = false;
        if demotion.to_from_master {
            // The steps most likely to fail run first so there is less to
            // undo. Setting read_only can block on table locks or long
            // writes.

            // Step 2a: drop the master flag so compatible routers stop
            // sending new writes here. Writes already in flight go through,
            // at least until read_only is set.
            self.clear_status(status::MASTER);

            // Step 2b: super-users are not stopped by read_only; kick them
            // out now.
            if !self.kick_out_super_users(op).await {
                demotion_error = true;
            }

            // Step 2c: enable read_only.
            if !demotion_error {
                let timer = Instant::now();
                let limit = op.time_remaining;
                let ro_enabled = self
                    .set_read_only(ReadOnlySetting::Enable, limit, &mut op.errors)
                    .await;
                op.subtract(timer.elapsed());
                if !ro_enabled {
                    demotion_error = true;
                }
            }

            // Step 2d: disable events with the session binlog off, so the
            // ALTERs do not become replicated events.
            if !demotion_error && demotion.handle_events {
                let timer = Instant::now();
                let events_disabled = self.disable_events(BinlogMode::Off, &mut op.errors).await;
                op.subtract(timer.elapsed());
                if !events_disabled {
                    demotion_error = true;
                    op.errors.push(format!("Failed to disable events on '{}'.", self.name()));
                }
            }

            // Step 2e: operator-supplied demotion file.
            if !demotion_error {
                if let Some(sql_file) = &demotion.sql_file {
                    let timer = Instant::now();
                    let file_ok = self.run_sql_from_file(sql_file, &mut op.errors).await;
                    op.subtract(timer.elapsed());
                    if !file_ok {
                        demotion_error = true;
                        op.errors.push(format!(
                            "Execution of file '{}' failed during demotion of server '{}'.",
                            sql_file.display(),
                            self.name()
                        ));
                    }
                }
            }

            // Step 2f: flush so every event is in the binlog before the
            // position is read as the catchup target.
            if !demotion_error {
                let timer = Instant::now();
                let flushed = self
                    .execute_cmd_time_limit("FLUSH LOGS;", op.time_remaining)
                    .await;
                op.subtract(timer.elapsed());
                if let Err(err) = flushed {
                    demotion_error = true;
                    op.errors.push(format!(
                        "Failed to flush binary logs of '{}' during demotion: {err}",
                        self.name()
                    ));
                }
            }
        }

        let mut success = false;
        if !demotion_error {
            match self.update_gtids().await {
                Ok(()) => success = true,
                Err(err) => {
                    demotion_error = true;
                    op.errors.push(format!(
                        "Failed to update gtid:s of '{}' during demotion: {err}",
                        self.name()
                    ));
                }
            }
        }

        if demotion_error && demotion.to_from_master {
            let mut scratch = ErrorSink::new();
            let _ = self
                .set_read_only(ReadOnlySetting::Disable, Duration::ZERO, &mut scratch)
                .await;
        }
        success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtid::GtidList;

    fn op_context() -> OperationContext {
        OperationContext::new(
            Duration::from_secs(30),
            "repl".to_string(),
            "sekrit".to_string(),
            false,
        )
    }

    fn channel(owner: &str, name: &str, host: &str, port: u16, id: i64) -> SlaveStatus {
        let mut conn = SlaveStatus::new(owner);
        conn.name = name.to_string();
        conn.master_host = host.to_string();
        conn.master_port = port;
        conn.master_server_id = id;
        conn.io_state = SlaveIoState::Yes;
        conn.sql_running = true;
        conn.seen_connected = true;
        conn.gtid_io_pos = GtidList::from_string("0-1-10");
        conn
    }

    #[test]
    fn test_change_master_cmd_layout() {
        let op = op_context();
        let conn = channel("db2", "", "db1.local", 3306, 1);
        let base = ServerAgent::change_master_base(&op, &conn);
        assert_eq!(
            base,
            "CHANGE MASTER '' TO MASTER_HOST = 'db1.local', MASTER_PORT = 3306, \
             MASTER_USE_GTID = current_pos, MASTER_USER = 'repl', "
        );
        assert!(!base.contains("sekrit"));

        let mut ssl_op = op_context();
        ssl_op.replication_ssl = true;
        let base = ServerAgent::change_master_base(&ssl_op, &conn);
        assert!(base.contains("MASTER_SSL = 1, "));
    }

    #[test]
    fn test_full_change_master_cmd_contains_password_once() {
        let agent = ServerAgent::mock("db2", "db2.local", 3306, 2);
        let op = op_context();
        let conn = channel("db2", "ext", "db1.local", 3306, 1);
        let cmd = agent.generate_change_master_cmd(&op, &conn);
        assert!(cmd.starts_with("CHANGE MASTER 'ext' TO "));
        assert!(cmd.ends_with("MASTER_PASSWORD = 'sekrit';"));
        assert_eq!(cmd.matches("sekrit").count(), 1);
    }

    #[test]
    fn test_merge_rejection_filters_self_and_duplicates() {
        let agent = ServerAgent::mock("db2", "db2.local", 3306, 2);
        let existing = vec![channel("db2", "ext", "ext.example.com", 3306, 77)];

        // Points to the promotion target by id.
        let conn = channel("db1", "a", "somewhere", 3306, 2);
        let reason = agent.merge_rejection(&conn, &existing).expect("rejected");
        assert!(reason.contains("server id"));

        // Points to the promotion target by endpoint.
        let conn = channel("db1", "a", "db2.local", 3306, 99);
        let reason = agent.merge_rejection(&conn, &existing).expect("rejected");
        assert!(reason.contains("host:port"));

        // Duplicates an existing channel by id.
        let conn = channel("db1", "a", "other.example.com", 3306, 77);
        let reason = agent.merge_rejection(&conn, &existing).expect("rejected");
        assert!(reason.contains("Master_Server_Id"));

        // Duplicates an existing channel by endpoint.
        let conn = channel("db1", "a", "ext.example.com", 3306, 78);
        let reason = agent.merge_rejection(&conn, &existing).expect("rejected");
        assert!(reason.contains("Master_Host"));

        // A channel to a genuinely new master is accepted.
        let conn = channel("db1", "a", "fresh.example.com", 3306, 50);
        assert!(agent.merge_rejection(&conn, &existing).is_none());
    }

    #[test]
    fn test_merge_rejection_applies_copy_filter() {
        let agent = ServerAgent::mock("db2", "db2.local", 3306, 2);
        let mut conn = channel("db1", "a", "fresh.example.com", 3306, 50);
        conn.seen_connected = false;
        let reason = agent.merge_rejection(&conn, &[]).expect("rejected");
        assert!(reason.contains("seen connected"));
    }

    #[test]
    fn test_can_be_demoted_failover_requires_down_server() {
        let agent = ServerAgent::mock("db1", "db1.local", 3306, 1);
        // Mock agents start as running.
        assert_eq!(agent.can_be_demoted_failover().unwrap_err(), "it is running.");

        agent.set_status(status::MASTER);
        assert_eq!(
            agent.can_be_demoted_failover().unwrap_err(),
            "it is a running master."
        );
    }

    #[test]
    fn test_can_be_demoted_failover_requires_binlog_pos() {
        let mut agent = ServerAgent::mock("db1", "db1.local", 3306, 1);
        agent.clear_status(status::RUNNING | status::MASTER);
        assert_eq!(
            agent.can_be_demoted_failover().unwrap_err(),
            "it does not have a 'gtid_binlog_pos'."
        );

        agent.set_mock_gtids("0-1-100", "0-1-100");
        assert!(agent.can_be_demoted_failover().is_ok());
    }

    #[tokio::test]
    async fn test_sql_file_with_only_comments_runs_clean() {
        use std::io::Write as _;

        let mut agent = ServerAgent::mock("db1", "db1.local", 3306, 1);
        let mut errors = ErrorSink::new();
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "# comments and blank lines are skipped").expect("write");
        writeln!(file).expect("write");
        writeln!(file, "   # indented comment").expect("write");

        assert!(agent.run_sql_from_file(file.path(), &mut errors).await);
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_missing_sql_file_reports_error() {
        let mut agent = ServerAgent::mock("db1", "db1.local", 3306, 1);
        let mut errors = ErrorSink::new();

        let missing = Path::new("/nonexistent/promotion.sql");
        assert!(!agent.run_sql_from_file(missing, &mut errors).await);
        assert_eq!(errors.len(), 1);
        let json = errors.to_json();
        assert!(json[0]["error"]
            .as_str()
            .expect("message")
            .contains("Could not open sql text file"));
    }

    #[test]
    fn test_can_replicate_from_reasons() {
        let mut agent = ServerAgent::mock("db2", "db2.local", 3306, 2);
        let master_pos = GtidList::from_string("0-1-100");

        let reason = agent.can_replicate_from("db1", &master_pos).unwrap_err();
        assert!(reason.contains("gtid_current_pos"));

        agent.set_mock_gtids("0-1-90", "0-1-90");
        assert!(agent.can_replicate_from("db1", &master_pos).is_ok());

        let reason = agent
            .can_replicate_from("db1", &GtidList::default())
            .unwrap_err();
        assert!(reason.contains("gtid_binlog_pos"));

        agent.set_mock_gtids("0-1-101", "0-1-101");
        let reason = agent.can_replicate_from("db1", &master_pos).unwrap_err();
        assert!(reason.contains("incompatible"));
    }
}
