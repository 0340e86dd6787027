//! Switchover and failover orchestration.
//!
//! Both operations are deterministic scripts over two named actors, the
//! demotion target `D` and the promotion target `P`, plus the bystander
//! slaves that need redirecting. Every step draws from one shared time
//! budget carried in [`OperationContext`] and reports failures into its JSON
//! error sink. Beyond a best-effort `read_only` restore inside the demote
//! step there is no rollback: whatever partial state survives a failed run
//! is reported verbatim and left to the operator.
//!
//! Switchover order: demote `D`, redirect the other slaves, wait for `P` to
//! catch up to `D`'s flushed binlog position, promote `P`. In a failover `D`
//! is dead, so there is nothing to demote, and the order inverts around the
//! catchup: `P` first finishes applying its relay log against `D`'s last
//! observed binlog position, then is promoted (which removes its channel to
//! `D` and merges `D`'s other channels), and only then are the surviving
//! slaves pointed at it. Removing the channel first would stop the SQL
//! thread and strand the relay log.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::agent::{ServerAgent, ServerRef};
use crate::error::ErrorSink;
use crate::slave_status::SlaveStatus;
use crate::status;

/// Which kind of role swap is being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Operator-initiated swap with a live old master.
    Switchover,
    /// Replacement of a dead master.
    Failover,
}

/// Shared state of one orchestration: the remaining time budget, the JSON
/// error channel, and the credentials written into `CHANGE MASTER`.
#[derive(Debug)]
pub struct OperationContext {
    pub time_remaining: Duration,
    pub errors: ErrorSink,
    pub replication_user: String,
    pub replication_password: String,
    pub replication_ssl: bool,
}

impl OperationContext {
    pub fn new(
        budget: Duration,
        replication_user: String,
        replication_password: String,
        replication_ssl: bool,
    ) -> OperationContext {
        OperationContext {
            time_remaining: budget,
            errors: ErrorSink::new(),
            replication_user,
            replication_password,
            replication_ssl,
        }
    }

    /// Charge elapsed time against the budget, bottoming out at zero.
    pub(crate) fn subtract(&mut self, elapsed: Duration) {
        self.time_remaining = self.time_remaining.saturating_sub(elapsed);
    }
}

/// Plan for one side of a role swap.
#[derive(Debug, Clone)]
pub struct ServerOperation {
    pub target: ServerRef,
    /// This side crosses the master boundary: the demotion loses the master
    /// role or the promotion gains it.
    pub to_from_master: bool,
    pub handle_events: bool,
    /// Events to enable on the promotion target, recorded from the old
    /// master before the swap.
    pub events_to_enable: HashSet<String>,
    /// The demotion target's channels, backed up before they are removed.
    pub conns_to_copy: Vec<SlaveStatus>,
    pub sql_file: Option<PathBuf>,
}

/// Operator-level knobs shared by both scripts.
#[derive(Debug, Clone, Default)]
pub struct OperationSettings {
    pub handle_events: bool,
    pub promotion_sql_file: Option<PathBuf>,
    pub demotion_sql_file: Option<PathBuf>,
}

/// Graceful role swap between a live master `D` and one of its slaves `P`.
///
/// Returns overall success; every failure is also in the error sink. Slave
/// redirection failures do not abort the swap itself, since a master with
/// a few detached slaves beats an aborted half-swap, but they do fail the
/// operation as reported to the caller.
pub async fn switchover(
    agents: &mut [ServerAgent],
    demotion: usize,
    promotion: usize,
    op: &mut OperationContext,
    settings: &OperationSettings,
) -> bool {
    if demotion == promotion {
        op.errors.push("Promotion and demotion targets are the same server.");
        return false;
    }

    let demotion_ref = agents[demotion].server_ref();
    let promotion_ref = agents[promotion].server_ref();

    if let Err(reason) = agents[demotion].can_be_demoted_switchover().await {
        op.errors.push(format!(
            "'{}' can not be demoted because {reason}",
            demotion_ref.name
        ));
        return false;
    }
    if let Err(reason) = agents[promotion]
        .can_be_promoted(OperationKind::Switchover, &demotion_ref)
        .await
    {
        op.errors.push(format!(
            "'{}' can not be promoted because {reason}",
            promotion_ref.name
        ));
        return false;
    }
    agents[promotion].warn_replication_settings();

    let to_from_master = agents[demotion].is_master();
    let demotion_plan = ServerOperation {
        target: demotion_ref.clone(),
        to_from_master,
        handle_events: settings.handle_events,
        events_to_enable: HashSet::new(),
        conns_to_copy: Vec::new(),
        sql_file: settings.demotion_sql_file.clone(),
    };
    let promotion_plan = ServerOperation {
        target: promotion_ref.clone(),
        to_from_master,
        handle_events: settings.handle_events,
        events_to_enable: agents[demotion].enabled_events().clone(),
        conns_to_copy: agents[demotion].slave_status_snapshot(),
        sql_file: settings.promotion_sql_file.clone(),
    };

    // Step 1: demote. After this the demoted server's binlog is flushed and
    // its re-read gtid_binlog_pos is the catchup target.
    if !agents[demotion].demote(op, &demotion_plan).await {
        return false;
    }

    // Step 2: point every other slave of the old master at the new one.
    let redirect_ok = redirect_slaves(agents, demotion, promotion, op).await;

    // Step 3: the promotion target still replicates from the demoted server
    // and must process everything it wrote before taking over.
    let catchup_target = agents[demotion].gtid_binlog_pos();
    if !agents[promotion].catchup_to_master(op, &catchup_target).await {
        return false;
    }

    // Step 4: promote, copying the demoted server's channels over.
    if !agents[promotion]
        .promote(op, &promotion_plan, OperationKind::Switchover, &demotion_ref)
        .await
    {
        return false;
    }

    // Writes may resume immediately; the next tick recomputes everything
    // else from observations.
    if to_from_master {
        agents[promotion].set_status(status::MASTER);
    }
    redirect_ok
}

/// Replace a dead master `D` with one of its slaves `P`.
pub async fn failover(
    agents: &mut [ServerAgent],
    demotion: usize,
    promotion: usize,
    op: &mut OperationContext,
    settings: &OperationSettings,
) -> bool {
    if demotion == promotion {
        op.errors.push("Promotion and demotion targets are the same server.");
        return false;
    }

    let demotion_ref = agents[demotion].server_ref();
    let promotion_ref = agents[promotion].server_ref();

    if let Err(reason) = agents[demotion].can_be_demoted_failover() {
        op.errors.push(format!(
            "'{}' can not be demoted because {reason}",
            demotion_ref.name
        ));
        return false;
    }
    if let Err(reason) = agents[promotion]
        .can_be_promoted(OperationKind::Failover, &demotion_ref)
        .await
    {
        op.errors.push(format!(
            "'{}' can not be promoted because {reason}",
            promotion_ref.name
        ));
        return false;
    }
    agents[promotion].warn_replication_settings();

    let promotion_plan = ServerOperation {
        target: promotion_ref.clone(),
        to_from_master: true,
        handle_events: settings.handle_events,
        events_to_enable: agents[demotion].enabled_events().clone(),
        conns_to_copy: agents[demotion].slave_status_snapshot(),
        sql_file: settings.promotion_sql_file.clone(),
    };

    // Step 1: the promotion target's SQL thread is still applying relay log
    // from the dead master; wait until the last observed binlog position of
    // the dead master has been processed.
    let catchup_target = agents[demotion].gtid_binlog_pos();
    if !agents[promotion].catchup_to_master(op, &catchup_target).await {
        return false;
    }

    // Step 2: promote. This removes the channel to the dead master and
    // merges its other channels into the promotion target's own set.
    if !agents[promotion]
        .promote(op, &promotion_plan, OperationKind::Failover, &demotion_ref)
        .await
    {
        return false;
    }
    agents[promotion].set_status(status::MASTER);

    // Step 3: point the surviving slaves at the new master.
    redirect_slaves(agents, demotion, promotion, op).await
}

/// Redirect every slave of the demotion target, other than the two actors,
/// to the promotion target. Failures are recorded per slave and do not stop
/// the remaining redirections.
async fn redirect_slaves(
    agents: &mut [ServerAgent],
    demotion: usize,
    promotion: usize,
    op: &mut OperationContext,
) -> bool {
    let demotion_ref = agents[demotion].server_ref();
    let promotion_ref = agents[promotion].server_ref();

    let mut all_ok = true;
    let mut redirected = 0;
    for i in 0..agents.len() {
        if i == demotion || i == promotion {
            continue;
        }
        let Some(channel) = agents[i].slave_connection_status(&demotion_ref) else {
            continue;
        };
        if agents[i]
            .redirect_existing_slave_conn(op, &channel, &promotion_ref)
            .await
        {
            redirected += 1;
            tracing::info!(
                server = %agents[i].name(),
                new_master = %promotion_ref.name,
                "slave redirected to new master"
            );
        } else {
            all_ok = false;
        }
    }
    if redirected > 0 {
        tracing::info!(
            "redirected {redirected} slave(s) from '{}' to '{}'",
            demotion_ref.name,
            promotion_ref.name
        );
    }
    all_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ServerAgent;

    fn op_context() -> OperationContext {
        OperationContext::new(
            Duration::from_secs(30),
            "repl".to_string(),
            "sekrit".to_string(),
            false,
        )
    }

    #[test]
    fn test_subtract_saturates() {
        let mut op = op_context();
        op.subtract(Duration::from_secs(10));
        assert_eq!(op.time_remaining, Duration::from_secs(20));
        op.subtract(Duration::from_secs(60));
        assert_eq!(op.time_remaining, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_failover_rejects_running_demotion_target() {
        // Both servers up: the demotion target is alive, so the failover is
        // refused before any backend is touched.
        let mut agents = vec![
            ServerAgent::mock("db1", "db1.local", 3306, 1),
            ServerAgent::mock("db2", "db2.local", 3306, 2),
        ];
        let master = agents[0].server_ref();
        agents[1].mock_channel_to(&master);

        let mut op = op_context();
        let settings = OperationSettings::default();
        let ok = failover(&mut agents, 0, 1, &mut op, &settings).await;
        assert!(!ok);
        let errors = op.errors.to_json();
        let message = errors[0]["error"].as_str().expect("error message");
        assert!(message.contains("can not be demoted"));
        assert!(message.contains("it is running."));
    }

    #[tokio::test]
    async fn test_same_target_is_rejected() {
        let mut agents = vec![ServerAgent::mock("db1", "db1.local", 3306, 1)];
        let mut op = op_context();
        let settings = OperationSettings::default();
        assert!(!switchover(&mut agents, 0, 0, &mut op, &settings).await);
        assert_eq!(op.errors.len(), 1);
    }
}
