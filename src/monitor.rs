//! The cluster monitor: agent registry and periodic tick driver.
//!
//! Owns one [`ServerAgent`] per configured backend for the life of the
//! process. Each tick refreshes every agent's cache, then runs the topology
//! pass over all of them. Role swap requests run on the same owner, so a
//! tick can never interleave with an orchestration in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::MissedTickBehavior;

use crate::agent::ServerAgent;
use crate::config::MonitorConfig;
use crate::orchestrator::{self, OperationContext, OperationSettings};
use crate::topology;

/// Monitoring and failover controller for one cluster of backends.
pub struct ClusterMonitor {
    config: MonitorConfig,
    agents: Vec<ServerAgent>,
    stopped: Arc<AtomicBool>,
}

impl ClusterMonitor {
    pub fn new(config: MonitorConfig) -> Result<ClusterMonitor, String> {
        config.validate()?;
        let agents = config
            .servers
            .iter()
            .map(|address| ServerAgent::new(address, &config))
            .collect();
        Ok(ClusterMonitor {
            config,
            agents,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn agents(&self) -> &[ServerAgent] {
        &self.agents
    }

    pub fn agent(&self, name: &str) -> Option<&ServerAgent> {
        self.agents.iter().find(|agent| agent.name() == name)
    }

    fn agent_index(&self, name: &str) -> Option<usize> {
        self.agents.iter().position(|agent| agent.name() == name)
    }

    /// Flag the run loop to exit after the current pass.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }

    /// Run monitor passes at the configured interval until stopped.
    pub async fn run(&mut self) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if self.stopped.load(Ordering::Relaxed) {
                tracing::info!("cluster monitor stopped");
                break;
            }
            self.tick().await;
        }
    }

    /// One monitor pass: refresh every agent, then recompute the topology.
    /// Agents own disjoint connections and caches, so the refresh can fan
    /// out when configured to.
    pub async fn tick(&mut self) {
        if self.config.parallel_update {
            futures::future::join_all(
                self.agents.iter_mut().map(|agent| agent.monitor_tick()),
            )
            .await;
        } else {
            for agent in self.agents.iter_mut() {
                agent.monitor_tick().await;
            }
        }

        topology::analyze(&mut self.agents, self.config.assume_unique_hostnames);

        for agent in self.agents.iter_mut() {
            if agent.take_topology_changed() {
                tracing::info!(server = %agent.name(), "replication topology changed");
            }
        }
    }

    fn operation_context(&self, budget_secs: u64) -> OperationContext {
        OperationContext::new(
            Duration::from_secs(budget_secs),
            self.config.replication_user().to_string(),
            self.config.replication_password().to_string(),
            self.config.replication_ssl,
        )
    }

    fn operation_settings(&self) -> OperationSettings {
        OperationSettings {
            handle_events: self.config.handle_events,
            promotion_sql_file: self.config.promotion_sql_file.clone(),
            demotion_sql_file: self.config.demotion_sql_file.clone(),
        }
    }

    /// Swap the master role from `demotion_name` to `promotion_name`.
    /// Returns overall success and the collected error objects.
    pub async fn switchover(
        &mut self,
        demotion_name: &str,
        promotion_name: &str,
    ) -> (bool, Value) {
        let mut op = self.operation_context(self.config.switchover_timeout_secs);
        let (Some(demotion), Some(promotion)) = (
            self.agent_index(demotion_name),
            self.agent_index(promotion_name),
        ) else {
            op.errors.push(format!(
                "Unknown server in switchover request: '{demotion_name}' -> '{promotion_name}'."
            ));
            return (false, op.errors.to_json());
        };

        let settings = self.operation_settings();
        let ok =
            orchestrator::switchover(&mut self.agents, demotion, promotion, &mut op, &settings)
                .await;
        (ok, op.errors.to_json())
    }

    /// Replace the dead server `demotion_name` with `promotion_name`.
    pub async fn failover(&mut self, demotion_name: &str, promotion_name: &str) -> (bool, Value) {
        let mut op = self.operation_context(self.config.failover_timeout_secs);
        let (Some(demotion), Some(promotion)) = (
            self.agent_index(demotion_name),
            self.agent_index(promotion_name),
        ) else {
            op.errors.push(format!(
                "Unknown server in failover request: '{demotion_name}' -> '{promotion_name}'."
            ));
            return (false, op.errors.to_json());
        };

        let settings = self.operation_settings();
        let ok = orchestrator::failover(&mut self.agents, demotion, promotion, &mut op, &settings)
            .await;
        (ok, op.errors.to_json())
    }

    /// JSON export of the whole cluster, one object per server.
    pub fn to_json(&self) -> Value {
        json!(self.agents.iter().map(|a| a.to_json()).collect::<Vec<_>>())
    }

    /// Human-readable diagnostics for all servers.
    pub fn diagnostics(&self) -> String {
        let mut out = String::new();
        for agent in &self.agents {
            out.push_str(&agent.diagnostics());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerAddress;

    fn test_config() -> MonitorConfig {
        MonitorConfig {
            servers: vec![
                ServerAddress::new("db1", "db1.local", 3306),
                ServerAddress::new("db2", "db2.local", 3306),
            ],
            user: "monitor".to_string(),
            password: "pw".to_string(),
            ..MonitorConfig::default()
        }
    }

    #[test]
    fn test_monitor_builds_one_agent_per_server() {
        let monitor = ClusterMonitor::new(test_config()).expect("valid config");
        assert_eq!(monitor.agents().len(), 2);
        assert!(monitor.agent("db1").is_some());
        assert!(monitor.agent("db2").is_some());
        assert!(monitor.agent("db3").is_none());
    }

    #[test]
    fn test_monitor_rejects_invalid_config() {
        let mut config = test_config();
        config.servers.clear();
        assert!(ClusterMonitor::new(config).is_err());
    }

    #[tokio::test]
    async fn test_switchover_with_unknown_server_fails_cleanly() {
        let mut monitor = ClusterMonitor::new(test_config()).expect("valid config");
        let (ok, errors) = monitor.switchover("db1", "nope").await;
        assert!(!ok);
        assert!(errors[0]["error"]
            .as_str()
            .expect("message")
            .contains("Unknown server"));
    }

    #[test]
    fn test_cluster_json_export_lists_all_servers() {
        let monitor = ClusterMonitor::new(test_config()).expect("valid config");
        let json = monitor.to_json();
        let servers = json.as_array().expect("array");
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0]["name"], "db1");
        assert_eq!(servers[1]["name"], "db2");
    }
}
