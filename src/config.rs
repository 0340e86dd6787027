//! Monitor configuration with validation.
//!
//! Configuration file handling belongs to the embedding daemon; this module
//! only defines the validated settings record the monitor is constructed
//! from, plus the `[name=]host[:port]` address form the binary accepts.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const DEFAULT_PORT: u16 = 3306;

/// One monitored backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerAddress {
    /// Unique name the server is referred to by in logs, diagnostics and
    /// operation requests.
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> ServerAddress {
        ServerAddress { name: name.into(), host: host.into(), port }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=[{}]:{}", self.name, self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = String;

    /// Parse `[name=]host[:port]`. The name defaults to the host.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, endpoint) = match s.split_once('=') {
            Some((name, endpoint)) => (Some(name), endpoint),
            None => (None, s),
        };
        let (host, port) = match endpoint.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port in server address '{s}'"))?;
                (host, port)
            }
            None => (endpoint, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(format!("empty host in server address '{s}'"));
        }
        let name = name.unwrap_or(host);
        if name.is_empty() {
            return Err(format!("empty name in server address '{s}'"));
        }
        Ok(ServerAddress::new(name, host, port))
    }
}

/// Validated monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub servers: Vec<ServerAddress>,
    /// Monitor user, used for all monitoring and manipulation sessions.
    pub user: String,
    pub password: String,
    /// Seconds between monitor passes.
    pub tick_interval_secs: u64,
    /// Client-side read timeout for a single statement, also used as the
    /// server-side `max_statement_time` where supported.
    pub query_timeout_secs: u64,
    /// When true, replication graph edges are matched by host and port.
    /// Disable when several servers may share a hostname; edges are then
    /// matched by server id.
    pub assume_unique_hostnames: bool,
    /// Query and manage scheduled server events across role swaps.
    pub handle_events: bool,
    /// Refresh all agents concurrently instead of one at a time.
    pub parallel_update: bool,
    /// Credentials written into `CHANGE MASTER`; default to the monitor
    /// user.
    pub replication_user: Option<String>,
    pub replication_password: Option<String>,
    pub replication_ssl: bool,
    /// Time budgets for one whole role swap.
    pub switchover_timeout_secs: u64,
    pub failover_timeout_secs: u64,
    /// Optional SQL run on the new master right after promotion, and on the
    /// old master right after demotion.
    pub promotion_sql_file: Option<PathBuf>,
    pub demotion_sql_file: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            user: String::new(),
            password: String::new(),
            tick_interval_secs: 2,
            query_timeout_secs: 5,
            assume_unique_hostnames: true,
            handle_events: true,
            parallel_update: false,
            replication_user: None,
            replication_password: None,
            replication_ssl: false,
            switchover_timeout_secs: 90,
            failover_timeout_secs: 90,
            promotion_sql_file: None,
            demotion_sql_file: None,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.servers.is_empty() {
            return Err("at least one server must be configured".to_string());
        }
        for (i, server) in self.servers.iter().enumerate() {
            for other in &self.servers[i + 1..] {
                if server.name == other.name {
                    return Err(format!("duplicate server name '{}'", server.name));
                }
                if server.host == other.host && server.port == other.port {
                    return Err(format!(
                        "servers '{}' and '{}' share the endpoint [{}]:{}",
                        server.name, other.name, server.host, server.port
                    ));
                }
            }
        }
        if self.user.is_empty() {
            return Err("monitor user must not be empty".to_string());
        }
        if self.tick_interval_secs == 0 {
            return Err("tick_interval_secs must be at least 1".to_string());
        }
        if self.query_timeout_secs == 0 {
            return Err("query_timeout_secs must be at least 1".to_string());
        }
        if self.switchover_timeout_secs == 0 || self.failover_timeout_secs == 0 {
            return Err("operation timeouts must be at least 1 second".to_string());
        }
        Ok(())
    }

    /// The user written into `CHANGE MASTER` statements.
    pub fn replication_user(&self) -> &str {
        self.replication_user.as_deref().unwrap_or(&self.user)
    }

    pub fn replication_password(&self) -> &str {
        self.replication_password.as_deref().unwrap_or(&self.password)
    }
}

#[cfg(test)]
impl MonitorConfig {
    pub(crate) fn for_single_server(name: &str, host: &str, port: u16) -> MonitorConfig {
        MonitorConfig {
            servers: vec![ServerAddress::new(name, host, port)],
            user: "monitor".to_string(),
            password: "monitor-pw".to_string(),
            ..MonitorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> MonitorConfig {
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
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_empty_server_list_is_rejected() {
        let mut config = valid_config();
        config.servers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_names_and_endpoints_are_rejected() {
        let mut config = valid_config();
        config.servers[1].name = "db1".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.servers[1].host = "db1.local".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        let mut config = valid_config();
        config.tick_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.query_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.failover_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_replication_credentials_default_to_monitor_user() {
        let mut config = valid_config();
        assert_eq!(config.replication_user(), "monitor");
        assert_eq!(config.replication_password(), "pw");

        config.replication_user = Some("repl".to_string());
        config.replication_password = Some("repl-pw".to_string());
        assert_eq!(config.replication_user(), "repl");
        assert_eq!(config.replication_password(), "repl-pw");
    }

    #[test]
    fn test_server_address_parsing() {
        let addr: ServerAddress = "db1=alpha.local:3307".parse().expect("parses");
        assert_eq!(addr, ServerAddress::new("db1", "alpha.local", 3307));

        let addr: ServerAddress = "alpha.local".parse().expect("parses");
        assert_eq!(addr, ServerAddress::new("alpha.local", "alpha.local", 3306));

        let addr: ServerAddress = "alpha.local:3307".parse().expect("parses");
        assert_eq!(addr.name, "alpha.local");
        assert_eq!(addr.port, 3307);

        assert!("db1=:3307".parse::<ServerAddress>().is_err());
        assert!("db1=alpha.local:notaport".parse::<ServerAddress>().is_err());
    }
}
