//! MariaDB replication monitor with automated switchover and failover.
//!
//! The monitor keeps one [`agent::ServerAgent`] per backend, periodically
//! interrogates each server for its replication state, rebuilds the
//! replication topology from those observations, and publishes per-server
//! role bits for the routing plane. On request it performs coordinated role
//! swaps: a graceful [switchover] of a live master, or a [failover] that
//! replaces a dead one, both under a single shared time budget with partial
//! failures reported over a JSON error channel.
//!
//! [switchover]: orchestrator::switchover
//! [failover]: orchestrator::failover

pub mod agent;
pub mod config;
pub mod error;
pub mod gtid;
pub mod monitor;
pub mod orchestrator;
pub mod slave_status;
pub mod status;
pub mod topology;

pub use agent::{Capabilities, ServerAgent, ServerRef, ServerType};
pub use config::{MonitorConfig, ServerAddress};
pub use error::{ErrorSink, QueryError, QueryErrorKind};
pub use gtid::{Gtid, GtidList, MissingDomainPolicy};
pub use monitor::ClusterMonitor;
pub use orchestrator::{OperationContext, OperationKind, OperationSettings, ServerOperation};
pub use slave_status::{SlaveIoState, SlaveStatus};
