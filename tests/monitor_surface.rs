//! End-to-end checks of the public crate surface that need no live backend:
//! GTID position arithmetic, channel topology comparison, configuration
//! validation and the monitor's JSON export and error channel.

use replimon::slave_status::arrays_topology_equal;
use replimon::{
    ClusterMonitor, GtidList, MissingDomainPolicy, MonitorConfig, ServerAddress, SlaveIoState,
    SlaveStatus,
};

fn two_server_config() -> MonitorConfig {
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
fn gtid_positions_compare_per_domain() {
    let list = GtidList::from_string("0-1-100,1-1-50");
    assert_eq!(list.triples().len(), 2);

    let newer = GtidList::from_string("0-1-100");
    let older = GtidList::from_string("0-1-90");
    assert_eq!(newer.events_ahead(&older, MissingDomainPolicy::Ignore), 10);

    // An empty replica position can attach anywhere; a populated one only to
    // a master that covers all of its domains.
    let empty = GtidList::default();
    assert!(empty.is_empty());
    assert!(empty.can_replicate_from(&list));
    assert!(!list.can_replicate_from(&older));
}

#[test]
fn channel_arrays_compare_by_topology_only() {
    let mut a = SlaveStatus::new("db2");
    a.master_host = "db1.local".to_string();
    a.master_port = 3306;
    a.master_server_id = 1;
    a.io_state = SlaveIoState::Yes;
    a.sql_running = true;

    let mut b = a.clone();
    b.received_heartbeats = 99;
    b.seconds_behind_master = 12;
    assert!(arrays_topology_equal(&[a.clone()], &[b.clone()]));

    b.io_state = SlaveIoState::No;
    assert!(!arrays_topology_equal(&[a], &[b]));
}

#[test]
fn monitor_exports_one_json_object_per_server() {
    let monitor = ClusterMonitor::new(two_server_config()).expect("valid config");
    let exported = monitor.to_json();
    let servers = exported.as_array().expect("array of servers");
    assert_eq!(servers.len(), 2);
    for server in servers {
        assert!(server["name"].is_string());
        // No backend was ever queried: positions and group are null, the
        // channel list empty.
        assert!(server["gtid_current_pos"].is_null());
        assert!(server["gtid_binlog_pos"].is_null());
        assert!(server["master_group"].is_null());
        assert_eq!(server["slave_connections"].as_array().map(Vec::len), Some(0));
    }
}

#[test]
fn monitor_rejects_bad_configuration() {
    let mut config = two_server_config();
    config.servers[1] = config.servers[0].clone();
    assert!(ClusterMonitor::new(config).is_err());
}

#[tokio::test]
async fn role_swap_request_with_unknown_server_reports_json_error() {
    let mut monitor = ClusterMonitor::new(two_server_config()).expect("valid config");
    let (ok, errors) = monitor.failover("db1", "db9").await;
    assert!(!ok);
    let message = errors[0]["error"].as_str().expect("one error object");
    assert!(message.contains("db9"));
}
