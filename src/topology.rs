//! Replication topology analysis.
//!
//! Turns the per-agent slave connection arrays into a directed replication
//! graph, finds multi-master rings as strongly connected components, labels
//! which nodes the master can reach, and writes the resulting role bits into
//! each server's shared status word. The analysis itself is pure: it reads
//! the agent caches and touches no backend.

use crate::agent::ServerAgent;
use crate::status;

/// Tarjan index of a node that has not been visited yet.
const INDEX_NOT_VISITED: u32 = 0;
/// Cycle id of a node outside every multi-master ring.
pub const CYCLE_NONE: i64 = 0;

/// Reachability of a node from the master candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reach {
    #[default]
    Unknown,
    Reached,
    Unreached,
}

/// Per-server scratch of the topology analysis. Adjacency lists hold indexes
/// into the monitor's agent array and are rebuilt every pass.
#[derive(Debug, Default)]
pub struct NodeData {
    pub(crate) index: u32,
    pub(crate) lowest_index: u32,
    pub(crate) in_stack: bool,
    pub(crate) cycle: i64,
    pub(crate) reach: Reach,
    /// Servers this node replicates from.
    pub(crate) parents: Vec<usize>,
    /// Servers replicating from this node.
    pub(crate) children: Vec<usize>,
    /// Master endpoints outside the monitored set.
    pub(crate) external_masters: Vec<(String, u16)>,
}

impl NodeData {
    /// The ring this node belongs to, if any.
    pub fn cycle_id(&self) -> Option<i64> {
        (self.cycle != CYCLE_NONE).then_some(self.cycle)
    }

    pub fn reach(&self) -> Reach {
        self.reach
    }

    fn reset_results(&mut self) {
        self.cycle = CYCLE_NONE;
        self.reach = Reach::Unknown;
        self.parents.clear();
        self.children.clear();
        self.external_masters.clear();
    }

    fn reset_indexes(&mut self) {
        self.index = INDEX_NOT_VISITED;
        self.lowest_index = INDEX_NOT_VISITED;
        self.in_stack = false;
    }
}

/// Run the full topology pass over all agents and publish role bits.
pub fn analyze(agents: &mut [ServerAgent], assume_unique_hostnames: bool) {
    let old_cycles: Vec<i64> = agents.iter().map(|a| a.node.cycle).collect();

    build_replication_graph(agents, assume_unique_hostnames);
    find_cycles(agents);
    label_reach(agents);
    assign_roles(agents);

    for (agent, old_cycle) in agents.iter_mut().zip(old_cycles) {
        if agent.node.cycle != old_cycle {
            agent.mark_topology_changed();
        }
    }
}

/// Build parent/child adjacency from live slave connections. A connection
/// counts when its IO thread is connected or connecting and its SQL thread
/// runs. The parent is matched by endpoint, or by server id when hostnames
/// cannot be assumed unique; connections whose master is not among the
/// monitored servers are recorded as external.
fn build_replication_graph(agents: &mut [ServerAgent], assume_unique_hostnames: bool) {
    for agent in agents.iter_mut() {
        agent.node.reset_results();
        agent.node.reset_indexes();
    }

    for child in 0..agents.len() {
        let connections = agents[child].slave_status_snapshot();
        for conn in connections {
            if !conn.io_state.is_running() || !conn.sql_running {
                continue;
            }
            let parent = if assume_unique_hostnames {
                agents
                    .iter()
                    .position(|a| a.host() == conn.master_host && a.port() == conn.master_port)
            } else if conn.master_server_id > 0 && conn.seen_connected {
                agents.iter().position(|a| a.server_id() == conn.master_server_id)
            } else {
                None
            };
            match parent {
                Some(parent) if parent != child => {
                    agents[child].node.parents.push(parent);
                    agents[parent].node.children.push(child);
                }
                Some(_) => {} // A connection to itself adds nothing.
                None => agents[child]
                    .node
                    .external_masters
                    .push((conn.master_host.clone(), conn.master_port)),
            }
        }
    }
}

/// Iterative Tarjan over the parent edges. Every strongly connected
/// component with more than one member is a multi-master ring and gets a
/// distinct nonzero cycle id. Components are emitted in a deterministic
/// order for a given input, so ids are stable across ticks when the graph
/// does not change.
fn find_cycles(agents: &mut [ServerAgent]) {
    let n = agents.len();
    let adjacency: Vec<Vec<usize>> = agents.iter().map(|a| a.node.parents.clone()).collect();

    let mut index = vec![INDEX_NOT_VISITED; n];
    let mut lowlink = vec![INDEX_NOT_VISITED; n];
    let mut on_stack = vec![false; n];
    let mut cycles = vec![CYCLE_NONE; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut next_index = INDEX_NOT_VISITED + 1;
    let mut next_cycle = CYCLE_NONE + 1;

    for start in 0..n {
        if index[start] != INDEX_NOT_VISITED {
            continue;
        }

        index[start] = next_index;
        lowlink[start] = next_index;
        next_index += 1;
        stack.push(start);
        on_stack[start] = true;
        // Explicit recursion frames: (node, next edge to follow).
        let mut frames: Vec<(usize, usize)> = vec![(start, 0)];

        while let Some(&mut (node, ref mut edge)) = frames.last_mut() {
            if *edge < adjacency[node].len() {
                let next = adjacency[node][*edge];
                *edge += 1;
                if index[next] == INDEX_NOT_VISITED {
                    index[next] = next_index;
                    lowlink[next] = next_index;
                    next_index += 1;
                    stack.push(next);
                    on_stack[next] = true;
                    frames.push((next, 0));
                } else if on_stack[next] {
                    lowlink[node] = lowlink[node].min(index[next]);
                }
            } else {
                frames.pop();
                if let Some(&mut (parent, _)) = frames.last_mut() {
                    lowlink[parent] = lowlink[parent].min(lowlink[node]);
                }
                if lowlink[node] == index[node] {
                    // This node is the root of a component; pop its members.
                    let mut members = Vec::new();
                    while let Some(member) = stack.pop() {
                        on_stack[member] = false;
                        members.push(member);
                        if member == node {
                            break;
                        }
                    }
                    if members.len() > 1 {
                        for &member in &members {
                            cycles[member] = next_cycle;
                        }
                        next_cycle += 1;
                    }
                }
            }
        }
    }

    for (i, agent) in agents.iter_mut().enumerate() {
        agent.node.index = index[i];
        agent.node.lowest_index = lowlink[i];
        agent.node.in_stack = false;
        agent.node.cycle = cycles[i];
    }
}

/// Mark every node reachable from a master candidate, where a candidate is a
/// node without internal parents. Ring members all have parents, so a ring
/// without an outside master leaves its subtree unreached, which is exactly
/// what keeps the monitor from calling anyone in it the master.
fn label_reach(agents: &mut [ServerAgent]) {
    let n = agents.len();
    let children: Vec<Vec<usize>> = agents.iter().map(|a| a.node.children.clone()).collect();

    let mut reached = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    for (i, agent) in agents.iter().enumerate() {
        if agent.node.parents.is_empty() {
            reached[i] = true;
            stack.push(i);
        }
    }
    while let Some(node) = stack.pop() {
        for &child in &children[node] {
            if !reached[child] {
                reached[child] = true;
                stack.push(child);
            }
        }
    }

    for (i, agent) in agents.iter_mut().enumerate() {
        agent.node.reach = if reached[i] { Reach::Reached } else { Reach::Unreached };
    }
}

fn reachable_slaves(from: usize, children: &[Vec<usize>], agents: &[ServerAgent]) -> usize {
    let mut seen = vec![false; agents.len()];
    seen[from] = true;
    let mut stack = vec![from];
    let mut count = 0;
    while let Some(node) = stack.pop() {
        for &child in &children[node] {
            if !seen[child] {
                seen[child] = true;
                if agents[child].is_running() {
                    count += 1;
                }
                stack.push(child);
            }
        }
    }
    count
}

/// Pick the master and write role bits. The master is the usable candidate
/// (no internal parents, not in a ring) with the most reachable running
/// slaves; ties go to the first by array order. Nodes the master reaches are
/// slaves, slaves with slave children are relay masters, and nodes whose
/// only master is outside the monitored set are marked accordingly. Servers
/// in maintenance keep no roles; maintenance and health bits themselves are
/// left untouched.
fn assign_roles(agents: &mut [ServerAgent]) {
    let n = agents.len();
    let children: Vec<Vec<usize>> = agents.iter().map(|a| a.node.children.clone()).collect();

    let mut best: Option<(usize, usize)> = None; // (reachable slaves, node)
    for (i, agent) in agents.iter().enumerate() {
        if !agent.is_usable()
            || !agent.node.parents.is_empty()
            || agent.node.cycle_id().is_some()
        {
            continue;
        }
        let count = reachable_slaves(i, &children, agents);
        if best.map_or(true, |(best_count, _)| count > best_count) {
            best = Some((count, i));
        }
    }

    let mut roles = vec![0u64; n];
    if let Some((_, master)) = best {
        roles[master] |= status::MASTER;

        let mut seen = vec![false; n];
        seen[master] = true;
        let mut stack = vec![master];
        while let Some(node) = stack.pop() {
            for &child in &children[node] {
                if !seen[child] {
                    seen[child] = true;
                    if agents[child].is_running() {
                        roles[child] |= status::SLAVE;
                    }
                    stack.push(child);
                }
            }
        }

        for i in 0..n {
            if roles[i] & status::SLAVE != 0
                && children[i].iter().any(|&child| roles[child] & status::SLAVE != 0)
            {
                roles[i] |= status::RELAY_MASTER;
            }
        }
    }

    // A node replicating from outside the monitored set carries the external
    // flag in addition to whatever internal role it has, e.g. a cluster
    // master fed from another datacenter.
    for (i, agent) in agents.iter().enumerate() {
        if !agent.node.external_masters.is_empty() && agent.is_running() {
            roles[i] |= status::SLAVE_OF_EXT_MASTER;
        }
    }

    for (i, agent) in agents.iter().enumerate() {
        let role = if agent.is_in_maintenance() { 0 } else { roles[i] };
        agent.store_roles(role);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ServerAgent, ServerRef};
    use crate::status;

    fn cluster(count: usize) -> Vec<ServerAgent> {
        (0..count)
            .map(|i| {
                ServerAgent::mock(
                    &format!("db{}", i + 1),
                    &format!("db{}.local", i + 1),
                    3306,
                    (i + 1) as i64,
                )
            })
            .collect()
    }

    fn link(agents: &mut [ServerAgent], child: usize, parent: usize) {
        let master = agents[parent].server_ref();
        agents[child].mock_channel_to(&master);
    }

    #[test]
    fn test_master_slave_chain_roles() {
        let mut agents = cluster(3);
        link(&mut agents, 1, 0); // db2 replicates from db1
        link(&mut agents, 2, 1); // db3 replicates from db2

        analyze(&mut agents, true);

        assert!(agents[0].is_master());
        assert!(!agents[0].is_slave());
        assert!(agents[1].is_slave());
        assert!(agents[1].is_relay_master());
        assert!(agents[2].is_slave());
        assert!(!agents[2].is_relay_master());
        assert!(agents.iter().all(|a| a.node.cycle_id().is_none()));
        assert_eq!(agents[2].node.reach(), Reach::Reached);
    }

    #[test]
    fn test_star_topology_roles() {
        let mut agents = cluster(4);
        link(&mut agents, 1, 0);
        link(&mut agents, 2, 0);
        link(&mut agents, 3, 0);

        analyze(&mut agents, true);

        assert!(agents[0].is_master());
        for slave in &agents[1..] {
            assert!(slave.is_slave());
            assert!(!slave.is_relay_master());
        }
    }

    #[test]
    fn test_two_node_ring_gets_common_cycle_and_no_master() {
        let mut agents = cluster(2);
        link(&mut agents, 0, 1);
        link(&mut agents, 1, 0);

        analyze(&mut agents, true);

        let cycle_a = agents[0].node.cycle_id().expect("in a cycle");
        let cycle_b = agents[1].node.cycle_id().expect("in a cycle");
        assert_eq!(cycle_a, cycle_b);
        assert_ne!(cycle_a, CYCLE_NONE);
        assert!(!agents[0].is_master());
        assert!(!agents[1].is_master());
    }

    #[test]
    fn test_sccs_match_classical_components() {
        // 0 <-> 1 <-> 2 form one ring, 3 -> 4 is a chain, 5 is isolated,
        // 6 <-> 7 is a second ring hanging off the first.
        let mut agents = cluster(8);
        link(&mut agents, 0, 1);
        link(&mut agents, 1, 2);
        link(&mut agents, 2, 0);
        link(&mut agents, 3, 4);
        link(&mut agents, 6, 7);
        link(&mut agents, 7, 6);
        link(&mut agents, 6, 2);

        analyze(&mut agents, true);

        let ring1 = agents[0].node.cycle_id().expect("ring");
        assert_eq!(agents[1].node.cycle_id(), Some(ring1));
        assert_eq!(agents[2].node.cycle_id(), Some(ring1));

        let ring2 = agents[6].node.cycle_id().expect("ring");
        assert_eq!(agents[7].node.cycle_id(), Some(ring2));
        assert_ne!(ring1, ring2);

        assert_eq!(agents[3].node.cycle_id(), None);
        assert_eq!(agents[4].node.cycle_id(), None);
        assert_eq!(agents[5].node.cycle_id(), None);
    }

    #[test]
    fn test_cycle_ids_stable_across_passes() {
        let mut agents = cluster(4);
        link(&mut agents, 0, 1);
        link(&mut agents, 1, 0);
        link(&mut agents, 2, 3);
        link(&mut agents, 3, 2);

        analyze(&mut agents, true);
        let first: Vec<_> = agents.iter().map(|a| a.node.cycle_id()).collect();
        analyze(&mut agents, true);
        let second: Vec<_> = agents.iter().map(|a| a.node.cycle_id()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_external_master_marks_node() {
        let mut agents = cluster(2);
        link(&mut agents, 1, 0);
        let external = ServerRef {
            name: "outside".to_string(),
            host: "outside.example.com".to_string(),
            port: 3306,
            server_id: 99,
        };
        agents[0].mock_channel_to(&external);

        analyze(&mut agents, true);

        // db1 replicates from an unmonitored server but still heads the
        // monitored subtree.
        assert!(agents[0].has_status(status::SLAVE_OF_EXT_MASTER));
        assert!(agents[1].is_slave());
    }

    #[test]
    fn test_parent_lookup_by_server_id() {
        let mut agents = cluster(2);
        // Channel names a host the monitor does not know, but carries the
        // right master server id.
        let mut master = agents[0].server_ref();
        master.host = "alias.example.com".to_string();
        agents[1].mock_channel_to(&master);

        analyze(&mut agents, false);
        assert!(agents[0].is_master());
        assert!(agents[1].is_slave());

        // With unique hostnames assumed, the same channel is external.
        analyze(&mut agents, true);
        assert!(agents[1].has_status(status::SLAVE_OF_EXT_MASTER));
    }

    #[test]
    fn test_down_master_yields_no_roles() {
        let mut agents = cluster(2);
        link(&mut agents, 1, 0);
        agents[0].clear_status(status::RUNNING);

        analyze(&mut agents, true);
        assert!(!agents[0].is_master());
        assert!(!agents[1].is_slave());
    }

    #[test]
    fn test_maintenance_clears_roles_but_keeps_flag() {
        let mut agents = cluster(2);
        link(&mut agents, 1, 0);
        agents[1].set_status(status::MAINTENANCE);

        analyze(&mut agents, true);
        assert!(agents[0].is_master());
        assert!(!agents[1].is_slave());
        assert!(agents[1].is_in_maintenance());
    }
}
