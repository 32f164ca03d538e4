use ringchat_codec::PeerInfo;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// One live member of the cluster as this node sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerRecord {
    pub server_id: String,
    pub ip: String,
    pub port: u16,
    pub is_leader: bool,
}

#[derive(Debug, Default)]
struct State {
    members: HashMap<String, PeerRecord>,
    /// Canonical ring order: member ids sorted ascending. Every node
    /// derives the same order from the same membership set.
    order: Vec<String>,
    left: Option<String>,
    right: Option<String>,
}

/// The authoritative view of cluster membership and ring topology.
///
/// All mutations run under one lock and recompute the neighbor links
/// before releasing it; readers obtain cloned snapshots.
#[derive(Debug)]
pub struct Ring {
    self_id: String,
    state: Mutex<State>,
}

impl Ring {
    pub fn new(self_id: String) -> Ring {
        Ring {
            self_id,
            state: Mutex::new(State::default()),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    fn locked(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a member. Idempotent: returns false if the id was already known.
    pub fn add(&self, server_id: &str, ip: &str, port: u16, is_leader: bool) -> bool {
        let mut state = self.locked();
        if state.members.contains_key(server_id) {
            debug!(server = server_id, "already in ring");
            return false;
        }
        state.members.insert(
            server_id.to_string(),
            PeerRecord {
                server_id: server_id.to_string(),
                ip: ip.to_string(),
                port,
                is_leader,
            },
        );
        Self::rebuild(&mut state, &self.self_id);
        info!(
            server = server_id,
            size = state.members.len(),
            "added server to ring"
        );
        true
    }

    pub fn remove(&self, server_id: &str) -> Option<PeerRecord> {
        let mut state = self.locked();
        let removed = state.members.remove(server_id);
        match removed {
            Some(record) => {
                Self::rebuild(&mut state, &self.self_id);
                info!(
                    server = server_id,
                    size = state.members.len(),
                    "removed server from ring"
                );
                Some(record)
            }
            None => {
                warn!(server = server_id, "cannot remove, not in ring");
                None
            }
        }
    }

    fn rebuild(state: &mut State, self_id: &str) {
        let mut order: Vec<String> = state.members.keys().cloned().collect();
        order.sort();
        state.order = order;

        let len = state.order.len();
        let own = state.order.iter().position(|id| id == self_id);
        match own {
            Some(pos) if len >= 2 => {
                state.right = Some(state.order[(pos + 1) % len].clone());
                state.left = Some(state.order[(pos + len - 1) % len].clone());
            }
            _ => {
                state.right = None;
                state.left = None;
            }
        }
    }

    /// Marks `server_id` as leader, clearing the flag from everyone else.
    pub fn set_leader(&self, server_id: &str) {
        let mut state = self.locked();
        for record in state.members.values_mut() {
            record.is_leader = false;
        }
        if let Some(record) = state.members.get_mut(server_id) {
            record.is_leader = true;
            info!(leader = server_id, "leader set");
        } else {
            warn!(server = server_id, "cannot set unknown server as leader");
        }
    }

    pub fn leader(&self) -> Option<PeerRecord> {
        let state = self.locked();
        state.members.values().find(|r| r.is_leader).cloned()
    }

    pub fn is_leader(&self, server_id: &str) -> bool {
        let state = self.locked();
        state
            .members
            .get(server_id)
            .map(|r| r.is_leader)
            .unwrap_or(false)
    }

    pub fn right_neighbor(&self) -> Option<PeerRecord> {
        let state = self.locked();
        state
            .right
            .as_ref()
            .and_then(|id| state.members.get(id))
            .cloned()
    }

    pub fn left_neighbor(&self) -> Option<PeerRecord> {
        let state = self.locked();
        state
            .left
            .as_ref()
            .and_then(|id| state.members.get(id))
            .cloned()
    }

    /// All members in canonical ring order.
    pub fn members(&self) -> Vec<PeerRecord> {
        let state = self.locked();
        state
            .order
            .iter()
            .filter_map(|id| state.members.get(id))
            .cloned()
            .collect()
    }

    pub fn topology(&self) -> Vec<PeerInfo> {
        let state = self.locked();
        state
            .order
            .iter()
            .filter_map(|id| state.members.get(id))
            .map(|r| PeerInfo {
                server_id: r.server_id.clone(),
                ip: r.ip.clone(),
                port: r.port,
                is_leader: r.is_leader,
            })
            .collect()
    }

    pub fn size(&self) -> usize {
        self.locked().members.len()
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.locked().members.contains_key(server_id)
    }

    pub fn log_topology(&self) {
        let state = self.locked();
        info!("=== ring topology ===");
        for (i, id) in state.order.iter().enumerate() {
            let record = &state.members[id];
            let own = if *id == self.self_id { " (me)" } else { "" };
            let crown = if record.is_leader { " [leader]" } else { "" };
            info!("  {}: {}{}{}", i, record.server_id, crown, own);
        }
        info!(left = ?state.left, right = ?state.right, "neighbors");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ring(self_id: &str, ids: &[&str]) -> Ring {
        let ring = Ring::new(self_id.to_string());
        for (i, id) in ids.iter().enumerate() {
            ring.add(id, "127.0.0.1", 8001 + i as u16, false);
        }
        ring
    }

    #[test]
    fn test_single_member_has_no_neighbors() {
        let ring = ring("server-8001", &["server-8001"]);
        assert_eq!(ring.size(), 1);
        assert!(ring.right_neighbor().is_none());
        assert!(ring.left_neighbor().is_none());
    }

    #[test]
    fn test_two_members_are_mutual_neighbors() {
        let ring = ring("server-8001", &["server-8001", "server-8002"]);
        assert_eq!(ring.right_neighbor().unwrap().server_id, "server-8002");
        assert_eq!(ring.left_neighbor().unwrap().server_id, "server-8002");
    }

    #[test]
    fn test_order_is_sorted_regardless_of_insertion() {
        let ring = ring("server-8002", &["server-8003", "server-8001", "server-8002"]);
        let order: Vec<String> = ring.members().into_iter().map(|r| r.server_id).collect();
        assert_eq!(order, vec!["server-8001", "server-8002", "server-8003"]);
        assert_eq!(ring.right_neighbor().unwrap().server_id, "server-8003");
        assert_eq!(ring.left_neighbor().unwrap().server_id, "server-8001");
    }

    #[test]
    fn test_wrap_around_neighbors() {
        let ring = ring("server-8003", &["server-8001", "server-8002", "server-8003"]);
        assert_eq!(ring.right_neighbor().unwrap().server_id, "server-8001");
        assert_eq!(ring.left_neighbor().unwrap().server_id, "server-8002");
    }

    #[test]
    fn test_add_is_idempotent() {
        let ring = ring("server-8001", &["server-8001", "server-8002"]);
        assert!(!ring.add("server-8002", "127.0.0.1", 9999, false));
        assert_eq!(ring.size(), 2);
        // the original record is untouched
        let peer = ring
            .members()
            .into_iter()
            .find(|r| r.server_id == "server-8002")
            .unwrap();
        assert_eq!(peer.port, 8002);
    }

    #[test]
    fn test_set_leader_is_exclusive() {
        let ring = ring("server-8001", &["server-8001", "server-8002", "server-8003"]);
        ring.set_leader("server-8002");
        ring.set_leader("server-8003");
        let leaders: Vec<PeerRecord> =
            ring.members().into_iter().filter(|r| r.is_leader).collect();
        assert_eq!(leaders.len(), 1);
        assert_eq!(leaders[0].server_id, "server-8003");
        assert!(ring.is_leader("server-8003"));
        assert!(!ring.is_leader("server-8002"));
    }

    #[test]
    fn test_set_leader_is_idempotent() {
        let ring = ring("server-8001", &["server-8001", "server-8002"]);
        ring.set_leader("server-8002");
        ring.set_leader("server-8002");
        assert_eq!(ring.leader().unwrap().server_id, "server-8002");
    }

    #[test]
    fn test_remove_rebuilds_neighbors() {
        let ring = ring("server-8001", &["server-8001", "server-8002", "server-8003"]);
        ring.remove("server-8002");
        assert_eq!(ring.right_neighbor().unwrap().server_id, "server-8003");
        assert_eq!(ring.left_neighbor().unwrap().server_id, "server-8003");
        ring.remove("server-8003");
        assert!(ring.right_neighbor().is_none());
    }

    #[test]
    fn test_neighbors_are_a_function_of_membership() {
        // two nodes with the same membership derive consistent topology
        let a = ring("server-8001", &["server-8001", "server-8002", "server-8003"]);
        let b = ring("server-8002", &["server-8002", "server-8003", "server-8001"]);
        let order_a: Vec<String> = a.members().into_iter().map(|r| r.server_id).collect();
        let order_b: Vec<String> = b.members().into_iter().map(|r| r.server_id).collect();
        assert_eq!(order_a, order_b);
        assert_eq!(a.right_neighbor().unwrap().server_id, "server-8002");
        assert_eq!(b.right_neighbor().unwrap().server_id, "server-8003");
        assert_eq!(b.left_neighbor().unwrap().server_id, "server-8001");
    }
}
