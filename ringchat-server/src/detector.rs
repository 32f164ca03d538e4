use crate::config::{ELECTION_RESTART_DELAY, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT};
use crate::election::Election;
use crate::peers::PeerLink;
use crate::ring::{PeerRecord, Ring};
use crate::session::Clients;
use dashmap::DashMap;
use ringchat_codec::{Body, NotificationKind, Record};
use ringchat_core::Shutdown;
use std::sync::Arc;
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, warn};

/// Heartbeat emitter toward the right neighbor, fused with the crash
/// sweep over every non-self member.
#[derive(Debug)]
pub struct Detector {
    self_id: String,
    ring: Arc<Ring>,
    peers: Arc<PeerLink>,
    election: Arc<Election>,
    clients: Arc<Clients>,
    last_seen: DashMap<String, Instant>,
}

impl Detector {
    pub fn new(
        self_id: String,
        ring: Arc<Ring>,
        peers: Arc<PeerLink>,
        election: Arc<Election>,
        clients: Arc<Clients>,
    ) -> Detector {
        Detector {
            self_id,
            ring,
            peers,
            election,
            clients,
            last_seen: DashMap::new(),
        }
    }

    /// Stamps a peer as alive. Called for every inbound peer heartbeat.
    pub fn observe(&self, server_id: &str) {
        self.last_seen
            .insert(server_id.to_string(), Instant::now());
    }

    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut ticker = interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => break,
            }
            self.emit().await;
            self.sweep().await;
        }
        debug!("heartbeat loop stopped");
    }

    /// Heartbeats go to the right neighbor only; a solo ring skips them.
    async fn emit(&self) {
        if let Some(right) = self.ring.right_neighbor() {
            let record = Record::new(Body::Heartbeat {
                server_id: self.self_id.clone(),
                is_leader: self.ring.is_leader(&self.self_id),
            });
            if let Err(err) = self.peers.send(&right, &record).await {
                debug!(cause = %err, peer = %right.server_id, "heartbeat send failed");
            }
        }
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let mut crashed = Vec::new();
        for peer in self.ring.members() {
            if peer.server_id == self.self_id {
                continue;
            }
            let last = self.last_seen.get(&peer.server_id).map(|e| *e.value());
            match last {
                // freshly joined peer: start its grace period now
                None => {
                    self.last_seen.insert(peer.server_id.clone(), now);
                }
                Some(last) if now.duration_since(last) > HEARTBEAT_TIMEOUT => {
                    crashed.push(peer);
                }
                Some(_) => {}
            }
        }
        for peer in crashed {
            self.on_crash(peer).await;
        }
    }

    async fn on_crash(&self, peer: PeerRecord) {
        warn!(peer = %peer.server_id, "peer crashed, removing from ring");
        self.ring.remove(&peer.server_id);
        self.last_seen.remove(&peer.server_id);
        self.peers.evict(&peer.server_id);

        self.clients.broadcast(&Record::new(Body::Notification {
            notification_type: NotificationKind::ServerLeft,
            username: None,
            leader_id: None,
            message: Some(format!("Server {} left the cluster", peer.server_id)),
        }));

        if peer.is_leader {
            warn!("leader crashed, scheduling re-election");
            let election = self.election.clone();
            tokio::spawn(async move {
                sleep(ELECTION_RESTART_DELAY).await;
                election.start("leader crashed").await;
            });
        }
    }
}
