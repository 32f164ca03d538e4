use crate::config::{
    ELECTION_MESSAGE_DELAY, ELECTION_RESTART_DELAY, ELECTION_RETRY_DELAY, ELECTION_TIMEOUT,
};
use crate::peers::PeerLink;
use crate::ring::Ring;
use crate::session::Clients;
use ringchat_codec::{Body, NotificationKind, Record};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// What to do with an inbound ballot, decided under the state lock.
#[derive(Debug, PartialEq)]
enum Step {
    /// The ballot completed a full traversal; the carried candidate wins.
    Complete(String),
    Forward {
        candidate: String,
        originator: String,
        hop: u32,
    },
}

/// Picks the next step for a ballot at this node.
///
/// A greater candidate is passed on unchanged, a lesser one is replaced by
/// our own id, and a ballot whose originator is us has been around the
/// whole ring, which elects the carried candidate.
fn decide(self_id: &str, candidate: &str, originator: &str, hop: u32) -> Step {
    if originator == self_id {
        return Step::Complete(candidate.to_string());
    }
    if candidate < self_id {
        Step::Forward {
            candidate: self_id.to_string(),
            originator: originator.to_string(),
            hop: hop + 1,
        }
    } else {
        // equal ids should not occur; forwarding as-is is harmless
        Step::Forward {
            candidate: candidate.to_string(),
            originator: originator.to_string(),
            hop: hop + 1,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    in_progress: bool,
    election_id: Option<String>,
    candidate: Option<String>,
    originator: Option<String>,
    /// Bumped on every arm/cancel; a timer only fires if its generation
    /// is still current.
    timer_gen: u64,
}

/// Ring election driven by inbound ballots and local triggers.
///
/// All transitions run under one lock so that ballot handling and timer
/// expiry are mutually exclusive; sends happen after the lock is released.
#[derive(Debug)]
pub struct Election {
    self_id: String,
    ring: Arc<Ring>,
    peers: Arc<PeerLink>,
    clients: Arc<Clients>,
    state: Mutex<State>,
}

impl Election {
    pub fn new(
        self_id: String,
        ring: Arc<Ring>,
        peers: Arc<PeerLink>,
        clients: Arc<Clients>,
    ) -> Election {
        Election {
            self_id,
            ring,
            peers,
            clients,
            state: Mutex::new(State::default()),
        }
    }

    fn locked(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn in_progress(&self) -> bool {
        self.locked().in_progress
    }

    /// Starts a new election, or self-declares when the ring is solo.
    pub async fn start(self: Arc<Self>, reason: &str) {
        if self.ring.right_neighbor().is_none() {
            info!("no neighbors in ring, declaring self leader");
            self.declare_self();
            return;
        }

        let gen = {
            let mut state = self.locked();
            if state.in_progress {
                warn!("election already in progress, ignoring start request");
                return;
            }
            state.in_progress = true;
            state.election_id = Some(election_id_now());
            state.candidate = Some(self.self_id.clone());
            state.originator = Some(self.self_id.clone());
            state.timer_gen += 1;
            state.timer_gen
        };

        info!(reason, "starting election");
        tokio::spawn(self.clone().expire(gen));
        self.forward(self.self_id.clone(), self.self_id.clone(), 0)
            .await;
    }

    /// Handles an inbound ELECTION record.
    ///
    /// If the ring has no right neighbor yet the ballot is parked once for
    /// a short grace period, then dropped.
    pub async fn handle_ballot(
        self: Arc<Self>,
        candidate_id: String,
        originator_id: String,
        hop_count: u32,
        election_id: String,
    ) {
        debug!(
            candidate = %candidate_id,
            originator = %originator_id,
            hops = hop_count,
            "received election ballot"
        );

        if self.ring.right_neighbor().is_none() {
            warn!("ring not ready, deferring election ballot");
            sleep(ELECTION_RETRY_DELAY).await;
            if self.ring.right_neighbor().is_none() {
                error!("ring still not ready, dropping election ballot");
                return;
            }
            info!("ring now ready, resuming deferred ballot");
        }

        let (step, armed) = {
            let mut state = self.locked();
            let mut armed = None;
            if !state.in_progress {
                info!("joining election");
                state.in_progress = true;
                state.election_id = Some(election_id);
                state.timer_gen += 1;
                armed = Some(state.timer_gen);
            }
            let step = decide(&self.self_id, &candidate_id, &originator_id, hop_count);
            if let Step::Forward { ref candidate, .. } = step {
                state.candidate = Some(candidate.clone());
                state.originator = Some(originator_id.clone());
            }
            (step, armed)
        };

        if let Some(gen) = armed {
            tokio::spawn(self.clone().expire(gen));
        }

        match step {
            Step::Complete(winner) => {
                info!(winner = %winner, "election completed full traversal");
                self.complete(&winner).await;
            }
            Step::Forward {
                candidate,
                originator,
                hop,
            } => self.forward(candidate, originator, hop).await,
        }
    }

    /// Handles an inbound LEADER_ANNOUNCEMENT, accepting the leader and
    /// re-forwarding once around the ring unless we are the winner.
    pub async fn handle_announcement(&self, leader_id: String) {
        info!(leader = %leader_id, "leader announced");
        self.ring.set_leader(&leader_id);
        {
            let mut state = self.locked();
            state.in_progress = false;
            state.timer_gen += 1;
            state.election_id = None;
            state.candidate = None;
            state.originator = None;
        }
        self.notify_elected(&leader_id);

        if leader_id != self.self_id {
            sleep(ELECTION_MESSAGE_DELAY).await;
            self.announce(&leader_id).await;
        }
    }

    /// Completion at the originator: the winner becomes leader and the
    /// announcement starts its traversal.
    async fn complete(&self, winner: &str) {
        self.ring.set_leader(winner);
        self.announce(winner).await;
        {
            let mut state = self.locked();
            state.in_progress = false;
            state.timer_gen += 1;
            state.election_id = None;
            state.candidate = None;
            state.originator = None;
        }
        self.notify_elected(winner);
    }

    fn declare_self(&self) {
        self.ring.set_leader(&self.self_id);
        {
            let mut state = self.locked();
            state.in_progress = false;
            state.timer_gen += 1;
            state.election_id = None;
            state.candidate = None;
            state.originator = None;
        }
        self.notify_elected(&self.self_id);
    }

    async fn forward(&self, candidate: String, originator: String, hop: u32) {
        sleep(ELECTION_MESSAGE_DELAY).await;
        match self.ring.right_neighbor() {
            Some(right) => {
                let record = Record::new(Body::Election {
                    candidate_id: candidate,
                    originator_id: originator,
                    hop_count: hop,
                });
                if let Err(err) = self.peers.send(&right, &record).await {
                    error!(cause = %err, peer = %right.server_id, "failed to send ballot");
                }
            }
            None => warn!("no right neighbor to send ballot to"),
        }
    }

    async fn announce(&self, leader_id: &str) {
        match self.ring.right_neighbor() {
            Some(right) => {
                let record = Record::new(Body::LeaderAnnouncement {
                    leader_id: leader_id.to_string(),
                    ring_topology: self.ring.topology(),
                });
                if let Err(err) = self.peers.send(&right, &record).await {
                    error!(cause = %err, peer = %right.server_id, "failed to send leader announcement");
                }
            }
            None => warn!("no right neighbor for leader announcement"),
        }
    }

    /// Election timer. Fires only if its generation is still current, so
    /// completion or announcement acceptance cancels it for free.
    ///
    /// Boxed because `expire` and `start` call each other, and that mutual
    /// async recursion otherwise leaves the compiler unable to prove the
    /// returned future is `Send`.
    fn expire(
        self: Arc<Self>,
        gen: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            sleep(ELECTION_TIMEOUT).await;
            let fired = {
                let state = self.locked();
                state.in_progress && state.timer_gen == gen
            };
            if !fired {
                return;
            }

            error!("election timed out");
            self.locked().in_progress = false;

            if self.ring.right_neighbor().is_none() {
                warn!("no neighbors left, canceling election restart");
                self.declare_self();
                return;
            }

            info!("restarting election");
            sleep(ELECTION_RESTART_DELAY).await;
            self.start("election timeout").await;
        })
    }

    fn notify_elected(&self, leader_id: &str) {
        if leader_id == self.self_id {
            info!("elected as cluster leader");
        } else {
            info!(leader = %leader_id, "following leader");
        }
        self.clients.broadcast(&Record::new(Body::Notification {
            notification_type: NotificationKind::LeaderChanged,
            username: None,
            leader_id: Some(leader_id.to_string()),
            message: Some(format!("New leader elected: {}", leader_id)),
        }));
    }
}

fn election_id_now() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_returning_ballot_completes() {
        let step = decide("server-8001", "server-8003", "server-8001", 2);
        assert_eq!(step, Step::Complete("server-8003".to_string()));
    }

    #[test]
    fn test_greater_candidate_forwarded_unchanged() {
        let step = decide("server-8002", "server-8003", "server-8001", 0);
        assert_eq!(
            step,
            Step::Forward {
                candidate: "server-8003".to_string(),
                originator: "server-8001".to_string(),
                hop: 1,
            }
        );
    }

    #[test]
    fn test_lesser_candidate_replaced_by_self() {
        let step = decide("server-8002", "server-8001", "server-8001", 0);
        assert_eq!(
            step,
            Step::Forward {
                candidate: "server-8002".to_string(),
                originator: "server-8001".to_string(),
                hop: 1,
            }
        );
    }

    #[test]
    fn test_equal_candidate_forwarded_as_is() {
        let step = decide("server-8002", "server-8002", "server-8001", 4);
        assert_eq!(
            step,
            Step::Forward {
                candidate: "server-8002".to_string(),
                originator: "server-8001".to_string(),
                hop: 5,
            }
        );
    }

    #[test]
    fn test_completion_wins_over_comparison() {
        // even a lesser candidate wins once the ballot is back home
        let step = decide("server-8009", "server-8001", "server-8009", 7);
        assert_eq!(step, Step::Complete("server-8001".to_string()));
    }
}
