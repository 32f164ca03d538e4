use crate::config::{HISTORY_LIMIT, HISTORY_TAIL};
use crate::peers::PeerLink;
use crate::ring::Ring;
use crate::session::Clients;
use ringchat_codec::{Body, Record};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};

/// Append-only replay log for late joiners. FIFO eviction at the cap.
#[derive(Debug)]
pub struct HistoryBuffer {
    entries: Mutex<VecDeque<Record>>,
    limit: usize,
}

impl HistoryBuffer {
    pub fn new(limit: usize) -> HistoryBuffer {
        HistoryBuffer {
            entries: Mutex::new(VecDeque::new()),
            limit,
        }
    }

    fn locked(&self) -> MutexGuard<'_, VecDeque<Record>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, record: Record) {
        let mut entries = self.locked();
        entries.push_back(record);
        while entries.len() > self.limit {
            entries.pop_front();
        }
    }

    /// The most recent `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<Record> {
        let entries = self.locked();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked().is_empty()
    }
}

/// Routes chat traffic: client messages go to the leader, the leader fans
/// accepted messages out to every peer, and every node delivers to its
/// own clients exactly once.
#[derive(Debug)]
pub struct Replicator {
    self_id: String,
    ring: Arc<Ring>,
    peers: Arc<PeerLink>,
    clients: Arc<Clients>,
    history: HistoryBuffer,
}

impl Replicator {
    pub fn new(
        self_id: String,
        ring: Arc<Ring>,
        peers: Arc<PeerLink>,
        clients: Arc<Clients>,
    ) -> Replicator {
        Replicator {
            self_id,
            ring,
            peers,
            clients,
            history: HistoryBuffer::new(HISTORY_LIMIT),
        }
    }

    /// A chat message arrived from one of our own clients.
    pub async fn on_client_message(&self, record: Record) {
        if self.ring.is_leader(&self.self_id) {
            self.accept(record).await;
        } else {
            self.forward_to_leader(record).await;
        }
    }

    /// A FORWARD_MESSAGE arrived from another server.
    ///
    /// As leader the embedded original is a newly accepted message; as a
    /// follower it is the leader's broadcast and must not be re-forwarded.
    pub async fn on_forward(&self, original: Record, origin: String) {
        if self.ring.is_leader(&self.self_id) {
            debug!(origin = %origin, "accepting forwarded message");
            self.accept(original).await;
        } else {
            debug!(origin = %origin, "applying replicated message");
            self.apply(original);
        }
    }

    /// Leader path: append, deliver locally, fan out to every other peer.
    async fn accept(&self, record: Record) {
        self.apply(record.clone());

        let forward = Record::new(Body::ForwardMessage {
            original_message: Box::new(record),
            origin_server_id: self.self_id.clone(),
        });
        for peer in self.ring.members() {
            if peer.server_id == self.self_id {
                continue;
            }
            if let Err(err) = self.peers.send(&peer, &forward).await {
                error!(cause = %err, peer = %peer.server_id, "failed to replicate message");
            }
        }
    }

    fn apply(&self, record: Record) {
        self.clients.broadcast(&record);
        self.history.push(record);
    }

    async fn forward_to_leader(&self, record: Record) {
        let leader = match self.ring.leader() {
            Some(leader) => leader,
            None => {
                error!("cannot forward message, no leader known");
                return;
            }
        };
        if leader.server_id == self.self_id {
            warn!("asked to forward to self, dropping message");
            return;
        }

        debug!(leader = %leader.server_id, "forwarding message to leader");
        let forward = Record::new(Body::ForwardMessage {
            original_message: Box::new(record),
            origin_server_id: self.self_id.clone(),
        });
        if let Err(err) = self.peers.send(&leader, &forward).await {
            error!(cause = %err, leader = %leader.server_id, "failed to forward to leader");
        }
    }

    /// The slice of history a newly joined client receives.
    pub fn history_tail(&self) -> Vec<Record> {
        self.history.tail(HISTORY_TAIL)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn chat(n: usize) -> Record {
        Record::new(Body::ChatMessage {
            username: "a".to_string(),
            content: format!("message {}", n),
            client_id: "c1".to_string(),
        })
    }

    fn content(record: &Record) -> &str {
        match &record.body {
            Body::ChatMessage { content, .. } => content,
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_history_keeps_insertion_order() {
        let history = HistoryBuffer::new(10);
        for n in 0..3 {
            history.push(chat(n));
        }
        let tail = history.tail(10);
        assert_eq!(tail.len(), 3);
        assert_eq!(content(&tail[0]), "message 0");
        assert_eq!(content(&tail[2]), "message 2");
    }

    #[test]
    fn test_history_evicts_oldest_first() {
        let history = HistoryBuffer::new(5);
        for n in 0..8 {
            history.push(chat(n));
        }
        assert_eq!(history.len(), 5);
        let tail = history.tail(5);
        assert_eq!(content(&tail[0]), "message 3");
        assert_eq!(content(&tail[4]), "message 7");
    }

    #[test]
    fn test_tail_returns_most_recent() {
        let history = HistoryBuffer::new(100);
        for n in 0..60 {
            history.push(chat(n));
        }
        let tail = history.tail(50);
        assert_eq!(tail.len(), 50);
        assert_eq!(content(&tail[0]), "message 10");
        assert_eq!(content(&tail[49]), "message 59");
    }

    #[test]
    fn test_tail_of_short_history() {
        let history = HistoryBuffer::new(100);
        history.push(chat(0));
        assert_eq!(history.tail(50).len(), 1);
        assert!(!history.is_empty());
    }
}
