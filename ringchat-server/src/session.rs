use bytes::Bytes;
use dashmap::DashMap;
use ringchat_codec::{self as codec, Record};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// One connected chat user. Outbound traffic goes through the session's
/// channel and is drained by the per-client writer loop, so no lock is
/// ever held during socket I/O.
#[derive(Debug)]
pub struct ClientSession {
    pub client_id: String,
    pub username: String,
    pub addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Bytes>,
}

impl ClientSession {
    pub fn new(
        client_id: String,
        username: String,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Bytes>,
    ) -> ClientSession {
        ClientSession {
            client_id,
            username,
            addr,
            outbound,
        }
    }

    fn send(&self, data: Bytes) -> bool {
        self.outbound.send(data).is_ok()
    }
}

/// Registry of the clients attached to this node.
#[derive(Debug, Default)]
pub struct Clients {
    sessions: DashMap<String, ClientSession>,
}

impl Clients {
    pub fn new() -> Clients {
        Clients {
            sessions: DashMap::new(),
        }
    }

    pub fn register(&self, session: ClientSession) {
        debug!(client = %session.client_id, username = %session.username, "client registered");
        self.sessions.insert(session.client_id.clone(), session);
    }

    pub fn remove(&self, client_id: &str) -> Option<ClientSession> {
        self.sessions.remove(client_id).map(|(_, session)| session)
    }

    /// Serializes once, then hands the frame to every session; sessions
    /// whose writer is gone are evicted.
    pub fn broadcast(&self, record: &Record) {
        let data = match codec::encode(record) {
            Ok(data) => data,
            Err(err) => {
                error!(cause = %err, "failed to encode broadcast");
                return;
            }
        };

        let mut dead = Vec::new();
        for session in self.sessions.iter() {
            if !session.value().send(data.clone()) {
                dead.push(session.key().clone());
            }
        }
        for client_id in dead {
            debug!(client = %client_id, "evicting dead client session");
            self.sessions.remove(&client_id);
        }
    }

    pub fn send_to(&self, client_id: &str, record: &Record) -> bool {
        let data = match codec::encode(record) {
            Ok(data) => data,
            Err(err) => {
                error!(cause = %err, "failed to encode record");
                return false;
            }
        };
        match self.sessions.get(client_id) {
            Some(session) => session.send(data),
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ringchat_codec::Body;

    fn session(id: &str) -> (ClientSession, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = "127.0.0.1:40000".parse().unwrap();
        (
            ClientSession::new(id.to_string(), format!("user-{}", id), addr, tx),
            rx,
        )
    }

    fn chat(content: &str) -> Record {
        Record::new(Body::ChatMessage {
            username: "a".to_string(),
            content: content.to_string(),
            client_id: "c1".to_string(),
        })
    }

    #[test]
    fn test_broadcast_reaches_every_session() {
        let clients = Clients::new();
        let (s1, mut rx1) = session("c1");
        let (s2, mut rx2) = session("c2");
        clients.register(s1);
        clients.register(s2);

        clients.broadcast(&chat("hello"));

        let d1 = rx1.try_recv().unwrap();
        let d2 = rx2.try_recv().unwrap();
        assert_eq!(d1, d2);
        assert_eq!(d1.last(), Some(&b'\n'));
    }

    #[test]
    fn test_broadcast_evicts_dead_sessions() {
        let clients = Clients::new();
        let (s1, rx1) = session("c1");
        let (s2, _rx2) = session("c2");
        clients.register(s1);
        clients.register(s2);
        drop(rx1);

        clients.broadcast(&chat("hello"));
        assert_eq!(clients.count(), 1);
        assert!(!clients.send_to("c1", &chat("again")));
        assert!(clients.send_to("c2", &chat("again")));
    }

    #[test]
    fn test_remove_returns_session() {
        let clients = Clients::new();
        let (s1, _rx) = session("c1");
        clients.register(s1);
        let removed = clients.remove("c1").unwrap();
        assert_eq!(removed.username, "user-c1");
        assert!(clients.remove("c1").is_none());
        assert_eq!(clients.count(), 0);
    }
}
