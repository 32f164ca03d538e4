use crate::config::CONNECT_TIMEOUT;
use crate::ring::PeerRecord;
use dashmap::DashMap;
use ringchat_codec::Record;
use ringchat_core::Connection;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

/// Lazy cache of outbound peer sockets, one per peer id.
///
/// A failed send closes and evicts the socket; the failure detector then
/// observes the loss through missing heartbeats.
#[derive(Debug, Default)]
pub struct PeerLink {
    links: DashMap<String, Arc<Mutex<Connection>>>,
}

impl PeerLink {
    pub fn new() -> PeerLink {
        PeerLink {
            links: DashMap::new(),
        }
    }

    pub async fn send(&self, peer: &PeerRecord, record: &Record) -> crate::Result<()> {
        let link = match self.links.get(&peer.server_id).map(|l| l.value().clone()) {
            Some(link) => link,
            None => self.connect(peer).await?,
        };

        let mut connection = link.lock().await;
        if let Err(err) = connection.write_frame(record).await {
            drop(connection);
            self.evict(&peer.server_id);
            return Err(err.into());
        }
        debug!(kind = record.body.kind(), peer = %peer.server_id, "sent record");
        Ok(())
    }

    async fn connect(&self, peer: &PeerRecord) -> crate::Result<Arc<Mutex<Connection>>> {
        let stream = timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((peer.ip.as_str(), peer.port)),
        )
        .await??;
        debug!(peer = %peer.server_id, "connected to peer");
        let link = Arc::new(Mutex::new(Connection::new(stream)));
        self.links.insert(peer.server_id.clone(), link.clone());
        Ok(link)
    }

    /// Drops the cached socket for a peer, closing it.
    pub fn evict(&self, server_id: &str) {
        if self.links.remove(server_id).is_some() {
            debug!(peer = server_id, "evicted peer connection");
        }
    }

    pub fn clear(&self) {
        self.links.clear();
    }
}
