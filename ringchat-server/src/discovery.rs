use crate::config::{
    DISCOVERY_INTERVAL, MULTICAST_GROUP, MULTICAST_PORT, MULTICAST_TTL,
};
use dashmap::DashMap;
use ringchat_codec::{self as codec, Body, Record, MAX_FRAME};
use ringchat_core::{Shutdown, ShutdownNotify};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

/// Best-effort guess of the address peers can reach us on. The socket is
/// never actually written to.
pub fn local_ip() -> String {
    let probe = || -> io::Result<SocketAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        socket.local_addr()
    };
    match probe() {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => "127.0.0.1".to_string(),
    }
}

/// A peer seen on the multicast group. Existence only; liveness is the
/// failure detector's business.
#[derive(Clone, Debug)]
pub struct Discovered {
    pub server_id: String,
    pub ip: String,
    pub port: u16,
    pub last_seen: Instant,
}

/// Periodic multicast beacon plus listener. The first sighting of an id
/// is published on the event channel for the ring to pick up.
#[derive(Debug)]
pub struct Discovery {
    server_id: String,
    ip: String,
    port: u16,
    discovered: DashMap<String, Discovered>,
    events: mpsc::UnboundedSender<(String, String, u16)>,
}

impl Discovery {
    pub fn new(
        server_id: String,
        ip: String,
        port: u16,
        events: mpsc::UnboundedSender<(String, String, u16)>,
    ) -> Discovery {
        Discovery {
            server_id,
            ip,
            port,
            discovered: DashMap::new(),
            events,
        }
    }

    /// Binds both multicast sockets and spawns the announce and listen
    /// loops. A bind failure here is fatal to the node.
    pub async fn start(
        self: Arc<Self>,
        notify_shutdown: &ShutdownNotify,
    ) -> crate::Result<()> {
        let send_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        send_socket.set_multicast_ttl_v4(MULTICAST_TTL)?;

        let recv_socket = UdpSocket::from_std(multicast_receiver()?)?;

        info!(
            group = %MULTICAST_GROUP,
            port = MULTICAST_PORT,
            "discovery service started"
        );

        let announcer = self.clone();
        let shutdown = notify_shutdown.subscribe();
        tokio::spawn(async move {
            announcer.announce_loop(send_socket, shutdown).await;
        });

        let listener = self.clone();
        let shutdown = notify_shutdown.subscribe();
        tokio::spawn(async move {
            listener.listen_loop(recv_socket, shutdown).await;
        });

        Ok(())
    }

    async fn announce_loop(&self, socket: UdpSocket, mut shutdown: Shutdown) {
        let mut ticker = interval(DISCOVERY_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => break,
            }

            let record = Record::new(Body::DiscoveryAnnounce {
                server_id: self.server_id.clone(),
                ip: self.ip.clone(),
                port: self.port,
            });
            match codec::encode_datagram(&record) {
                Ok(data) => {
                    if let Err(err) = socket
                        .send_to(&data, (MULTICAST_GROUP, MULTICAST_PORT))
                        .await
                    {
                        warn!(cause = %err, "failed to send discovery announcement");
                    }
                }
                Err(err) => error!(cause = %err, "failed to encode announcement"),
            }
        }
        debug!("discovery announce loop stopped");
    }

    async fn listen_loop(&self, socket: UdpSocket, mut shutdown: Shutdown) {
        let mut buf = vec![0u8; MAX_FRAME];
        loop {
            tokio::select! {
                res = socket.recv_from(&mut buf) => match res {
                    Ok((len, addr)) => self.handle_datagram(&buf[..len], addr),
                    Err(err) => warn!(cause = %err, "discovery receive error"),
                },
                _ = shutdown.recv() => break,
            }
        }
        debug!("discovery listen loop stopped");
    }

    fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let record = match codec::decode_datagram(data) {
            Ok(record) => record,
            Err(err) => {
                debug!(cause = %err, %from, "dropping malformed datagram");
                return;
            }
        };

        match record.body {
            Body::DiscoveryAnnounce {
                server_id,
                ip,
                port,
            } => {
                if server_id == self.server_id {
                    return;
                }
                let is_new = !self.discovered.contains_key(&server_id);
                self.discovered.insert(
                    server_id.clone(),
                    Discovered {
                        server_id: server_id.clone(),
                        ip: ip.clone(),
                        port,
                        last_seen: Instant::now(),
                    },
                );
                if is_new {
                    info!(server = %server_id, address = %format!("{}:{}", ip, port), "discovered new server");
                    let _ = self.events.send((server_id, ip, port));
                }
            }
            other => debug!(kind = other.kind(), %from, "ignoring datagram"),
        }
    }

    pub fn lookup(&self, server_id: &str) -> Option<Discovered> {
        self.discovered
            .get(server_id)
            .map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self) -> Vec<Discovered> {
        self.discovered
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// The receive socket needs SO_REUSEADDR before bind so several nodes on
/// one host can share the multicast port.
fn multicast_receiver() -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, MULTICAST_PORT).into();
    socket.bind(&addr.into())?;
    socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
