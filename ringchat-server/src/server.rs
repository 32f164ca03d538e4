use crate::config::{
    CLIENT_JOIN_DEADLINE, DISCOVERY_WINDOW, ELECTION_RESTART_DELAY, ELECTION_STARTUP_DELAY,
    RING_READY_POLL, RING_READY_TIMEOUT, STATUS_INTERVAL,
};
use crate::detector::Detector;
use crate::discovery::{self, Discovery};
use crate::election::Election;
use crate::peers::PeerLink;
use crate::replicate::Replicator;
use crate::ring::Ring;
use crate::session::{ClientSession, Clients};
use bytes::Bytes;
use ringchat_codec::{Body, NotificationKind, Record};
use ringchat_core::{Connection, Shutdown, ShutdownNotify};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

#[derive(Clone, Copy, Debug, PartialEq)]
enum Status {
    Starting,
    Discovering,
    Active,
    Leader,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Starting => "starting".fmt(f),
            Status::Discovering => "discovering".fmt(f),
            Status::Active => "active".fmt(f),
            Status::Leader => "leader".fmt(f),
        }
    }
}

/// Shared handles to every component of one server node.
#[derive(Debug)]
pub struct Node {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub ring: Arc<Ring>,
    pub peers: Arc<PeerLink>,
    pub clients: Arc<Clients>,
    pub replicator: Arc<Replicator>,
    pub election: Arc<Election>,
    pub detector: Arc<Detector>,
    pub discovery: Arc<Discovery>,
    status: Mutex<Status>,
}

impl Node {
    fn set_status(&self, status: Status) {
        *self
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn status(&self) -> Status {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_client_joined(&self, client_id: &str, username: &str) {
        info!(username, "client joined");
        self.clients.broadcast(&Record::new(Body::Notification {
            notification_type: NotificationKind::UserJoined,
            username: Some(username.to_string()),
            leader_id: None,
            message: Some(format!("{} joined the chat", username)),
        }));

        let history = self.replicator.history_tail();
        if !history.is_empty() {
            self.clients.send_to(
                client_id,
                &Record::new(Body::MessageHistory { messages: history }),
            );
        }
    }

    fn on_client_left(&self, username: &str) {
        info!(username, "client left");
        self.clients.broadcast(&Record::new(Body::Notification {
            notification_type: NotificationKind::UserLeft,
            username: Some(username.to_string()),
            leader_id: None,
            message: Some(format!("{} left the chat", username)),
        }));
    }

    fn log_status(&self) {
        let leader = self.ring.leader().map(|l| l.server_id);
        info!(
            server = %self.id,
            status = %self.status(),
            ring_size = self.ring.size(),
            clients = self.clients.count(),
            leader = ?leader,
            "status"
        );
    }
}

/// Runs one server node until `shutdown` resolves.
///
/// Binds the TCP listener and the multicast sockets (both fatal on
/// failure), then drives the startup sequence, the accept loop, and the
/// supervision loop.
pub async fn run(
    id: String,
    port: u16,
    shutdown: impl std::future::Future,
) -> crate::Result<()> {
    let ip = discovery::local_ip();
    info!(server = %id, address = %format!("{}:{}", ip, port), "starting server");

    let listener = TcpListener::bind((ip.as_str(), port)).await?;
    info!(address = %format!("{}:{}", ip, port), "tcp listener bound");

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let notify_shutdown = ShutdownNotify::new();
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::unbounded_channel();

    let ring = Arc::new(Ring::new(id.clone()));
    let peers = Arc::new(PeerLink::new());
    let clients = Arc::new(Clients::new());
    let election = Arc::new(Election::new(
        id.clone(),
        ring.clone(),
        peers.clone(),
        clients.clone(),
    ));
    let replicator = Arc::new(Replicator::new(
        id.clone(),
        ring.clone(),
        peers.clone(),
        clients.clone(),
    ));
    let detector = Arc::new(Detector::new(
        id.clone(),
        ring.clone(),
        peers.clone(),
        election.clone(),
        clients.clone(),
    ));
    let discovery = Arc::new(Discovery::new(id.clone(), ip.clone(), port, event_tx));

    let node = Arc::new(Node {
        id,
        ip,
        port,
        ring,
        peers,
        clients,
        replicator,
        election,
        detector,
        discovery,
        status: Mutex::new(Status::Starting),
    });

    // the node is always a member of its own ring
    node.ring.add(&node.id, &node.ip, node.port, false);

    // fatal if the multicast receiver cannot be set up
    node.discovery.clone().start(&notify_shutdown).await?;

    let consumer = node.clone();
    let consumer_shutdown = notify_shutdown.subscribe();
    tokio::spawn(async move {
        consume_discovery_events(consumer, event_rx, consumer_shutdown).await;
    });

    let mut listener = Listener {
        listener,
        node: node.clone(),
        notify_shutdown: notify_shutdown.clone(),
        shutdown_complete_tx: shutdown_complete_tx.clone(),
    };

    tokio::select! {
        res = listener.run() => {
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }
        _ = supervise(node.clone(), &notify_shutdown) => {}
        _ = shutdown => {
            info!("shutting down");
        }
    }

    node.peers.clear();
    notify_shutdown.notify();
    drop(shutdown_complete_tx);
    drop(listener);
    let _ = shutdown_complete_rx.recv().await;
    info!("server stopped");
    Ok(())
}

/// The startup sequence followed by the periodic status loop.
async fn supervise(node: Arc<Node>, notify_shutdown: &ShutdownNotify) {
    node.set_status(Status::Discovering);
    info!("discovering other servers...");
    sleep(DISCOVERY_WINDOW).await;

    // seed the ring with everything heard during the window
    let discovered = node.discovery.snapshot();
    info!(count = discovered.len(), "discovered other servers");
    for peer in &discovered {
        node.ring.add(&peer.server_id, &peer.ip, peer.port, false);
    }
    node.ring.log_topology();

    if !wait_for_ring_ready(&node).await {
        warn!("ring not ready in time, proceeding anyway");
    }

    match node.ring.leader() {
        Some(leader) => {
            // an announcement reached us during startup
            info!(leader = %leader.server_id, "leader already known, skipping initial election");
            if leader.server_id == node.id {
                node.set_status(Status::Leader);
            } else {
                node.set_status(Status::Active);
            }
        }
        None if node.ring.size() > 1 => {
            info!("starting initial election");
            sleep(ELECTION_STARTUP_DELAY).await;
            node.election.clone().start("initial election").await;
            node.set_status(Status::Active);
        }
        None => {
            info!("no other servers found, declaring self leader");
            node.ring.set_leader(&node.id);
            node.set_status(Status::Leader);
        }
    }

    let detector = node.detector.clone();
    let detector_shutdown = notify_shutdown.subscribe();
    tokio::spawn(async move {
        detector.run(detector_shutdown).await;
    });

    info!(server = %node.id, "server is running");

    let mut ticker = interval(STATUS_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if node.ring.is_leader(&node.id) {
            node.set_status(Status::Leader);
        } else if node.status() == Status::Leader {
            node.set_status(Status::Active);
        }
        node.log_status();
    }
}

/// State-based wait: the ring is ready once it is solo, or once every
/// discovered peer is a member and both neighbors are derived.
async fn wait_for_ring_ready(node: &Node) -> bool {
    let deadline = Instant::now() + RING_READY_TIMEOUT;
    let discovered = node.discovery.snapshot().len();
    info!(discovered, "waiting for ring to settle");

    while Instant::now() < deadline {
        let size = node.ring.size();
        if size == 1 {
            info!("ring ready (solo)");
            return true;
        }
        if size == discovered + 1
            && node.ring.right_neighbor().is_some()
            && node.ring.left_neighbor().is_some()
        {
            info!(size, "ring ready");
            return true;
        }
        debug!(size, expected = discovered + 1, "waiting for ring...");
        sleep(RING_READY_POLL).await;
    }
    false
}

/// Runtime membership changes coming out of discovery.
async fn consume_discovery_events(
    node: Arc<Node>,
    mut events: mpsc::UnboundedReceiver<(String, String, u16)>,
    mut shutdown: Shutdown,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.recv() => return,
        };
        let (server_id, ip, port) = match event {
            Some(event) => event,
            None => return,
        };

        if !node.ring.add(&server_id, &ip, port, false) {
            continue;
        }
        node.clients.broadcast(&Record::new(Body::Notification {
            notification_type: NotificationKind::ServerJoined,
            username: None,
            leader_id: None,
            message: Some(format!("Server {} joined the cluster", server_id)),
        }));

        // the leader re-runs the election so the newcomer can contend
        if node.ring.is_leader(&node.id) {
            info!(server = %server_id, "leader observed new member, scheduling re-election");
            let election = node.election.clone();
            tokio::spawn(async move {
                sleep(ELECTION_RESTART_DELAY).await;
                election.start("new server joined").await;
            });
        }
    }
}

#[derive(Debug)]
struct Listener {
    listener: TcpListener,
    node: Arc<Node>,
    notify_shutdown: ShutdownNotify,
    shutdown_complete_tx: mpsc::UnboundedSender<()>,
}

impl Listener {
    async fn run(&mut self) -> crate::Result<()> {
        info!("accepting connections");

        loop {
            let (socket, addr) = self.accept().await?;
            let handler = Handler {
                node: self.node.clone(),
                connection: Connection::new(socket),
                addr,
                shutdown: self.notify_shutdown.subscribe(),
                _shutdown_complete: self.shutdown_complete_tx.clone(),
            };

            tokio::spawn(async move {
                if let Err(err) = handler.run().await {
                    error!(cause = %err, address = %addr, "connection error");
                }
            });
        }
    }

    /// Transient accept failures are retried with a doubling pause; an
    /// error still firing once the pause outgrows the heartbeat timeout
    /// is fatal.
    async fn accept(&mut self) -> crate::Result<(TcpStream, SocketAddr)> {
        let mut retry = Duration::from_millis(500);
        loop {
            match self.listener.accept().await {
                Ok((socket, addr)) => return Ok((socket, addr)),
                Err(err) => {
                    if retry > crate::config::HEARTBEAT_TIMEOUT {
                        return Err(err.into());
                    }
                    warn!(
                        cause = %err,
                        server = %self.node.id,
                        retry_in = ?retry,
                        "accept failed, backing off"
                    );
                }
            }

            sleep(retry).await;
            retry *= 2;
        }
    }
}

/// Per-connection handler. The first framed record decides whether the
/// socket belongs to a chat client or to a peer server.
#[derive(Debug)]
struct Handler {
    node: Arc<Node>,
    connection: Connection,
    addr: SocketAddr,
    shutdown: Shutdown,
    _shutdown_complete: mpsc::UnboundedSender<()>,
}

impl Handler {
    #[instrument(skip(self))]
    async fn run(mut self) -> crate::Result<()> {
        let first = tokio::select! {
            res = timeout(CLIENT_JOIN_DEADLINE, self.connection.read_frame()) => match res {
                Ok(frame) => frame?,
                Err(_) => {
                    debug!(address = %self.addr, "handshake timed out");
                    return Ok(());
                }
            },
            _ = self.shutdown.recv() => return Ok(()),
        };

        let first = match first {
            Some(record) => record,
            None => return Ok(()),
        };

        let Record {
            message_id,
            timestamp,
            body,
        } = first;
        match body {
            Body::ClientJoin {
                client_id,
                username,
            } => self.run_client(client_id, username).await,
            body @ Body::Election { .. }
            | body @ Body::LeaderAnnouncement { .. }
            | body @ Body::Heartbeat { .. }
            | body @ Body::ForwardMessage { .. } => {
                debug!(address = %self.addr, "peer connection established");
                let record = Record {
                    message_id,
                    timestamp,
                    body,
                };
                self.dispatch(record).await;
                self.run_peer().await
            }
            other => {
                warn!(
                    kind = other.kind(),
                    address = %self.addr,
                    "unexpected first record, closing connection"
                );
                Ok(())
            }
        }
    }

    /// Reads peer records until the socket closes or the node shuts down.
    async fn run_peer(&mut self) -> crate::Result<()> {
        while !self.shutdown.is_shutdown() {
            let maybe_record = tokio::select! {
                res = self.connection.read_frame() => res?,
                _ = self.shutdown.recv() => return Ok(()),
            };
            let record = match maybe_record {
                Some(record) => record,
                None => return Ok(()),
            };
            self.dispatch(record).await;
        }
        Ok(())
    }

    async fn dispatch(&self, record: Record) {
        match record.body {
            Body::Election {
                candidate_id,
                originator_id,
                hop_count,
            } => {
                self.node
                    .election
                    .clone()
                    .handle_ballot(candidate_id, originator_id, hop_count, record.message_id)
                    .await;
            }
            Body::LeaderAnnouncement { leader_id, .. } => {
                self.node.election.handle_announcement(leader_id).await;
            }
            Body::Heartbeat { server_id, .. } => {
                self.node.detector.observe(&server_id);
                // a heartbeat from an id we dropped (or never met) re-adds
                // the peer, provided discovery knows its address
                if !self.node.ring.contains(&server_id) {
                    if let Some(peer) = self.node.discovery.lookup(&server_id) {
                        info!(server = %server_id, "heartbeat from unknown peer, adding to ring");
                        self.node.ring.add(&peer.server_id, &peer.ip, peer.port, false);
                    }
                }
            }
            Body::ForwardMessage {
                original_message,
                origin_server_id,
            } => {
                self.node
                    .replicator
                    .on_forward(*original_message, origin_server_id)
                    .await;
            }
            other => warn!(kind = other.kind(), "unexpected record on peer connection"),
        }
    }

    /// A registered chat session: greets the client, replays history, then
    /// pumps inbound chat while a writer task drains outbound frames.
    async fn run_client(
        mut self,
        client_id: String,
        username: String,
    ) -> crate::Result<()> {
        info!(address = %self.addr, username = %username, "client connection established");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        self.node.clients.register(ClientSession::new(
            client_id.clone(),
            username.clone(),
            self.addr,
            outbound_tx,
        ));

        let welcome = Record::new(Body::Welcome {
            message: format!("Welcome to the chat, {}!", username),
            server_id: self.node.id.clone(),
        });
        if let Err(err) = self.connection.write_frame(&welcome).await {
            self.node.clients.remove(&client_id);
            return Err(err.into());
        }

        self.node.on_client_joined(&client_id, &username);

        let (mut reader, mut writer) = self.connection.into_split();
        let writer_task = tokio::spawn(async move {
            while let Some(data) = outbound_rx.recv().await {
                if let Err(err) = writer.write_raw(&data).await {
                    debug!(cause = %err, "client write failed");
                    break;
                }
            }
        });

        let result = loop {
            let maybe_record = tokio::select! {
                res = reader.read_frame() => res,
                _ = self.shutdown.recv() => Ok(None),
            };
            match maybe_record {
                Ok(Some(record)) => match &record.body {
                    Body::ChatMessage { .. } => {
                        self.node.replicator.on_client_message(record).await;
                    }
                    Body::ClientLeave { .. } => break Ok(()),
                    other => {
                        debug!(kind = other.kind(), "ignoring record from client");
                    }
                },
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        self.node.clients.remove(&client_id);
        writer_task.abort();
        info!(username = %username, "client disconnected");
        self.node.on_client_left(&username);
        result
    }
}
