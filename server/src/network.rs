//! UDP front end of the coordinator.
//!
//! Same shape as a game server loop: a receiver task decodes datagrams, a
//! sender task drains the outgoing queue, a timeout task drops silent
//! clients, and the main loop applies requests one at a time. Lobby changes
//! are pushed to subscribers whenever a lobby's `updated_at` moves, so
//! writes made by the watchdog reach clients the same way as their own.

use crate::client_manager::ClientManager;
use crate::config::Config;
use crate::coordinator::{Submission, VetoCoordinator};
use crate::error::CoordinatorError;
use crate::lobby::LobbyService;
use crate::watchdog::Notice;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::{now_millis, LobbyId, Packet, UserId, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};

/// Messages sent from network tasks to the main loop
#[derive(Debug)]
pub enum ServerMessage {
    /// A decoded datagram and the address it came from
    PacketReceived { packet: Packet, addr: SocketAddr },
    /// The timeout task dropped a silent client
    ClientTimeout { client_id: u32 },
    /// Stops the main loop
    Shutdown,
}

/// Messages sent from the main loop to the sender task
#[derive(Debug)]
pub enum OutboundMessage {
    /// To a single address.
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    /// To every subscriber of `lobby`, or every client when `None`.
    BroadcastPacket {
        packet: Packet,
        lobby: Option<LobbyId>,
    },
}

/// The coordinator's UDP service
///
/// Owns the socket and the client table. Requests are applied one at a time
/// on the main loop; socket I/O and timeout checks run on their own tasks and
/// talk to the loop over channels.
pub struct Server {
    socket: Arc<UdpSocket>,
    /// Shared with the sender and timeout tasks
    clients: Arc<RwLock<ClientManager>>,
    coordinator: Arc<VetoCoordinator>,
    lobbies: LobbyService,
    /// How often watched lobbies are checked for changes
    poll_interval: Duration,
    /// Used for balance requests
    rng: StdRng,
    /// Last `updated_at` pushed per lobby
    published: HashMap<LobbyId, u64>,
    /// Forced bans and heartbeats from the watchdog
    notices: mpsc::UnboundedReceiver<Notice>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl Server {
    /// Binds the socket from `config`
    ///
    /// Nothing is received until [`run`](Self::run) spawns the network tasks.
    pub async fn new(
        config: &Config,
        coordinator: Arc<VetoCoordinator>,
        lobbies: LobbyService,
        notices: mpsc::UnboundedReceiver<Notice>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        info!("Coordinator listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(
                config.max_clients,
                config.subscriber_timeout,
            ))),
            coordinator,
            lobbies,
            poll_interval: config.watchdog_interval,
            rng: StdRng::from_entropy(),
            published: HashMap::new(),
            notices,
            server_tx,
            server_rx,
            outbound_tx,
            outbound_rx,
        })
    }

    /// Address the socket is actually bound to, useful with port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handle for stopping the main loop from outside.
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns the task that decodes incoming datagrams
    ///
    /// Undecodable datagrams are logged and dropped.
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_DATAGRAM_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns the task that drains the outbound queue
    ///
    /// Broadcast targets are resolved against the client table at send time,
    /// so clients that left meanwhile are skipped.
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut outbound_rx =
            std::mem::replace(&mut self.outbound_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                match message {
                    OutboundMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    OutboundMessage::BroadcastPacket { packet, lobby } => {
                        let targets = {
                            let clients_guard = clients.read().await;
                            match lobby {
                                Some(lobby) => clients_guard.subscribers(lobby),
                                None => clients_guard.get_client_addrs(),
                            }
                        };

                        for (client_id, addr) in targets {
                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to client {}: {}", client_id, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns the task that drops clients silent past the subscriber timeout
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));

            loop {
                ticker.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts()
                };

                for client_id in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { client_id }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    /// Serializes and sends one packet
    ///
    /// Packets larger than a datagram are refused rather than truncated on
    /// the receiving side.
    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        if data.len() > MAX_DATAGRAM_SIZE {
            warn!(
                "Dropping {} byte packet for {}: over the {} byte datagram limit",
                data.len(),
                addr,
                MAX_DATAGRAM_SIZE
            );
            return Err(format!("packet of {} bytes exceeds datagram limit", data.len()).into());
        }
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    /// Queues a reply for a single address
    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self
            .outbound_tx
            .send(OutboundMessage::SendPacket { packet, addr })
        {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    /// Queues a packet for a lobby's subscribers, or for everyone
    fn broadcast_packet(&self, packet: Packet, lobby: Option<LobbyId>) {
        if let Err(e) = self
            .outbound_tx
            .send(OutboundMessage::BroadcastPacket { packet, lobby })
        {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    /// Routes a datagram: connection management is handled here, everything
    /// else must come from a connected client.
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect {
                client_version,
                user_id,
            } => self.handle_connect(client_version, user_id, addr).await,

            Packet::Disconnect => {
                let mut clients = self.clients.write().await;
                if let Some(client_id) = clients.find_client_by_addr(addr) {
                    clients.remove_client(&client_id);
                }
            }

            Packet::Connected { .. }
            | Packet::LobbyCreated { .. }
            | Packet::LobbyUpdated { .. }
            | Packet::Heartbeat { .. }
            | Packet::Rejected { .. }
            | Packet::Disconnected { .. } => {
                warn!("Unexpected packet type from client at {}", addr);
            }

            request => {
                let session = {
                    let mut clients = self.clients.write().await;
                    clients
                        .find_client_by_addr(addr)
                        .and_then(|id| clients.touch(id).map(|user| (id, user)))
                };
                let Some((client_id, user)) = session else {
                    self.send_packet(
                        Packet::Rejected {
                            reason: "not connected".to_string(),
                        },
                        addr,
                    );
                    return;
                };

                let reply = match self.handle_request(client_id, user, request).await {
                    Ok(Some(reply)) => reply,
                    Ok(None) => return,
                    Err(e) => {
                        debug!("Rejected request from user {}: {}", user, e);
                        Packet::Rejected {
                            reason: e.to_string(),
                        }
                    }
                };
                self.send_packet(reply, addr);
            }
        }
    }

    /// Registers a client after the version check
    ///
    /// Replies `Disconnected` on a version mismatch or when the coordinator
    /// is full.
    async fn handle_connect(&mut self, client_version: u32, user_id: UserId, addr: SocketAddr) {
        info!(
            "Client connecting from {} (version: {})",
            addr, client_version
        );

        if client_version != PROTOCOL_VERSION {
            self.send_packet(
                Packet::Disconnected {
                    reason: "Protocol version mismatch".to_string(),
                },
                addr,
            );
            return;
        }

        let client_id = {
            let mut clients = self.clients.write().await;
            if let Some(existing_id) = clients.find_client_by_addr(addr) {
                info!("Removing existing client {} from {}", existing_id, addr);
                clients.remove_client(&existing_id);
            }
            clients.add_client(addr, user_id)
        };

        let response = match client_id {
            Some(client_id) => Packet::Connected { client_id },
            None => Packet::Disconnected {
                reason: "Server full".to_string(),
            },
        };
        self.send_packet(response, addr);
    }

    /// Applies one request from a connected client and builds the reply.
    async fn handle_request(
        &mut self,
        client_id: u32,
        user: UserId,
        request: Packet,
    ) -> Result<Option<Packet>, CoordinatorError> {
        let now = now_millis();
        let lobby = match request {
            Packet::Ping => return Ok(None),
            Packet::CreateLobby {
                map_pool,
                veto_mode,
                server,
                connect_password,
            } => {
                let lobby = self.lobbies.create(
                    user,
                    &map_pool,
                    veto_mode,
                    server,
                    connect_password,
                    now,
                )?;
                self.clients.write().await.subscribe(client_id, lobby);
                return Ok(Some(Packet::LobbyCreated { lobby }));
            }
            Packet::JoinLobby { lobby, name, skill } => {
                self.lobbies.join(lobby, user, &name, skill, now)?;
                self.clients.write().await.subscribe(client_id, lobby);
                lobby
            }
            Packet::LeaveLobby { lobby } => {
                self.lobbies.leave(lobby, user, now)?;
                self.clients.write().await.unsubscribe(client_id, lobby);
                lobby
            }
            Packet::MovePlayer {
                lobby,
                user_id,
                assignment,
            } => {
                self.lobbies
                    .move_player(lobby, user, user_id, assignment, now)?;
                lobby
            }
            Packet::Balance { lobby, mode } => {
                self.lobbies.balance(lobby, user, mode, &mut self.rng, now)?;
                lobby
            }
            Packet::Subscribe { lobby } => {
                let snapshot = self.lobbies.snapshot(lobby)?;
                self.clients.write().await.subscribe(client_id, lobby);
                return Ok(Some(snapshot));
            }
            Packet::StartMatch { lobby } => {
                log_submission(lobby, self.coordinator.start_match(lobby, user, now)?);
                lobby
            }
            Packet::Ban { lobby, map } => {
                log_submission(lobby, self.coordinator.submit_ban(lobby, user, &map, now)?);
                lobby
            }
            Packet::Vote { lobby, maps } => {
                log_submission(lobby, self.coordinator.submit_vote(lobby, user, &maps, now)?);
                lobby
            }
            other => {
                warn!("Unhandled request {:?}", other);
                return Ok(None);
            }
        };

        self.lobbies.snapshot(lobby).map(Some)
    }

    /// Pushes a fresh snapshot for every watched lobby whose `updated_at`
    /// moved since the last push.
    async fn publish_changes(&mut self) {
        let watched = self.clients.read().await.watched_lobbies();
        self.published.retain(|lobby, _| watched.contains(lobby));

        for lobby in watched {
            let updated_at = match self.lobbies.updated_at(lobby) {
                Ok(updated_at) => updated_at,
                Err(e) => {
                    warn!("Cannot poll lobby {}: {}", lobby, e);
                    continue;
                }
            };
            if self.published.get(&lobby) == Some(&updated_at) {
                continue;
            }
            self.publish(lobby);
        }
    }

    /// Broadcasts the current snapshot and remembers its `updated_at`.
    fn publish(&mut self, lobby: LobbyId) {
        match self.lobbies.snapshot(lobby) {
            Ok(snapshot) => {
                if let Packet::LobbyUpdated { updated_at, .. } = &snapshot {
                    self.published.insert(lobby, *updated_at);
                }
                self.broadcast_packet(snapshot, Some(lobby));
            }
            Err(e) => warn!("Cannot publish lobby {}: {}", lobby, e),
        }
    }

    /// Forwards a watchdog notice to clients
    fn handle_notice(&mut self, notice: Notice) {
        match notice {
            Notice::Changed(lobby) => self.publish(lobby),
            Notice::Heartbeat { timestamp } => {
                self.broadcast_packet(Packet::Heartbeat { timestamp }, None)
            }
        }
    }

    /// Main loop; returns once a shutdown message arrives.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Coordinator started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { client_id }) => {
                            debug!("Client {} timed out", client_id);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Coordinator shutting down");
                            break;
                        }
                    }
                },

                Some(notice) = self.notices.recv() => {
                    self.handle_notice(notice);
                },

                _ = poll.tick() => {
                    self.publish_changes().await;
                },
            }
        }

        Ok(())
    }
}

fn log_submission(lobby: LobbyId, submission: Submission) {
    if let Submission::Superseded = submission {
        debug!(
            "Lobby {}: request lost a race, replying with current state",
            lobby
        );
    }
}
