use bincode::{deserialize, serialize};
use log::{debug, info, warn};
use shared::{Packet, UserId, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// UDP client for the scrim coordinator.
pub struct CoordinatorClient {
    socket: UdpSocket,
    server_addr: SocketAddr,
    user_id: UserId,
    client_id: Option<u32>,
    reply_timeout: Duration,
}

impl CoordinatorClient {
    pub async fn new(
        server_addr: &str,
        user_id: UserId,
        reply_timeout: Duration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        Ok(CoordinatorClient {
            socket,
            server_addr,
            user_id,
            client_id: None,
            reply_timeout,
        })
    }

    pub fn client_id(&self) -> Option<u32> {
        self.client_id
    }

    /// Announces the user and waits for the session id.
    pub async fn connect(&mut self) -> Result<u32, Box<dyn std::error::Error>> {
        info!("Connecting to coordinator at {}...", self.server_addr);

        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            user_id: self.user_id,
        };
        match self.request(&packet).await? {
            Packet::Connected { client_id } => {
                info!("Connected! Client ID: {}", client_id);
                self.client_id = Some(client_id);
                Ok(client_id)
            }
            Packet::Disconnected { reason } | Packet::Rejected { reason } => {
                Err(format!("connection refused: {}", reason).into())
            }
            other => Err(format!("unexpected reply: {:?}", other).into()),
        }
    }

    pub async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    /// Waits for the next datagram from the coordinator.
    pub async fn recv_packet(&self, wait: Duration) -> Result<Packet, Box<dyn std::error::Error>> {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, addr) = timeout(wait, self.socket.recv_from(&mut buffer))
                .await
                .map_err(|_| "timed out waiting for coordinator")??;
            if addr != self.server_addr {
                warn!("Ignoring datagram from unexpected sender {}", addr);
                continue;
            }
            return Ok(deserialize::<Packet>(&buffer[..len])?);
        }
    }

    /// Sends `packet` and returns the first reply that is not a heartbeat.
    pub async fn request(&self, packet: &Packet) -> Result<Packet, Box<dyn std::error::Error>> {
        self.send_packet(packet).await?;

        let deadline = Instant::now() + self.reply_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv_packet(remaining).await? {
                Packet::Heartbeat { .. } => continue,
                reply => return Ok(reply),
            }
        }
    }

    /// Streams lobby updates to `on_update` until the coordinator disconnects us.
    pub async fn watch<F>(&self, mut on_update: F) -> Result<(), Box<dyn std::error::Error>>
    where
        F: FnMut(&Packet),
    {
        let mut last_keepalive = Instant::now();
        loop {
            if last_keepalive.elapsed() >= KEEPALIVE_INTERVAL {
                self.send_packet(&Packet::Ping).await?;
                last_keepalive = Instant::now();
            }

            match self.recv_packet(KEEPALIVE_INTERVAL).await {
                Ok(Packet::Heartbeat { timestamp }) => debug!("Heartbeat at {}", timestamp),
                Ok(Packet::Disconnected { reason }) => {
                    warn!("Disconnected: {}", reason);
                    return Ok(());
                }
                Ok(packet) => on_update(&packet),
                Err(e) => debug!("No update received: {}", e),
            }
        }
    }

    pub async fn disconnect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.send_packet(&Packet::Disconnect).await?;
        self.client_id = None;
        Ok(())
    }
}
