//! Remote console client for Source-engine game servers.
//!
//! A session authenticates once and then runs commands strictly one at a
//! time: each request waits for exactly one response before the next is
//! written. Every blocking step shares the same timeout, and the socket is
//! closed when the session is dropped.

use crate::packets::{
    PacketDecoder, RconPacket, AUTH_FAILED_ID, SERVERDATA_AUTH_RESPONSE,
    SERVERDATA_RESPONSE_VALUE,
};
use log::{debug, info};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum RconError {
    #[error("rcon authentication failed")]
    AuthFailed,
    #[error("rcon operation timed out")]
    Timeout,
    #[error("rcon connection closed by peer")]
    ConnectionClosed,
    #[error("malformed rcon packet: {0}")]
    Malformed(String),
    #[error("rcon io error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for RconError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => RconError::ConnectionClosed,
            io::ErrorKind::TimedOut => RconError::Timeout,
            _ => RconError::Io(err),
        }
    }
}

pub struct RconSession<S> {
    stream: S,
    decoder: PacketDecoder,
    timeout: Duration,
    last_id: i32,
}

impl RconSession<TcpStream> {
    /// Opens a TCP connection, bounded by `wait`.
    pub async fn connect(host: &str, port: u16, wait: Duration) -> Result<Self, RconError> {
        let stream = timeout(wait, TcpStream::connect((host, port)))
            .await
            .map_err(|_| RconError::Timeout)??;
        debug!("Connected to rcon at {}:{}", host, port);
        Ok(Self::new(stream, wait))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> RconSession<S> {
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream,
            decoder: PacketDecoder::new(),
            timeout,
            last_id: 0,
        }
    }

    /// Sends the password and reads one reply; any id but -1 is accepted.
    ///
    /// Source servers follow an empty value packet with the real auth
    /// response. That second packet is consumed here only when it is already
    /// buffered, otherwise [`exec`](Self::exec) skips it.
    pub async fn authenticate(&mut self, password: &str) -> Result<(), RconError> {
        let id = self.next_id();
        self.send(&RconPacket::auth(id, password)).await?;

        let reply = self.receive().await?;
        if reply.id == AUTH_FAILED_ID {
            return Err(RconError::AuthFailed);
        }
        if reply.kind == SERVERDATA_RESPONSE_VALUE {
            if let Some(trailing) = self.decoder.next_packet()? {
                check_trailing_auth(&trailing)?;
            }
        }
        Ok(())
    }

    /// Runs one console command and returns the server's response body.
    pub async fn exec(&mut self, command: &str) -> Result<String, RconError> {
        let id = self.next_id();
        self.send(&RconPacket::exec(id, command)).await?;

        let mut reply = self.receive().await?;
        while reply.kind == SERVERDATA_AUTH_RESPONSE {
            check_trailing_auth(&reply)?;
            reply = self.receive().await?;
        }
        if reply.id != id {
            debug!("Response id {} does not match request id {}", reply.id, id);
        }
        Ok(reply.body)
    }

    fn next_id(&mut self) -> i32 {
        self.last_id = self.last_id.wrapping_add(1).max(1);
        self.last_id
    }

    async fn send(&mut self, packet: &RconPacket) -> Result<(), RconError> {
        let bytes = packet.encode();
        timeout(self.timeout, self.stream.write_all(&bytes))
            .await
            .map_err(|_| RconError::Timeout)??;
        Ok(())
    }

    async fn receive(&mut self) -> Result<RconPacket, RconError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(packet) = self.decoder.next_packet()? {
                return Ok(packet);
            }

            let read = timeout(self.timeout, self.stream.read(&mut chunk))
                .await
                .map_err(|_| RconError::Timeout)??;
            if read == 0 {
                return Err(RconError::ConnectionClosed);
            }
            self.decoder.extend(&chunk[..read]);
        }
    }
}

/// Late auth responses still carry the verdict.
fn check_trailing_auth(packet: &RconPacket) -> Result<(), RconError> {
    if packet.id == AUTH_FAILED_ID {
        return Err(RconError::AuthFailed);
    }
    debug!("Skipping auth response for request {}", packet.id);
    Ok(())
}

/// Authenticates against `host:port` and runs `commands` in order.
///
/// Returns the response body of each command. The connection is closed on
/// every exit path.
pub async fn execute(
    host: &str,
    port: u16,
    password: &str,
    commands: &[String],
    wait: Duration,
) -> Result<Vec<String>, RconError> {
    let mut session = RconSession::connect(host, port, wait).await?;
    session.authenticate(password).await?;

    let mut responses = Vec::with_capacity(commands.len());
    for command in commands {
        responses.push(session.exec(command).await?);
    }

    info!(
        "Executed {} rcon command(s) on {}:{}",
        commands.len(),
        host,
        port
    );
    Ok(responses)
}
