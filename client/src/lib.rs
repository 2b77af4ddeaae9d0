//! # Synchronization Client
//!
//! A headless peer for the position synchronization server. It connects,
//! learns its identifier from the first frame the server sends (the client's
//! own state, alone), then reports movement and reads snapshots.
//!
//! ```rust,no_run
//! use client::SyncClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), client::ClientError> {
//!     let mut client = SyncClient::connect("127.0.0.1:8080").await?;
//!     client.move_to(10.0, 5.0).await?;
//!     let snapshot = client.next_snapshot().await?;
//!     println!("{} clients live", snapshot.len());
//!     Ok(())
//! }
//! ```

use log::{debug, info};
use shared::{encode_frame, read_frame, ClientId, ClientState, CodecError, Frame, MAX_PAYLOAD_LEN};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// How long to wait for any single frame from the server.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("no frame from server within {0:?}")]
    Timeout(Duration),

    #[error("server closed the connection")]
    Disconnected,

    #[error("expected own state as first frame, got {0} records")]
    Handshake(usize),
}

pub struct SyncClient {
    stream: TcpStream,
    state: ClientState,
    read_timeout: Duration,
}

impl SyncClient {
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        Self::connect_with_timeout(addr, DEFAULT_READ_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        addr: &str,
        read_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let mut client = SyncClient {
            stream,
            state: ClientState::new(0, 0.0, 0.0),
            read_timeout,
        };

        match client.next_frame().await? {
            Frame::Update(own) => client.state = own,
            other => return Err(ClientError::Handshake(other.len())),
        }

        info!(
            "Connected as client {} at ({:.2}, {:.2})",
            client.state.id, client.state.x, client.state.y
        );
        Ok(client)
    }

    pub fn id(&self) -> ClientId {
        self.state.id
    }

    /// Last position this client reported, or the server-chosen spawn point.
    pub fn position(&self) -> (f64, f64) {
        (self.state.x, self.state.y)
    }

    /// Reports a new position. The delta sent is the distance moved.
    pub async fn move_to(&mut self, x: f64, y: f64) -> Result<(), ClientError> {
        let delta = (x - self.state.x).hypot(y - self.state.y);
        self.send_state(ClientState {
            id: self.state.id,
            x,
            y,
            delta,
        })
        .await
    }

    /// Sends `state` as-is, whatever identifier it carries.
    pub async fn send_state(&mut self, state: ClientState) -> Result<(), ClientError> {
        let bytes = encode_frame(&[state])?;
        self.stream.write_all(&bytes).await?;

        if state.id == self.state.id {
            self.state.x = state.x;
            self.state.y = state.y;
        }
        debug!("Sent update ({:.2}, {:.2})", state.x, state.y);
        Ok(())
    }

    /// Next frame from the server, as a list of records.
    pub async fn next_snapshot(&mut self) -> Result<Vec<ClientState>, ClientError> {
        Ok(self.next_frame().await?.into_records())
    }

    /// Reads snapshots until one satisfies `accept`, and returns it.
    pub async fn wait_for<F>(&mut self, accept: F) -> Result<Vec<ClientState>, ClientError>
    where
        F: Fn(&[ClientState]) -> bool,
    {
        loop {
            let snapshot = self.next_snapshot().await?;
            if accept(&snapshot) {
                return Ok(snapshot);
            }
        }
    }

    async fn next_frame(&mut self) -> Result<Frame, ClientError> {
        timeout(self.read_timeout, read_frame(&mut self.stream, MAX_PAYLOAD_LEN))
            .await
            .map_err(|_| ClientError::Timeout(self.read_timeout))??
            .ok_or(ClientError::Disconnected)
    }
}
