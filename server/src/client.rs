//! Client actor: one accepted connection end-to-end
//!
//! Each actor runs two loops over its connection:
//! - the read loop decodes inbound frames, merges updates into the client's
//!   [`StateCell`] and asks the registry to re-broadcast
//! - the write loop drains the mailbox of snapshot batches onto the socket
//!
//! The loops only talk to each other through one-shot exit signals. Whichever
//! loop hits a fatal condition first deregisters the client and stops its
//! sibling. The other loop then leaves quietly.

use crate::config::{ConfigError, ServerConfig};
use crate::registry::{RegistryClosed, RegistryHandle};
use crate::state::{IdGenerator, StateCell};
use log::{debug, error, info, warn};
use rand::Rng;
use shared::{
    decode_payload, encode_frame, read_length_prefix, read_payload, ClientId, ClientState,
    CodecError, Frame,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// One broadcast: every live client's state at one instant.
///
/// The same batch is offered to every mailbox, hence the `Arc`.
pub type Snapshot = Arc<Vec<ClientState>>;

#[derive(Debug, Error)]
pub enum ActorError {
    #[error("{0} deadline expired")]
    Timeout(&'static str),

    #[error("peer closed the connection")]
    Disconnected,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client identifier space exhausted")]
    IdentifiersExhausted,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    RegistryClosed(#[from] RegistryClosed),
}

impl ActorError {
    /// Whether the connection has to be torn down.
    pub fn is_fatal(&self) -> bool {
        match self {
            ActorError::Codec(e) => e.is_fatal(),
            _ => true,
        }
    }
}

/// Why a snapshot could not be put into a mailbox.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("mailbox full")]
    MailboxFull,
    #[error("mailbox closed")]
    MailboxClosed,
}

/// Single-fire exit flag for one loop.
#[derive(Debug)]
struct ExitSignal {
    tx: watch::Sender<bool>,
}

impl ExitSignal {
    fn new() -> (Self, ExitListener) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, ExitListener { rx })
    }

    /// Raises the flag. Returns true only for the call that raised it.
    fn raise(&self) -> bool {
        self.tx.send_if_modified(|raised| {
            if *raised {
                false
            } else {
                *raised = true;
                true
            }
        })
    }

    fn is_raised(&self) -> bool {
        *self.tx.borrow()
    }
}

#[derive(Debug)]
struct ExitListener {
    rx: watch::Receiver<bool>,
}

impl ExitListener {
    /// Resolves once the flag is raised or its sender is gone.
    async fn raised(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Read,
    Write,
}

#[derive(Debug)]
struct Lifecycle {
    closing: AtomicBool,
    exit_read: ExitSignal,
    exit_write: ExitSignal,
}

/// What the registry holds for a live client.
///
/// Cloning is cheap. The registry owns membership of the handle; the actor
/// that created it owns the loops and the connection.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    state: Arc<StateCell>,
    mailbox: mpsc::Sender<Snapshot>,
    lifecycle: Arc<Lifecycle>,
}

struct Parts {
    handle: ClientHandle,
    mailbox: mpsc::Receiver<Snapshot>,
    read_exit: ExitListener,
    write_exit: ExitListener,
}

impl ClientHandle {
    fn build(initial: ClientState, mailbox_capacity: usize) -> Parts {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(mailbox_capacity);
        let (exit_read, read_exit) = ExitSignal::new();
        let (exit_write, write_exit) = ExitSignal::new();

        let handle = ClientHandle {
            id: initial.id,
            state: Arc::new(StateCell::new(initial)),
            mailbox: mailbox_tx,
            lifecycle: Arc::new(Lifecycle {
                closing: AtomicBool::new(false),
                exit_read,
                exit_write,
            }),
        };

        Parts {
            handle,
            mailbox: mailbox_rx,
            read_exit,
            write_exit,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Copy of the client's state without resetting its delta.
    pub async fn current_state(&self) -> ClientState {
        self.state.current().await
    }

    /// Copy of the client's state for a broadcast; resets its delta.
    pub async fn snapshot_state(&self) -> ClientState {
        self.state.take_snapshot().await
    }

    /// Offers a batch to the mailbox without waiting.
    pub fn offer(&self, snapshot: Snapshot) -> Result<(), DeliveryError> {
        self.mailbox.try_send(snapshot).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::MailboxClosed,
        })
    }

    /// Stops both loops without notifying the registry.
    ///
    /// Used by the registry itself when it has already dropped the client.
    pub fn disconnect(&self) {
        self.lifecycle.closing.store(true, Ordering::SeqCst);
        self.lifecycle.exit_read.raise();
        self.lifecycle.exit_write.raise();
    }

    pub fn is_closing(&self) -> bool {
        self.lifecycle.closing.load(Ordering::SeqCst)
    }

    /// Both loops have been told to exit.
    pub fn is_stopped(&self) -> bool {
        self.lifecycle.exit_read.is_raised() && self.lifecycle.exit_write.is_raised()
    }

    #[cfg(test)]
    pub(crate) fn state_for_test(&self) -> &StateCell {
        &self.state
    }

    /// Called by a loop that hit a fatal condition.
    ///
    /// Only the first caller across both loops deregisters the client and
    /// signals the sibling loop.
    fn fail(&self, registry: &RegistryHandle, side: Side) {
        if self.lifecycle.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = registry.leave(self.id) {
            error!("Failed to deregister client {}: {}", self.id, e);
        }

        match side {
            Side::Read => self.lifecycle.exit_write.raise(),
            Side::Write => self.lifecycle.exit_read.raise(),
        };
    }
}

/// Owns one connection, its state cell and its outbound mailbox.
pub struct ClientActor<S> {
    stream: S,
    handle: ClientHandle,
    mailbox: mpsc::Receiver<Snapshot>,
    read_exit: ExitListener,
    write_exit: ExitListener,
    registry: RegistryHandle,
    config: Arc<ServerConfig>,
}

impl<S> ClientActor<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Builds an actor for an accepted connection.
    ///
    /// Takes a fresh identifier from `ids` and a random starting position.
    /// Fails without consuming an identifier if `config` is invalid.
    pub fn new(
        stream: S,
        registry: RegistryHandle,
        ids: &IdGenerator,
        config: Arc<ServerConfig>,
    ) -> Result<Self, ActorError> {
        config.validate()?;
        let id = ids.next_id().ok_or(ActorError::IdentifiersExhausted)?;

        let (x, y) = spawn_position(config.spawn_extent);
        let parts = ClientHandle::build(ClientState::new(id, x, y), config.mailbox_capacity);

        Ok(Self {
            stream,
            handle: parts.handle,
            mailbox: parts.mailbox,
            read_exit: parts.read_exit,
            write_exit: parts.write_exit,
            registry,
            config,
        })
    }

    pub fn id(&self) -> ClientId {
        self.handle.id
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Joins the registry and runs both loops until the connection ends.
    ///
    /// The read loop runs on the calling task and the write loop on a spawned
    /// one. Returns once both have exited.
    pub async fn run(self) -> Result<(), ActorError> {
        let ClientActor {
            stream,
            handle,
            mailbox,
            read_exit,
            write_exit,
            registry,
            config,
        } = self;
        let id = handle.id;

        registry.join(handle.clone())?;
        info!("Client {} joined", id);

        let (reader, writer) = tokio::io::split(stream);

        let write_task = tokio::spawn(write_loop(
            writer,
            mailbox,
            write_exit,
            handle.clone(),
            registry.clone(),
            config.write_timeout,
        ));

        read_loop(reader, read_exit, handle, registry, config).await;

        if let Err(e) = write_task.await {
            error!("Write loop for client {} panicked: {}", id, e);
        }

        info!("Client {} finished", id);
        Ok(())
    }
}

fn spawn_position(extent: f64) -> (f64, f64) {
    let mut rng = rand::thread_rng();
    (rng.gen_range(0.0..extent), rng.gen_range(0.0..extent))
}

async fn receive_frame<R>(reader: &mut R, config: &ServerConfig) -> Result<Frame, ActorError>
where
    R: AsyncRead + Unpin,
{
    let len = timeout(config.idle_read_timeout, read_length_prefix(reader))
        .await
        .map_err(|_| ActorError::Timeout("idle read"))??
        .ok_or(ActorError::Disconnected)?;

    let payload = timeout(
        config.burst_read_timeout,
        read_payload(reader, len, config.max_payload_len),
    )
    .await
    .map_err(|_| ActorError::Timeout("burst read"))??;

    Ok(decode_payload(&payload)?)
}

async fn read_loop<R>(
    mut reader: R,
    mut exit: ExitListener,
    client: ClientHandle,
    registry: RegistryHandle,
    config: Arc<ServerConfig>,
) where
    R: AsyncRead + Unpin,
{
    let id = client.id;

    loop {
        let received = tokio::select! {
            biased;
            _ = exit.raised() => {
                info!("Read loop for client {} stopped", id);
                return;
            }
            received = receive_frame(&mut reader, &config) => received,
        };

        match received {
            Ok(Frame::Update(update)) => {
                if update.id != id {
                    debug!("Client {} reported state under id {}", id, update.id);
                }

                let merged = client.state.merge(&update).await;
                debug!(
                    "Client {} at ({:.2}, {:.2}), delta {:.3}",
                    id, merged.x, merged.y, merged.delta
                );

                if let Err(e) = registry.broadcast_all() {
                    error!("Client {} cannot request broadcast: {}", id, e);
                    client.fail(&registry, Side::Read);
                    return;
                }
            }
            Ok(Frame::Snapshot(records)) => {
                warn!(
                    "Client {} sent a {}-record frame, expected one update",
                    id,
                    records.len()
                );
            }
            Err(e) if !e.is_fatal() => {
                warn!("Ignoring frame from client {}: {}", id, e);
            }
            Err(ActorError::Disconnected) => {
                info!("Client {} disconnected", id);
                client.fail(&registry, Side::Read);
                return;
            }
            Err(e) => {
                warn!("Read loop for client {} failed: {}", id, e);
                client.fail(&registry, Side::Read);
                return;
            }
        }
    }
}

async fn send_batch<W>(
    writer: &mut W,
    batch: &[ClientState],
    limit: Duration,
) -> Result<(), ActorError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(batch)?;

    timeout(limit, async {
        writer.write_all(&bytes).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| ActorError::Timeout("write"))??;

    Ok(())
}

async fn write_loop<W>(
    mut writer: W,
    mut mailbox: mpsc::Receiver<Snapshot>,
    mut exit: ExitListener,
    client: ClientHandle,
    registry: RegistryHandle,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let id = client.id;

    loop {
        let batch = tokio::select! {
            batch = mailbox.recv() => batch,
            _ = exit.raised() => {
                info!("Write loop for client {} stopped", id);
                return;
            }
        };

        let Some(batch) = batch else {
            info!("Mailbox for client {} closed", id);
            return;
        };

        let sent = tokio::select! {
            sent = send_batch(&mut writer, &batch, write_timeout) => sent,
            _ = exit.raised() => {
                info!("Write loop for client {} stopped mid-write", id);
                return;
            }
        };

        match sent {
            Ok(()) => debug!("Sent {} records to client {}", batch.len(), id),
            Err(e) => {
                warn!("Write loop for client {} failed: {}", id, e);
                client.fail(&registry, Side::Write);
                return;
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn detached_handle(
    id: ClientId,
    x: f64,
    y: f64,
    mailbox_capacity: usize,
) -> (ClientHandle, mpsc::Receiver<Snapshot>) {
    let parts = ClientHandle::build(ClientState::new(id, x, y), mailbox_capacity);
    (parts.handle, parts.mailbox)
}
