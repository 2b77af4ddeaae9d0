//! Registry: the single authority over which clients are live
//!
//! All membership changes and broadcasts are requests sent into one control
//! loop, which handles them one at a time in arrival order. Because the
//! membership map is only touched inside that loop, it needs no lock, and a
//! snapshot taken for a broadcast always matches the membership at that step.
//!
//! Fan-out never waits on a client. A mailbox that is full (or already gone)
//! gets its client evicted in the same step, and the remaining clients are
//! sent a fresh snapshot without it.

use crate::client::{ClientHandle, DeliveryError, Snapshot};
use log::{debug, info, warn};
use shared::ClientId;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Requests handled by the registry's control loop.
#[derive(Debug)]
pub enum RegistryCommand {
    Join(ClientHandle),
    Leave(ClientId),
    BroadcastAll,
    MemberCount(oneshot::Sender<usize>),
    Shutdown,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("registry control loop is not running")]
pub struct RegistryClosed;

/// Cloneable sender side of the registry.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<RegistryCommand>,
}

impl RegistryHandle {
    fn send(&self, command: RegistryCommand) -> Result<(), RegistryClosed> {
        self.tx.send(command).map_err(|_| RegistryClosed)
    }

    /// Adds a client, sends it its own state, then broadcasts to everyone.
    pub fn join(&self, client: ClientHandle) -> Result<(), RegistryClosed> {
        self.send(RegistryCommand::Join(client))
    }

    /// Removes a client if present, then broadcasts to the rest.
    pub fn leave(&self, id: ClientId) -> Result<(), RegistryClosed> {
        self.send(RegistryCommand::Leave(id))
    }

    pub fn broadcast_all(&self) -> Result<(), RegistryClosed> {
        self.send(RegistryCommand::BroadcastAll)
    }

    /// Number of live clients once every earlier request has been handled.
    pub async fn member_count(&self) -> Result<usize, RegistryClosed> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RegistryCommand::MemberCount(reply_tx))?;
        reply_rx.await.map_err(|_| RegistryClosed)
    }

    /// Disconnects every client and stops the control loop.
    pub fn shutdown(&self) -> Result<(), RegistryClosed> {
        self.send(RegistryCommand::Shutdown)
    }
}

pub struct Registry {
    members: HashMap<ClientId, ClientHandle>,
    rx: mpsc::UnboundedReceiver<RegistryCommand>,
}

impl Registry {
    pub fn new() -> (Self, RegistryHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            members: HashMap::new(),
            rx,
        };
        (registry, RegistryHandle { tx })
    }

    /// Creates a registry and runs its control loop on a new task.
    pub fn spawn() -> (RegistryHandle, JoinHandle<()>) {
        let (registry, handle) = Self::new();
        (handle, tokio::spawn(registry.run()))
    }

    /// Handles requests until shut down or until every handle is dropped.
    pub async fn run(mut self) {
        debug!("Registry control loop started");

        while let Some(command) = self.rx.recv().await {
            match command {
                RegistryCommand::Join(client) => self.join(client).await,
                RegistryCommand::Leave(id) => self.leave(id).await,
                RegistryCommand::BroadcastAll => self.broadcast_all().await,
                RegistryCommand::MemberCount(reply) => {
                    let _ = reply.send(self.members.len());
                }
                RegistryCommand::Shutdown => {
                    self.shutdown();
                    break;
                }
            }
        }

        debug!("Registry control loop finished");
    }

    async fn join(&mut self, client: ClientHandle) {
        let id = client.id();
        if self.members.insert(id, client.clone()).is_some() {
            warn!("Client {} joined twice; keeping the newer handle", id);
        }
        info!("Client {} registered ({} live)", id, self.members.len());

        let own_state = client.current_state().await;
        if let Err(e) = client.offer(Arc::new(vec![own_state])) {
            self.evict(id, e);
        }

        self.broadcast_all().await;
    }

    async fn leave(&mut self, id: ClientId) {
        if self.members.remove(&id).is_some() {
            info!("Client {} deregistered ({} live)", id, self.members.len());
        } else {
            debug!("Client {} already deregistered", id);
        }

        self.broadcast_all().await;
    }

    /// Offers a fresh snapshot to every member, repeating for the survivors
    /// whenever a round evicts someone.
    async fn broadcast_all(&mut self) {
        loop {
            if self.members.is_empty() {
                return;
            }

            let snapshot = self.capture_snapshot().await;

            let failed: Vec<(ClientId, DeliveryError)> = self
                .members
                .values()
                .filter_map(|client| {
                    client
                        .offer(Arc::clone(&snapshot))
                        .err()
                        .map(|e| (client.id(), e))
                })
                .collect();

            if failed.is_empty() {
                return;
            }

            for (id, reason) in failed {
                self.evict(id, reason);
            }
        }
    }

    /// One state copy per member, sorted by identifier.
    async fn capture_snapshot(&self) -> Snapshot {
        let mut states = Vec::with_capacity(self.members.len());
        for client in self.members.values() {
            states.push(client.snapshot_state().await);
        }
        states.sort_by_key(|state| state.id);
        Arc::new(states)
    }

    fn evict(&mut self, id: ClientId, reason: DeliveryError) {
        if let Some(client) = self.members.remove(&id) {
            warn!("Dropping client {}: {}", id, reason);
            client.disconnect();
        }
    }

    fn shutdown(&mut self) {
        info!("Registry shutting down, disconnecting {} clients", self.members.len());
        for (_, client) in self.members.drain() {
            client.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::detached_handle;
    use assert_approx_eq::assert_approx_eq;
    use shared::ClientState;

    fn drain(mailbox: &mut mpsc::Receiver<Snapshot>) -> Vec<Snapshot> {
        let mut batches = Vec::new();
        while let Ok(batch) = mailbox.try_recv() {
            batches.push(batch);
        }
        batches
    }

    #[tokio::test]
    async fn test_join_sends_own_state_then_snapshot() {
        let (registry, _task) = Registry::spawn();
        let (client, mut mailbox) = detached_handle(1, 10.0, 5.0, 8);

        registry.join(client).unwrap();
        assert_eq!(registry.member_count().await.unwrap(), 1);

        let batches = drain(&mut mailbox);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].id, 1);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1][0].x, 10.0);
        assert_eq!(batches[1][0].y, 5.0);
    }

    #[tokio::test]
    async fn test_every_member_sees_every_join() {
        let (registry, _task) = Registry::spawn();
        let mut mailboxes = Vec::new();

        for id in 1..=6 {
            let (client, mailbox) = detached_handle(id, id as f64, 0.0, 32);
            registry.join(client).unwrap();
            mailboxes.push(mailbox);
        }
        assert_eq!(registry.member_count().await.unwrap(), 6);

        for mailbox in &mut mailboxes {
            let last = drain(mailbox).pop().unwrap();
            let ids: Vec<ClientId> = last.iter().map(|s| s.id).collect();
            assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
        }
    }

    #[tokio::test]
    async fn test_concurrent_joins() {
        let (registry, _task) = Registry::spawn();
        let mut joins = Vec::new();

        for id in 1..=16 {
            let registry = registry.clone();
            joins.push(tokio::spawn(async move {
                let (client, mailbox) = detached_handle(id, 0.0, 0.0, 64);
                registry.join(client).unwrap();
                mailbox
            }));
        }

        let mut mailboxes = Vec::new();
        for join in joins {
            mailboxes.push(join.await.unwrap());
        }
        assert_eq!(registry.member_count().await.unwrap(), 16);

        for mailbox in &mut mailboxes {
            assert_eq!(drain(mailbox).pop().unwrap().len(), 16);
        }
    }

    #[tokio::test]
    async fn test_leave_shrinks_snapshots_by_one() {
        let (registry, _task) = Registry::spawn();
        let (a, mut mailbox_a) = detached_handle(1, 0.0, 0.0, 16);
        let (b, mut mailbox_b) = detached_handle(2, 0.0, 0.0, 16);
        registry.join(a).unwrap();
        registry.join(b).unwrap();
        assert_eq!(registry.member_count().await.unwrap(), 2);
        drain(&mut mailbox_a);
        drain(&mut mailbox_b);

        registry.leave(1).unwrap();
        assert_eq!(registry.member_count().await.unwrap(), 1);

        let batches = drain(&mut mailbox_b);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].id, 2);
        assert!(drain(&mut mailbox_a).is_empty());
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let (registry, _task) = Registry::spawn();
        let (a, _mailbox_a) = detached_handle(1, 0.0, 0.0, 16);
        let (b, _mailbox_b) = detached_handle(2, 0.0, 0.0, 16);
        registry.join(a).unwrap();
        registry.join(b).unwrap();

        registry.leave(1).unwrap();
        registry.leave(1).unwrap();
        registry.leave(42).unwrap();

        assert_eq!(registry.member_count().await.unwrap(), 1);

        registry.leave(2).unwrap();
        registry.leave(2).unwrap();
        assert_eq!(registry.member_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_resets_delta() {
        let (registry, _task) = Registry::spawn();
        let (client, mut mailbox) = detached_handle(1, 0.0, 0.0, 16);
        registry.join(client.clone()).unwrap();
        assert_eq!(registry.member_count().await.unwrap(), 1);
        drain(&mut mailbox);

        client
            .state_for_test()
            .merge(&ClientState {
                id: 1,
                x: 1.0,
                y: 1.0,
                delta: 0.75,
            })
            .await;

        registry.broadcast_all().unwrap();
        registry.broadcast_all().unwrap();
        assert_eq!(registry.member_count().await.unwrap(), 1);

        let batches = drain(&mut mailbox);
        assert_eq!(batches.len(), 2);
        assert_approx_eq!(batches[0][0].delta, 0.75, 1e-12);
        assert_eq!(batches[1][0].delta, 0.0);
    }

    #[tokio::test]
    async fn test_full_mailbox_evicts_only_that_client() {
        let (registry, _task) = Registry::spawn();
        let (slow, _slow_mailbox) = detached_handle(1, 0.0, 0.0, 3);
        let (fast, mut fast_mailbox) = detached_handle(2, 0.0, 0.0, 3);
        registry.join(slow.clone()).unwrap();
        registry.join(fast.clone()).unwrap();
        assert_eq!(registry.member_count().await.unwrap(), 2);

        // The slow client never drains; the fast one drains after each round.
        for _ in 0..4 {
            drain(&mut fast_mailbox);
            registry.broadcast_all().unwrap();
            registry.member_count().await.unwrap();
        }

        assert_eq!(registry.member_count().await.unwrap(), 1);
        assert!(slow.is_closing());
        assert!(slow.is_stopped());
        assert!(!fast.is_closing());

        let last = drain(&mut fast_mailbox).pop().unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].id, 2);
    }

    #[tokio::test]
    async fn test_closed_mailbox_evicts_client() {
        let (registry, _task) = Registry::spawn();
        let (gone, gone_mailbox) = detached_handle(1, 0.0, 0.0, 4);
        drop(gone_mailbox);

        registry.join(gone.clone()).unwrap();
        assert_eq!(registry.member_count().await.unwrap(), 0);
        assert!(gone.is_stopped());
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_members_and_stops() {
        let (registry, task) = Registry::spawn();
        let (a, _mailbox_a) = detached_handle(1, 0.0, 0.0, 4);
        let (b, _mailbox_b) = detached_handle(2, 0.0, 0.0, 4);
        registry.join(a.clone()).unwrap();
        registry.join(b.clone()).unwrap();

        registry.shutdown().unwrap();
        task.await.unwrap();

        assert!(a.is_stopped());
        assert!(b.is_stopped());
        assert_eq!(registry.member_count().await, Err(RegistryClosed));
        assert_eq!(registry.broadcast_all(), Err(RegistryClosed));
    }
}
