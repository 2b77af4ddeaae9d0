//! TCP acceptor handing each connection to a new client actor

use crate::client::ClientActor;
use crate::config::{ConfigError, ServerConfig};
use crate::registry::{Registry, RegistryHandle};
use crate::state::IdGenerator;
use log::{error, info, warn};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Listening socket plus the registry its clients join.
pub struct Server {
    listener: TcpListener,
    registry: RegistryHandle,
    registry_task: JoinHandle<()>,
    ids: IdGenerator,
    config: Arc<ServerConfig>,
}

impl Server {
    /// Binds `addr` and starts the registry's control loop.
    pub async fn bind(addr: &str, config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let (registry, registry_task) = Registry::spawn();

        Ok(Server {
            listener,
            registry,
            registry_task,
            ids: IdGenerator::new(),
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> RegistryHandle {
        self.registry.clone()
    }

    /// Accepts connections forever.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves, then disconnects every
    /// client and waits for the registry to stop.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_client(stream, addr),
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        if let Ok(live) = self.registry.member_count().await {
            info!("Shutting down with {} clients connected", live);
        }
        if self.registry.shutdown().is_ok() {
            if let Err(e) = self.registry_task.await {
                error!("Registry task panicked: {}", e);
            }
        }

        Ok(())
    }

    fn spawn_client(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Could not disable Nagle for {}: {}", addr, e);
        }

        let actor = match ClientActor::new(
            stream,
            self.registry.clone(),
            &self.ids,
            Arc::clone(&self.config),
        ) {
            Ok(actor) => actor,
            Err(e) => {
                error!("Rejecting connection from {}: {}", addr, e);
                return;
            }
        };

        info!("Client {} connected from {}", actor.id(), addr);

        tokio::spawn(async move {
            let id = actor.id();
            if let Err(e) = actor.run().await {
                error!("Client {} ended with error: {}", id, e);
            }
        });
    }
}
