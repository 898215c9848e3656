//! Broker service: the per-machine owner of all leased segments.
//!
//! The broker accepts control connections, runs each one as its own task and
//! funnels every registry mutation through a single registry actor. On
//! shutdown it stops accepting, closes every leased connection and unlinks
//! every remaining segment.
//!
//! ```rust,no_run
//! use shmb_shared_memory::broker::BrokerServer;
//!
//! # async fn run() -> shmb_shared_memory::ShmResult<()> {
//! let server = BrokerServer::bind("127.0.0.1:25979".parse().unwrap()).await?;
//! let report = server.serve().await?;
//! println!("unlinked {} segments", report.segments);
//! # Ok(())
//! # }
//! ```

use crate::error::ShmResult;
use crate::registry::{LeaseId, TeardownReport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

pub mod actor;
mod connection;

pub use actor::RegistryHandle;
use connection::{ConnectionContext, handle_connection};

/// Process-wide shutdown trigger.
///
/// Raised by the `SHUTDOWN` command, by signal handlers or by tests.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// True once shutdown was requested
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until shutdown is requested
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

/// Bound, not yet serving, broker
pub struct BrokerServer {
    listener: TcpListener,
    registry: RegistryHandle,
    actor: JoinHandle<TeardownReport>,
    shutdown: ShutdownHandle,
}

impl BrokerServer {
    /// Bind the control listener and start the registry actor.
    pub async fn bind(address: SocketAddr) -> ShmResult<Self> {
        let listener = TcpListener::bind(address).await?;
        let (registry, actor) = RegistryHandle::spawn();

        Ok(Self {
            listener,
            registry,
            actor,
            shutdown: ShutdownHandle::new(),
        })
    }

    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> ShmResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Registry handle for introspection
    pub fn registry(&self) -> RegistryHandle {
        self.registry.clone()
    }

    /// Handle that stops [`serve`](Self::serve)
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown, then tear everything down.
    pub async fn serve(self) -> ShmResult<TeardownReport> {
        let Self {
            listener,
            registry,
            actor,
            shutdown,
        } = self;

        let local = listener.local_addr()?;
        info!(address = %local, "broker listening");

        let (teardown_tx, teardown_rx) = watch::channel(false);
        let ctx = ConnectionContext {
            registry: registry.clone(),
            shutdown: shutdown.clone(),
            teardown: teardown_rx,
        };

        let mut connections = JoinSet::new();
        let mut next_lease: LeaseId = 0;

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        next_lease += 1;
                        let lease = next_lease;
                        debug!(%peer, lease, "accepted control connection");
                        connections.spawn(handle_connection(stream, peer, lease, ctx.clone()));
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    match finished {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!(error = %e, "control connection ended with error"),
                        Err(e) => debug!(error = %e, "control connection task aborted"),
                    }
                }
                _ = shutdown.wait() => {
                    info!("shutdown signal received, no longer accepting connections");
                    break;
                }
            }
        }
        drop(listener);

        Ok(teardown(registry, actor, teardown_tx, connections).await)
    }
}

async fn teardown(
    registry: RegistryHandle,
    actor: JoinHandle<TeardownReport>,
    teardown_tx: watch::Sender<bool>,
    mut connections: JoinSet<ShmResult<()>>,
) -> TeardownReport {
    let report = registry.teardown().await;
    drop(registry);
    teardown_tx.send_replace(true);

    if let Err(e) = actor.await {
        error!(error = %e, "registry actor failed");
    }

    connections.shutdown().await;
    info!(
        segments = report.segments,
        leases = report.leases,
        "broker teardown complete"
    );
    report
}

/// Listen for SIGINT/SIGTERM and raise `shutdown` on the first one.
pub fn spawn_signal_listener(shutdown: ShutdownHandle) -> ShmResult<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = shutdown.wait() => return,
        }
        shutdown.trigger();
    }))
}
