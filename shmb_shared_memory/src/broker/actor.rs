//! Registry actor.
//!
//! One task owns the [`SegmentRegistry`]; connection handlers talk to it
//! through [`RegistryHandle`]. Requests are processed one at a time, so a
//! release and its empty-check/unlink decision can never interleave with
//! another connection's create or attach.

use crate::error::{ShmError, ShmResult};
use crate::registry::{LeaseId, Release, SegmentRegistry, TeardownReport};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

enum Request {
    Create {
        num_buffers: u64,
        buf_size: u64,
        lease: LeaseId,
        reply: oneshot::Sender<ShmResult<String>>,
    },
    Attach {
        name: String,
        lease: LeaseId,
        reply: oneshot::Sender<bool>,
    },
    Release {
        name: String,
        lease: LeaseId,
    },
    Contains {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    LeaseCount {
        name: String,
        reply: oneshot::Sender<Option<usize>>,
    },
    Names {
        reply: oneshot::Sender<Vec<String>>,
    },
    Teardown {
        reply: oneshot::Sender<TeardownReport>,
    },
}

/// Cloneable handle to the broker's segment registry
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl std::fmt::Debug for RegistryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl RegistryHandle {
    /// Start the actor task with an empty registry.
    pub(crate) fn spawn() -> (Self, JoinHandle<TeardownReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(SegmentRegistry::new(), rx));
        (Self { tx }, task)
    }

    /// Create a segment held by `lease`; returns its name.
    pub async fn create(&self, num_buffers: u64, buf_size: u64, lease: LeaseId) -> ShmResult<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Create {
            num_buffers,
            buf_size,
            lease,
            reply,
        });
        rx.await.unwrap_or_else(|_| {
            Err(ShmError::CreationError {
                reason: "broker registry is shut down".to_string(),
            })
        })
    }

    /// Add `lease` to segment `name`. False if the segment is unknown.
    pub async fn attach(&self, name: &str, lease: LeaseId) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Attach {
            name: name.to_string(),
            lease,
            reply,
        });
        rx.await.unwrap_or(false)
    }

    /// Release `lease` on `name`. Never blocks, so it is usable from `Drop`.
    pub fn release(&self, name: &str, lease: LeaseId) {
        self.send(Request::Release {
            name: name.to_string(),
            lease,
        });
    }

    /// True if segment `name` is registered
    pub async fn contains(&self, name: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Contains {
            name: name.to_string(),
            reply,
        });
        rx.await.unwrap_or(false)
    }

    /// Number of leases on `name`
    pub async fn lease_count(&self, name: &str) -> Option<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::LeaseCount {
            name: name.to_string(),
            reply,
        });
        rx.await.ok().flatten()
    }

    /// Names of all registered segments
    pub async fn segment_names(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Names { reply });
        rx.await.unwrap_or_default()
    }

    /// Unlink every segment and stop the actor.
    pub(crate) async fn teardown(&self) -> TeardownReport {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Teardown { reply });
        rx.await.unwrap_or_default()
    }

    fn send(&self, request: Request) {
        if self.tx.send(request).is_err() {
            trace!("registry actor gone, request dropped");
        }
    }
}

async fn run(
    mut registry: SegmentRegistry,
    mut rx: mpsc::UnboundedReceiver<Request>,
) -> TeardownReport {
    while let Some(request) = rx.recv().await {
        match request {
            Request::Create {
                num_buffers,
                buf_size,
                lease,
                reply,
            } => {
                let result = registry.create(num_buffers, buf_size, lease);
                if let Err(Ok(name)) = reply.send(result) {
                    // Requester vanished before the reply: its lease goes too.
                    registry.release(&name, lease);
                }
            }
            Request::Attach { name, lease, reply } => {
                let attached = registry.attach(&name, lease);
                if reply.send(attached).is_err() && attached {
                    registry.release(&name, lease);
                }
            }
            Request::Release { name, lease } => match registry.release(&name, lease) {
                Release::Retained { remaining } => {
                    debug!(%name, lease, remaining, "lease released");
                }
                Release::Unlinked => debug!(%name, lease, "last lease released"),
                Release::Unknown => trace!(%name, lease, "release of unknown lease"),
            },
            Request::Contains { name, reply } => {
                let _ = reply.send(registry.contains(&name));
            }
            Request::LeaseCount { name, reply } => {
                let _ = reply.send(registry.lease_count(&name));
            }
            Request::Names { reply } => {
                let _ = reply.send(registry.names());
            }
            Request::Teardown { reply } => {
                let report = registry.teardown();
                let _ = reply.send(report);
                return report;
            }
        }
    }
    registry.teardown()
}
