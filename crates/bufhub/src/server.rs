//! The allocation server.
//!
//! One OS thread per slot (the control slot plus every data slot) runs the
//! rendezvous loop for that slot, so a stalled client never delays another.
//! Handshake connections are accepted on the tokio runtime that drives
//! [`Server::run`].

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::allocator::{LeaseInfo, RevokeReason, SlotAllocator};
use crate::config::HubConfig;
use crate::error::{HubError, Violation};
use crate::handshake;
use crate::native::NativeAllocator;
use crate::protocol::{Request, Response};
use crate::region::SharedRegion;
use crate::registry::BufferRegistry;
use crate::rendezvous::{Delivery, Served, ServerEndpoint, SlotRole};

// =============================================================================
// Shutdown
// =============================================================================

struct Shutdown {
    /// Polled by slot workers.
    flag: AtomicBool,
    /// Awaited by the accept loop.
    signal: watch::Sender<bool>,
}

impl Shutdown {
    fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            signal: watch::Sender::new(false),
        }
    }

    fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        self.signal.send_replace(true);
    }

    fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Stops a running [`Server`]. Cheap to clone.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<Shutdown>,
}

impl ServerHandle {
    /// Ask the server to stop. Workers notice at their next poll.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_triggered()
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

// =============================================================================
// Server
// =============================================================================

/// State every slot worker needs.
struct Shared {
    region: Arc<SharedRegion>,
    allocator: Arc<SlotAllocator>,
    registry: BufferRegistry,
    shutdown: Arc<Shutdown>,
    poll_interval: Duration,
    release_timeout: Duration,
}

/// A bound, not yet running, allocation server.
pub struct Server {
    shared: Arc<Shared>,
    listener: UnixListener,
    socket_path: PathBuf,
    handshake_timeout: Duration,
}

impl Server {
    /// Create the region and bind the handshake endpoint.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// Fails with `ResourceUnavailable` if another server is still accepting
    /// on the socket or still holds the region.
    pub fn bind(config: HubConfig, native: Arc<dyn NativeAllocator>) -> Result<Self, HubError> {
        if std::os::unix::net::UnixStream::connect(&config.socket_path).is_ok() {
            return Err(HubError::endpoint_io(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("a server is already accepting on {}", config.socket_path.display()),
            )));
        }
        let region = Arc::new(SharedRegion::create(&config.region_name, config.slot_count)?);

        match std::fs::remove_file(&config.socket_path) {
            Ok(()) => tracing::debug!(path = %config.socket_path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(HubError::endpoint_io(e)),
        }
        let listener = UnixListener::bind(&config.socket_path).map_err(HubError::endpoint_io)?;

        let allocator = Arc::new(SlotAllocator::new(region.clone(), config.handshake_timeout));
        tracing::info!(
            region = %config.region_name,
            socket = %config.socket_path.display(),
            slots = config.slot_count,
            "server bound"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                region,
                allocator,
                registry: BufferRegistry::new(native),
                shutdown: Arc::new(Shutdown::new()),
                poll_interval: config.poll_interval,
                release_timeout: config.release_timeout,
            }),
            listener,
            socket_path: config.socket_path,
            handshake_timeout: config.handshake_timeout,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shared.shutdown.clone(),
        }
    }

    /// Serve until [`ServerHandle::shutdown`] is called.
    ///
    /// On return the socket file is removed and the region unlinked.
    pub async fn run(self) -> Result<(), HubError> {
        let Self {
            shared,
            listener,
            socket_path,
            handshake_timeout,
        } = self;

        let workers = match spawn_workers(&shared) {
            Ok(workers) => workers,
            Err(e) => {
                shared.shutdown.trigger();
                let _ = std::fs::remove_file(&socket_path);
                return Err(HubError::region_io(e));
            }
        };

        let mut connections = JoinSet::new();
        let mut stop = shared.shutdown.signal.subscribe();
        loop {
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        connections.spawn(handshake::serve_connection(
                            stream,
                            shared.allocator.clone(),
                            handshake_timeout,
                        ));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        tracing::info!("shutting down");
        connections.shutdown().await;
        drop(listener);

        let joined = tokio::task::spawn_blocking(move || {
            for worker in workers {
                if worker.join().is_err() {
                    tracing::error!("slot worker panicked");
                }
            }
        })
        .await;
        if joined.is_err() {
            tracing::error!("failed to join slot workers");
        }

        if let Err(e) = std::fs::remove_file(&socket_path) {
            tracing::warn!(path = %socket_path.display(), error = %e, "failed to remove socket");
        }
        drop(shared);
        Ok(())
    }
}

fn spawn_workers(shared: &Arc<Shared>) -> io::Result<Vec<JoinHandle<()>>> {
    let mut workers = Vec::with_capacity(shared.region.slot_count() as usize + 1);

    let control = shared.clone();
    workers.push(
        std::thread::Builder::new()
            .name("slot-control".into())
            .spawn(move || control_worker(&control))?,
    );

    for index in 0..shared.region.slot_count() {
        let shared = shared.clone();
        workers.push(
            std::thread::Builder::new()
                .name(format!("slot-{}", index))
                .spawn(move || data_worker(&shared, index))?,
        );
    }
    Ok(workers)
}

// =============================================================================
// Control slot
// =============================================================================

fn control_worker(shared: &Shared) {
    let endpoint = ServerEndpoint::new(shared.region.control_slot(), SlotRole::Control);

    while !shared.shutdown.is_triggered() {
        let served = match endpoint.serve_once(shared.poll_interval) {
            Ok(served) => served,
            Err(e) => {
                tracing::error!(error = %e, "control worker stopped");
                return;
            }
        };

        let response = match served {
            Served::Idle | Served::Abandoned => continue,
            Served::Malformed(violation) => {
                tracing::warn!(%violation, "malformed control request");
                Response::Rejected(violation)
            }
            Served::Request(request) if !request.kind().allowed_on(endpoint.role()) => {
                tracing::warn!(?request, "data request on the control slot");
                Response::Rejected(Violation::WrongSlotKind)
            }
            Served::Request(Request::AllocateSlot { pid }) => match shared.allocator.allocate(pid) {
                Ok((slot, _)) => Response::SlotAssigned { slot },
                Err(_) => {
                    tracing::debug!(pid, "no free slot");
                    Response::Exhausted
                }
            },
            Served::Request(_) => Response::Rejected(Violation::WrongSlotKind),
        };

        match endpoint.reply(&response) {
            Ok(Delivery::Delivered) => {}
            Ok(delivery) => {
                // Nobody will ever use a slot whose assignment went undelivered.
                if let Response::SlotAssigned { slot } = response {
                    tracing::warn!(slot, ?delivery, "slot assignment not delivered");
                    shared.allocator.free(slot);
                }
            }
            Err(e) => tracing::error!(error = %e, "control reply failed"),
        }
    }
}

// =============================================================================
// Data slots
// =============================================================================

fn data_worker(shared: &Shared, index: u32) {
    let Some(slot) = shared.region.data_slot(index) else {
        return;
    };
    let endpoint = ServerEndpoint::new(slot, SlotRole::Data(index));

    while !shared.shutdown.is_triggered() {
        let served = match endpoint.serve_once(shared.poll_interval) {
            Ok(served) => served,
            Err(e) => {
                tracing::error!(slot = index, error = %e, "slot worker stopped");
                return;
            }
        };

        match served {
            Served::Idle => {
                if let Some(reason) = shared.allocator.reclaim_reason(index, Instant::now()) {
                    reclaim(shared, index, reason);
                }
            }
            Served::Abandoned => reclaim(shared, index, RevokeReason::Abandoned),
            Served::Malformed(violation) => reject(shared, &endpoint, index, violation),
            Served::Request(request) => serve_request(shared, &endpoint, index, request),
        }
    }
}

fn serve_request(shared: &Shared, endpoint: &ServerEndpoint<'_>, index: u32, request: Request) {
    let response = match shared.allocator.lease(index) {
        _ if !request.kind().allowed_on(endpoint.role()) => {
            Response::Rejected(Violation::WrongSlotKind)
        }
        Some(lease) => execute(shared, &lease, request),
        None => Response::Rejected(Violation::SlotNotLeased),
    };
    tracing::debug!(slot = index, ?request, ?response, "exchange");

    let delivery = match endpoint.reply(&response) {
        Ok(delivery) => delivery,
        Err(e) => {
            tracing::error!(slot = index, error = %e, "reply failed");
            return;
        }
    };

    match (request, delivery) {
        (_, Delivery::Abandoned) => reclaim(shared, index, RevokeReason::Abandoned),
        (Request::Finish, Delivery::Delivered) => {
            if !endpoint.await_release(shared.release_timeout) {
                tracing::warn!(slot = index, "client did not release slot after Finish");
            }
            shared.allocator.free(index);
        }
        _ => {}
    }
}

fn reject(shared: &Shared, endpoint: &ServerEndpoint<'_>, index: u32, violation: Violation) {
    tracing::warn!(slot = index, %violation, "malformed request");
    match endpoint.reply(&Response::Rejected(violation)) {
        Ok(Delivery::Abandoned) => reclaim(shared, index, RevokeReason::Abandoned),
        Ok(_) => {}
        Err(e) => tracing::error!(slot = index, error = %e, "reply failed"),
    }
}

fn execute(shared: &Shared, lease: &LeaseInfo, request: Request) -> Response {
    match request {
        Request::AllocateSlot { .. } => Response::Rejected(Violation::WrongSlotKind),
        Request::CreateBuffer { width, height } => {
            match shared.registry.create(width, height, lease.id) {
                Ok((id, stride)) => Response::BufferCreated { id, stride },
                Err(_) => Response::AllocationFailed,
            }
        }
        Request::DestroyBuffer { id } => match shared.registry.destroy(id) {
            Ok(()) => Response::Destroyed,
            Err(_) => Response::NotFound { id },
        },
        Request::GetBuffer { id } => match shared.registry.get(id) {
            Ok(handle) => Response::Buffer(handle),
            Err(_) => Response::NotFound { id },
        },
        Request::Finish => {
            tracing::info!(pid = lease.pid, lease = %lease.id, "session finished");
            Response::Finished
        }
    }
}

/// Tear down a lease that ended without Finish.
fn reclaim(shared: &Shared, index: u32, reason: RevokeReason) {
    if let Some(lease) = shared.allocator.lease(index) {
        shared.allocator.revoke(index, lease.id, reason);
        shared.registry.release_owned_by(lease.id);
        tracing::warn!(slot = index, pid = lease.pid, lease = %lease.id, ?reason, "reclaiming slot");
    }
    shared.allocator.free(index);
}
