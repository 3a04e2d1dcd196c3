//! Single-instance role resolution and argument hand-off.
//!
//! Every launch runs [`Coordinator::resolve`] once:
//!
//! 1. Connect to the endpoint and wait for the primary's `hello`. On success
//!    this process is a secondary: it sends its argv, waits briefly for an
//!    `ack`, and the caller exits.
//! 2. Otherwise bind the endpoint and become the primary.
//! 3. If the bind loses a race, connect once more; if that fails too, run
//!    standalone instead of refusing to start.

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use utils::{read_envelope, write_envelope, Envelope, FrameError, HandoffMessage, PROTOCOL_VERSION};

use crate::consts::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_FLUSH_TIMEOUT_MS, DEFAULT_READ_TIMEOUT_MS};
use crate::endpoint::{Endpoint, EndpointError};

const INBOUND_QUEUE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceRole {
    Unresolved,
    /// Holds the endpoint and owns the windows.
    Primary,
    /// Forwarded its arguments; about to exit.
    Secondary,
    /// Could neither reach nor claim the endpoint; runs without coordination.
    Standalone,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Bound on connect plus the primary's greeting.
    pub connect_timeout: Duration,
    /// Bound on reading one hand-off frame from a secondary.
    pub read_timeout: Duration,
    /// Bound on sending the hand-off and on each ack wait.
    pub flush_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            flush_timeout: Duration::from_millis(DEFAULT_FLUSH_TIMEOUT_MS),
            max_frame_bytes: utils::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("instance role already resolved as {0:?}")]
    AlreadyResolved(InstanceRole),
}

/// Why an inbound connection was dropped without delivering anything.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("malformed hand-off frame: {0}")]
    Frame(#[from] FrameError),
    #[error("no complete frame within {0:?}")]
    ReadTimeout(Duration),
    #[error("expected handoff, got {0}")]
    Unexpected(&'static str),
    #[error("dispatcher queue unavailable")]
    QueueClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffReport {
    pub message_id: String,
    /// The primary confirmed it queued the message. Best effort only.
    pub acknowledged: bool,
}

#[derive(Debug)]
pub enum Resolution {
    Primary(PrimaryHandle),
    Secondary(HandoffReport),
    Standalone(EndpointError),
}

impl Resolution {
    pub fn role(&self) -> InstanceRole {
        match self {
            Resolution::Primary(_) => InstanceRole::Primary,
            Resolution::Secondary(_) => InstanceRole::Secondary,
            Resolution::Standalone(_) => InstanceRole::Standalone,
        }
    }
}

pub struct Coordinator {
    endpoint: Endpoint,
    settings: CoordinatorSettings,
    role: InstanceRole,
}

impl Coordinator {
    pub fn new(endpoint: Endpoint, settings: CoordinatorSettings) -> Self {
        Self {
            endpoint,
            settings,
            role: InstanceRole::Unresolved,
        }
    }

    pub fn role(&self) -> InstanceRole {
        self.role
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Decide this process's role. `args` is the full argv forwarded when this
    /// process turns out to be a secondary.
    pub async fn resolve(&mut self, args: &[String]) -> Result<Resolution, CoordinatorError> {
        if self.role != InstanceRole::Unresolved {
            return Err(CoordinatorError::AlreadyResolved(self.role));
        }
        let resolution = self.race(args).await;
        self.role = resolution.role();
        log::info!("coordinator: role={:?} endpoint={}", self.role, self.endpoint);
        Ok(resolution)
    }

    async fn race(&self, args: &[String]) -> Resolution {
        match self.connect_primary().await {
            Ok(stream) => return Resolution::Secondary(self.hand_off(stream, args).await),
            Err(e) => log::debug!("coordinator: no primary at {} ({})", self.endpoint, e),
        }

        match self.endpoint.bind() {
            Ok(listener) => {
                return Resolution::Primary(PrimaryHandle::start(
                    self.endpoint.clone(),
                    listener,
                    self.settings.clone(),
                ));
            }
            Err(EndpointError::InUse) => {
                log::debug!("coordinator: {} is held, retrying connect", self.endpoint);
            }
            Err(e) => {
                log::warn!(
                    "coordinator: cannot bind {} ({}), running standalone",
                    self.endpoint,
                    e
                );
                return Resolution::Standalone(e);
            }
        }

        match self.connect_primary().await {
            Ok(stream) => Resolution::Secondary(self.hand_off(stream, args).await),
            Err(e) => {
                log::warn!(
                    "coordinator: {} is held but unreachable ({}), running standalone",
                    self.endpoint,
                    e
                );
                Resolution::Standalone(e)
            }
        }
    }

    /// Connect and wait for `hello`, both within one `connect_timeout`. A
    /// listener that never accepts shows up here as a timeout.
    async fn connect_primary(&self) -> Result<UnixStream, EndpointError> {
        let started = Instant::now();
        let budget = self.settings.connect_timeout;
        let mut stream = self.endpoint.connect(budget).await?;

        let remaining = budget.saturating_sub(started.elapsed());
        let greeting = tokio::time::timeout(
            remaining,
            read_envelope(&mut stream, self.settings.max_frame_bytes),
        )
        .await
        .map_err(|_| EndpointError::ConnectTimeout(budget))??;

        match greeting {
            Envelope::Hello { version, pid } => {
                if version != PROTOCOL_VERSION {
                    log::warn!(
                        "coordinator: primary pid={} speaks protocol v{} (ours v{})",
                        pid,
                        version,
                        PROTOCOL_VERSION
                    );
                }
                log::debug!("coordinator: greeted by primary pid={}", pid);
                Ok(stream)
            }
            other => Err(EndpointError::UnexpectedGreeting(other.kind())),
        }
    }

    /// Send argv once. Failures are logged, never retried: the secondary exits
    /// either way.
    async fn hand_off(&self, mut stream: UnixStream, args: &[String]) -> HandoffReport {
        let msg = HandoffMessage::new(args.to_vec());
        let message_id = msg.id.clone();
        let flush = self.settings.flush_timeout;

        let sent = tokio::time::timeout(flush, write_envelope(&mut stream, &Envelope::Handoff(msg)))
            .await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::warn!("handoff: send failed id={} ({})", message_id, e);
                return HandoffReport {
                    message_id,
                    acknowledged: false,
                };
            }
            Err(_) => {
                log::warn!("handoff: send timed out id={} after {:?}", message_id, flush);
                return HandoffReport {
                    message_id,
                    acknowledged: false,
                };
            }
        }

        let reply =
            tokio::time::timeout(flush, read_envelope(&mut stream, self.settings.max_frame_bytes))
                .await;
        let acknowledged = match reply {
            Ok(Ok(Envelope::Ack { id })) if id == message_id => true,
            Ok(Ok(other)) => {
                log::debug!("handoff: unexpected reply {} id={}", other.kind(), message_id);
                false
            }
            Ok(Err(e)) => {
                log::debug!("handoff: no ack id={} ({})", message_id, e);
                false
            }
            Err(_) => {
                log::debug!("handoff: no ack id={} within {:?}", message_id, flush);
                false
            }
        };
        log::info!("handoff: sent id={} acknowledged={}", message_id, acknowledged);
        HandoffReport {
            message_id,
            acknowledged,
        }
    }
}

/// The listening side, owned by the primary for the rest of its life.
#[derive(Debug)]
pub struct PrimaryHandle {
    endpoint: Endpoint,
    inbound: mpsc::Receiver<HandoffMessage>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PrimaryHandle {
    fn start(endpoint: Endpoint, listener: UnixListener, settings: CoordinatorSettings) -> Self {
        let (tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, tx, settings, shutdown_rx));
        Self {
            endpoint,
            inbound,
            shutdown,
            task,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Next complete hand-off message from a secondary, in arrival order.
    pub async fn recv(&mut self) -> Option<HandoffMessage> {
        self.inbound.recv().await
    }

    /// Stop accepting, drop in-flight connections, and release the endpoint.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            log::warn!("coordinator: accept loop ended abnormally: {}", e);
        }
        self.endpoint.release();
        log::info!("coordinator: released {}", self.endpoint);
    }
}

async fn accept_loop(
    listener: UnixListener,
    tx: mpsc::Sender<HandoffMessage>,
    settings: CoordinatorSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    // Connected secondaries; aborted together on shutdown.
    let mut connections = JoinSet::new();
    let mut next_conn_id: u64 = 0;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        next_conn_id += 1;
                        let conn_id = next_conn_id;
                        let tx = tx.clone();
                        let settings = settings.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(conn_id, stream, &tx, &settings).await {
                                log::warn!("handoff: dropped conn={} ({})", conn_id, e);
                            }
                        });
                        log::debug!(
                            "handoff: accepted conn={} active={}",
                            conn_id,
                            connections.len()
                        );
                    }
                    Err(e) => {
                        log::warn!("handoff: accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }

    connections.abort_all();
}

/// Greet, read exactly one frame, queue it, ack. Anything short of a complete
/// `handoff` frame is dropped here and never reaches the queue.
async fn handle_connection(
    conn_id: u64,
    mut stream: UnixStream,
    tx: &mpsc::Sender<HandoffMessage>,
    settings: &CoordinatorSettings,
) -> Result<(), HandoffError> {
    let read_timeout = settings.read_timeout;
    tokio::time::timeout(read_timeout, write_envelope(&mut stream, &Envelope::hello()))
        .await
        .map_err(|_| HandoffError::ReadTimeout(read_timeout))??;

    let env = tokio::time::timeout(
        read_timeout,
        read_envelope(&mut stream, settings.max_frame_bytes),
    )
    .await
    .map_err(|_| HandoffError::ReadTimeout(read_timeout))??;

    let msg = match env {
        Envelope::Handoff(m) => m,
        other => return Err(HandoffError::Unexpected(other.kind())),
    };
    let id = msg.id.clone();
    log::info!(
        "handoff: recv conn={} id={} pid={} args={}",
        conn_id,
        msg.id,
        msg.pid,
        msg.args.len()
    );

    // The secondary's part is done; a full queue only delays the ack, it never
    // drops the message. Shutdown aborts this task if the queue never drains.
    tx.send(msg).await.map_err(|_| HandoffError::QueueClosed)?;

    if let Ok(Err(e)) =
        tokio::time::timeout(settings.flush_timeout, write_envelope(&mut stream, &Envelope::Ack { id }))
            .await
    {
        log::debug!("handoff: ack not delivered conn={} ({})", conn_id, e);
    }
    Ok(())
}
