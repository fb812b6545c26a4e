use chrono::{DateTime, Utc};
use dashmap::DashMap;
use portico_common::{Result, TunnelError};
use portico_protocol::codec::encoded_len;
use portico_protocol::constants::MAX_FRAME_SIZE;
use portico_protocol::frame::{Frame, RequestFrame, ResponseFrame};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Reply correlated with an outstanding request or probe
#[derive(Debug)]
pub enum Reply {
    Response(ResponseFrame),
    Probe {
        reachable: bool,
        error: Option<String>,
    },
}

/// Broker side handle of one live control connection.
///
/// The socket itself is owned by the connection task; this handle holds the
/// outbound queue and the table of callers waiting for a reply.
#[derive(Debug)]
pub struct ControlConnection {
    id: String,
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<Frame>,
    max_frame_size: usize,
    pending: DashMap<u64, oneshot::Sender<Reply>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Removes a pending entry when the waiting caller goes away (timeout, cancel)
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, oneshot::Sender<Reply>>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl ControlConnection {
    pub fn new(id: impl Into<String>, peer: SocketAddr, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            id: id.into(),
            peer,
            connected_at: Utc::now(),
            outbound,
            max_frame_size: MAX_FRAME_SIZE as usize,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Largest payload the peer's codec accepts
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of requests and probes still waiting for the client
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Queue a frame for the writer task
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TunnelError::ConnectionClosed(self.id.clone()))
    }

    /// Queue a frame without waiting for room in the outbound queue
    pub fn try_send(&self, frame: Frame) -> Result<()> {
        self.outbound
            .try_send(frame)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    TunnelError::Connection(format!("outbound queue of {} is full", self.id))
                }
                mpsc::error::TrySendError::Closed(_) => {
                    TunnelError::ConnectionClosed(self.id.clone())
                }
            })
    }

    /// Send a request to the client and wait for its response.
    ///
    /// The `request_id` is assigned here. Callers bound the wait with their
    /// own timeout; dropping the future forgets the pending entry.
    /// A request that would not fit in one frame fails with
    /// [`TunnelError::FrameTooLarge`] before anything is queued.
    pub async fn forward(&self, mut request: RequestFrame) -> Result<ResponseFrame> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        request.request_id = id;
        let frame = Frame::Request(Box::new(request));
        let size = encoded_len(&frame).map_err(|e| TunnelError::Serialization(e.to_string()))?;
        if size > self.max_frame_size {
            return Err(TunnelError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        match self.call(id, frame).await? {
            Reply::Response(response) => Ok(response),
            Reply::Probe { .. } => Err(TunnelError::Protocol(format!(
                "probe result delivered for request {id}"
            ))),
        }
    }

    /// Ask the client whether its local service accepts connections
    pub async fn probe(&self) -> Result<std::result::Result<(), String>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.call(id, Frame::Probe { probe_id: id }).await? {
            Reply::Probe {
                reachable: true, ..
            } => Ok(Ok(())),
            Reply::Probe { error, .. } => {
                Ok(Err(error.unwrap_or_else(|| "local service unreachable".into())))
            }
            Reply::Response(_) => Err(TunnelError::Protocol(format!(
                "response delivered for probe {id}"
            ))),
        }
    }

    async fn call(&self, id: u64, frame: Frame) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        // close() may have drained the table before our insert landed
        if self.is_closed() {
            return Err(TunnelError::ConnectionClosed(self.id.clone()));
        }

        self.send(frame).await?;
        rx.await
            .map_err(|_| TunnelError::ConnectionClosed(self.id.clone()))
    }

    /// Hand a client reply to its waiter.
    ///
    /// Returns false when nobody is waiting (unknown id or caller gave up).
    pub fn complete(&self, id: u64, reply: Reply) -> bool {
        match self.pending.remove(&id) {
            Some((_, waiter)) => waiter.send(reply).is_ok(),
            None => {
                debug!("No waiter for reply {} on {}", id, self.id);
                false
            }
        }
    }

    /// Mark closed and fail every pending waiter
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the senders wakes every waiter with a closed error
        self.pending.clear();
    }
}
