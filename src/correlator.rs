//! Request/response correlation for one connection.
//!
//! Each connection gets exactly one background read loop that decodes frames
//! and completes waiting callers:
//!
//! ```text
//!   caller ── submit ──► pending table ──► encode ──► TransportWriter
//!                            ▲
//!   caller ◄── wait ── oneshot slot ◄── dispatch ◄── Framer ◄── TransportReader
//!                                          │
//!                                          └──► NotificationRouter
//! ```
//!
//! With Content-Length framing every request carries an id and many may be
//! outstanding. With greedy framing there is no id on the wire, so only one
//! request may be outstanding; a second submission fails fast with
//! `LinkError::Concurrency` instead of being silently queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::error::{LinkError, Result};
use crate::framing::{Framer, Framing};
use crate::message::{Message, MessageKind, RequestId};
use crate::notify::{Notification, NotificationRouter};
use crate::transport::{TransportReader, TransportWriter};

type Completion = Result<Message>;

enum Waiter {
    /// A caller is waiting on the slot.
    Active(oneshot::Sender<Completion>),
    /// The caller gave up; the next reply for this id is discarded.
    Abandoned,
}

#[derive(Debug, Clone)]
enum CloseReason {
    Local,
    PeerClosed,
    Transport(String),
    Frame(String),
}

impl CloseReason {
    fn from_error(err: &LinkError) -> Self {
        match err {
            LinkError::Frame(message) => CloseReason::Frame(message.clone()),
            LinkError::Transport(message) => CloseReason::Transport(message.clone()),
            other => CloseReason::Transport(other.to_string()),
        }
    }

    fn to_error(&self) -> LinkError {
        match self {
            CloseReason::Local => LinkError::Transport("Connection closed locally".to_string()),
            CloseReason::PeerClosed => {
                LinkError::Transport("Connection closed by peer".to_string())
            }
            CloseReason::Transport(message) => LinkError::Transport(message.clone()),
            CloseReason::Frame(message) => LinkError::Frame(message.clone()),
        }
    }
}

struct PendingTable {
    waiters: HashMap<RequestId, Waiter>,
    next_id: u64,
    closed: Option<CloseReason>,
}

impl PendingTable {
    /// Next unused id, monotonic per connection, never 0.
    fn allocate_id(&mut self) -> RequestId {
        loop {
            let id = RequestId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.waiters.contains_key(&id) {
                return id;
            }
        }
    }
}

struct Shared {
    framing: Framing,
    table: Mutex<PendingTable>,
    writer: AsyncMutex<TransportWriter>,
    router: Arc<NotificationRouter>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self) -> Result<(RequestId, oneshot::Receiver<Completion>)> {
        let mut table = self.table();
        if table.closed.is_some() {
            return Err(LinkError::ConnectionClosed);
        }

        let id = if self.framing.multiplexed() {
            table.allocate_id()
        } else if table.waiters.is_empty() {
            RequestId::UNFRAMED
        } else {
            return Err(LinkError::Concurrency);
        };

        let (tx, rx) = oneshot::channel();
        table.waiters.insert(id, Waiter::Active(tx));
        Ok((id, rx))
    }

    fn forget(&self, id: RequestId) {
        self.table().waiters.remove(&id);
    }

    /// Give up on `id`. A single-request connection keeps the slot occupied
    /// until the late reply shows up.
    fn abandon(&self, id: RequestId) {
        let mut table = self.table();
        if self.framing.multiplexed() {
            table.waiters.remove(&id);
        } else if let Some(waiter) = table.waiters.get_mut(&id) {
            *waiter = Waiter::Abandoned;
        }
    }

    fn dispatch(&self, message: Message) {
        let id = message.id();
        match message {
            Message::Response { .. } => self.complete(id, message),
            Message::Notification { method, params } => {
                trace!("Routing notification {}", method);
                self.router.route(&Notification { method, params });
            }
            Message::Request { method, .. } => {
                warn!("Ignoring host-initiated request: {}", method);
            }
        }
    }

    fn complete(&self, id: Option<RequestId>, message: Message) {
        let key = if self.framing.multiplexed() {
            id
        } else {
            Some(RequestId::UNFRAMED)
        };
        let Some(key) = key else {
            warn!("Dropping response without a usable id");
            return;
        };

        let waiter = self.table().waiters.remove(&key);
        match waiter {
            Some(Waiter::Active(tx)) => {
                if tx.send(Ok(message)).is_err() {
                    debug!(id = %key, "Caller stopped waiting; reply dropped");
                }
            }
            Some(Waiter::Abandoned) => {
                warn!(id = %key, "Discarding late reply for a timed-out request");
            }
            None => {
                warn!(id = %key, "Dropping reply with no pending request");
            }
        }
    }

    /// Fail every pending request and refuse new ones. Runs at most once;
    /// returns false if the connection was already torn down.
    fn shutdown(&self, reason: CloseReason) -> bool {
        let waiters = {
            let mut table = self.table();
            if table.closed.is_some() {
                return false;
            }
            table.closed = Some(reason.clone());
            std::mem::take(&mut table.waiters)
        };

        match &reason {
            CloseReason::Local | CloseReason::PeerClosed => {
                debug!(pending = waiters.len(), "Connection torn down: {:?}", reason)
            }
            _ => error!(pending = waiters.len(), "Connection torn down: {:?}", reason),
        }

        for (_, waiter) in waiters {
            if let Waiter::Active(tx) = waiter {
                let _ = tx.send(Err(reason.to_error()));
            }
        }
        true
    }

    /// Write one encoded frame, bounded by `deadline`.
    async fn write(&self, bytes: &[u8], deadline: Instant, started: Instant) -> Result<()> {
        let mut writer = self.lock_writer(deadline, started).await?;
        self.send_locked(&mut writer, bytes, deadline, started).await
    }

    /// Wait for the write side. Timing out here leaves the stream untouched.
    async fn lock_writer(
        &self,
        deadline: Instant,
        started: Instant,
    ) -> Result<AsyncMutexGuard<'_, TransportWriter>> {
        tokio::time::timeout_at(deadline, self.writer.lock())
            .await
            .map_err(|_| LinkError::Timeout(started.elapsed()))
    }

    /// A write that fails or stalls part-way leaves the stream unframeable,
    /// so both tear the connection down.
    async fn send_locked(
        &self,
        writer: &mut TransportWriter,
        bytes: &[u8],
        deadline: Instant,
        started: Instant,
    ) -> Result<()> {
        match tokio::time::timeout_at(deadline, writer.send(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.shutdown(CloseReason::from_error(&err));
                Err(err)
            }
            Err(_) => {
                self.shutdown(CloseReason::Transport(
                    "Write stalled past the request deadline".to_string(),
                ));
                Err(LinkError::Timeout(started.elapsed()))
            }
        }
    }
}

/// Owns the pending-request table and the read loop of one connection.
pub struct Correlator {
    shared: Arc<Shared>,
    read_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Correlator {
    /// Start correlating over an opened connection. Spawns the read loop.
    pub fn start(
        reader: TransportReader,
        writer: TransportWriter,
        framing: Framing,
        max_frame_size: usize,
        router: Arc<NotificationRouter>,
    ) -> Self {
        let shared = Arc::new(Shared {
            framing,
            table: Mutex::new(PendingTable {
                waiters: HashMap::new(),
                next_id: 1,
                closed: None,
            }),
            writer: AsyncMutex::new(writer),
            router,
        });

        let framer = Framer::new(framing, max_frame_size);
        let handle = tokio::spawn(read_loop(Arc::clone(&shared), reader, framer));

        Self {
            shared,
            read_loop: Mutex::new(Some(handle)),
        }
    }

    pub fn framing(&self) -> Framing {
        self.shared.framing
    }

    pub fn router(&self) -> &Arc<NotificationRouter> {
        &self.shared.router
    }

    /// Send a request and return the handle to await its reply.
    ///
    /// The waiter is recorded before any byte is written, so an immediate
    /// reply cannot race past it.
    ///
    /// # Errors
    ///
    /// - `LinkError::ConnectionClosed` after teardown
    /// - `LinkError::Concurrency` if a greedy connection already has a
    ///   request outstanding
    /// - `LinkError::Transport` / `LinkError::Timeout` if the write fails or
    ///   stalls past the deadline
    pub async fn submit(&self, message: Message, timeout: Duration) -> Result<PendingRequest> {
        let Some(method) = message.method().filter(|_| message.kind() == MessageKind::Request)
        else {
            return Err(LinkError::Protocol(format!(
                "Only requests can be submitted, got a {:?}",
                message.kind()
            )));
        };
        let method = method.to_string();

        let sent_at = Instant::now();
        let deadline = sent_at + timeout;
        let (id, slot) = self.shared.register()?;

        let wire_id = self.shared.framing.multiplexed().then_some(id);
        let bytes = match self.shared.framing.encode(&message.with_id(wire_id)) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.shared.forget(id);
                return Err(err);
            }
        };

        let mut pending = PendingRequest {
            id,
            method,
            sent_at,
            deadline,
            slot,
            shared: Arc::clone(&self.shared),
            finished: false,
        };

        debug!(id = %id, method = %pending.method, bytes = bytes.len(), "Sending request");
        let mut writer = match self.shared.lock_writer(deadline, sent_at).await {
            Ok(writer) => writer,
            Err(err) => {
                // Nothing reached the wire, so no late reply will free the slot.
                pending.finished = true;
                self.shared.forget(id);
                return Err(err);
            }
        };
        self.shared
            .send_locked(&mut writer, &bytes, deadline, sent_at)
            .await?;
        drop(writer);
        Ok(pending)
    }

    /// Submit a request and wait for its reply.
    pub async fn call(&self, message: Message, timeout: Duration) -> Result<Message> {
        self.submit(message, timeout).await?.wait().await
    }

    /// Send a client-to-host notification. No reply is expected.
    pub async fn notify(&self, message: Message, timeout: Duration) -> Result<()> {
        if message.kind() != MessageKind::Notification {
            return Err(LinkError::Protocol(format!(
                "Expected a notification, got a {:?}",
                message.kind()
            )));
        }
        if self.is_closed() {
            return Err(LinkError::ConnectionClosed);
        }

        let bytes = self.shared.framing.encode(&message)?;
        let started = Instant::now();
        self.shared.write(&bytes, started + timeout, started).await
    }

    /// Tear the connection down: fail every pending request with a
    /// transport error, stop the read loop and close the write side.
    ///
    /// Idempotent.
    pub async fn close(&self) {
        self.shared.shutdown(CloseReason::Local);

        let handle = self
            .read_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        self.shared.writer.lock().await.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.table().closed.is_some()
    }

    /// Requests currently occupying a slot, including abandoned ones.
    pub fn outstanding(&self) -> usize {
        self.shared.table().waiters.len()
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.shared.shutdown(CloseReason::Local);
        if let Some(handle) = self
            .read_loop
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// An in-flight request. Await it with [`PendingRequest::wait`].
///
/// Dropping it without waiting abandons the request.
pub struct PendingRequest {
    id: RequestId,
    method: String,
    sent_at: Instant,
    deadline: Instant,
    slot: oneshot::Receiver<Completion>,
    shared: Arc<Shared>,
    finished: bool,
}

impl PendingRequest {
    /// Correlation id; `RequestId::UNFRAMED` on greedy connections.
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the reply, the deadline, or teardown, whichever comes first.
    ///
    /// # Errors
    ///
    /// - `LinkError::Timeout` when the deadline elapses; the request is
    ///   abandoned and a late reply is discarded
    /// - `LinkError::Transport` / `LinkError::Frame` when the connection is
    ///   torn down while waiting
    pub async fn wait(mut self) -> Result<Message> {
        let outcome = tokio::time::timeout_at(self.deadline, &mut self.slot).await;
        self.finished = true;

        match outcome {
            Ok(Ok(completion)) => {
                trace!(
                    id = %self.id,
                    elapsed_ms = self.sent_at.elapsed().as_millis() as u64,
                    "Request completed"
                );
                completion
            }
            Ok(Err(_)) => Err(LinkError::ConnectionClosed),
            Err(_) => {
                self.shared.abandon(self.id);
                // The reply may have landed between the deadline and abandon.
                match self.slot.try_recv() {
                    Ok(completion) => completion,
                    Err(_) => {
                        warn!(id = %self.id, method = %self.method, "Request timed out");
                        Err(LinkError::Timeout(self.deadline - self.sent_at))
                    }
                }
            }
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.abandon(self.id);
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: TransportReader, mut framer: Framer) {
    let reason = loop {
        let chunk = match reader.receive(None).await {
            Ok(chunk) => chunk,
            Err(err) => break CloseReason::from_error(&err),
        };

        if chunk.is_empty() {
            break match framer.finish() {
                Ok(()) => CloseReason::PeerClosed,
                Err(err) => CloseReason::from_error(&err),
            };
        }

        match framer.decode(&chunk) {
            Ok(messages) => {
                for message in messages {
                    shared.dispatch(message);
                }
            }
            Err(err) => {
                error!("Unrecoverable framing error: {}", err);
                break CloseReason::from_error(&err);
            }
        }
    };

    shared.shutdown(reason);
}
