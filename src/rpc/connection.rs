//! Multiplexes correlated calls and peer-initiated requests over one
//! transport.
//!
//! Call IDs carry their origin in the low bit. The side in [`Role::Initiator`]
//! numbers its own calls 1, 3, 5, ... and the side in [`Role::Acceptor`]
//! numbers its own 2, 4, 6, ..., so both ends allocate IDs without a
//! handshake. An inbound frame whose ID has this side's parity is a response
//! to one of our calls; any other ID is a request from the peer and goes to
//! the [`Listener`]. Replies reuse the request's ID.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::rpc::envelope::{Envelope, Frame, CALL_ID_WRAP};
use crate::rpc::error::{Result, RpcError};
use crate::rpc::proxy::Proxy;
use crate::rpc::reassembler::Reassembler;
use crate::rpc::transport::{Transport, TransportReader, TransportWriter};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Role {
    /// Own calls use odd IDs.
    #[default]
    Initiator,
    /// Own calls use even IDs.
    Acceptor,
}

impl Role {
    pub fn first_call_id(self) -> u32 {
        match self {
            Role::Initiator => 1,
            Role::Acceptor => 2,
        }
    }

    /// Whether `call_id` was allocated by this side.
    pub fn issued(self, call_id: u32) -> bool {
        call_id % 2 == self.first_call_id() % 2
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    pub role: Role,
    /// Calls not answered this long after they start, counting the time
    /// spent writing the request, fail with [`RpcError::Timeout`]. `None`
    /// waits forever.
    pub call_timeout: Option<Duration>,
    pub max_frame_len: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            role: Role::Initiator,
            call_timeout: None,
            max_frame_len: u32::MAX,
        }
    }
}

/// Answers calls the peer initiates. Returning `Ok(None)` sends nothing
/// back; an error is logged and likewise sends nothing.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    async fn on_call(&self, frame: Frame) -> anyhow::Result<Option<Vec<u8>>>;
}

#[async_trait]
impl<F, Fut> Listener for F
where
    F: Fn(Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Vec<u8>>>> + Send + 'static,
{
    async fn on_call(&self, frame: Frame) -> anyhow::Result<Option<Vec<u8>>> {
        (self)(frame).await
    }
}

/// Boxes a closure as a shareable listener.
pub fn listener_fn<F, Fut>(f: F) -> Arc<dyn Listener>
where
    F: Fn(Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Vec<u8>>>> + Send + 'static,
{
    Arc::new(f)
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type Waiter = oneshot::Sender<Result<Bytes>>;
type CloseHook = Box<dyn FnOnce() + Send>;

enum CloseReason {
    Released,
    PeerClosed,
    ReadFailed(std::io::Error),
    Protocol(String),
    /// A call's deadline hit while its frame was half written.
    WriteStalled,
}

impl CloseReason {
    fn to_error(&self) -> RpcError {
        match self {
            CloseReason::Protocol(msg) => RpcError::ProtocolViolation(msg.clone()),
            _ => RpcError::ConnectionClosed,
        }
    }
}

struct Shared {
    id: u64,
    label: String,
    options: ConnectionOptions,
    listener: Option<Arc<dyn Listener>>,
    writer: tokio::sync::Mutex<Option<Box<dyn TransportWriter>>>,
    pending: Mutex<HashMap<u32, Waiter>>,
    next_call_id: Mutex<u32>,
    ref_count: Mutex<usize>,
    released: AtomicBool,
    closed: AtomicBool,
    // Set once teardown starts. In-flight writes give up and the reader task
    // exits when it flips.
    closing: watch::Sender<bool>,
    close_reason: Mutex<Option<CloseReason>>,
    done: watch::Sender<bool>,
    close_hooks: Mutex<Option<Vec<CloseHook>>>,
}

/// A live multiplexed channel. Cloning yields another handle to the same
/// connection; sharing between call sites goes through [`Proxy`] handles,
/// which keep the reference count.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Takes ownership of `transport` and starts its reader task on the
    /// current tokio runtime.
    pub fn open(
        transport: Box<dyn Transport>,
        listener: Option<Arc<dyn Listener>>,
        options: ConnectionOptions,
    ) -> Self {
        let label = transport.describe();
        let (reader, writer) = transport.split();
        let (closing, _) = watch::channel(false);
        let (done, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            label,
            next_call_id: Mutex::new(options.role.first_call_id()),
            options,
            listener,
            writer: tokio::sync::Mutex::new(Some(writer)),
            pending: Mutex::new(HashMap::new()),
            ref_count: Mutex::new(0),
            released: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closing,
            close_reason: Mutex::new(None),
            done,
            close_hooks: Mutex::new(Some(Vec::new())),
        });

        debug!(connection = %shared.label, role = ?shared.options.role, "connection opened");
        tokio::spawn(run_reader(Arc::clone(&shared), reader));

        Connection { shared }
    }

    /// Process-unique identifier.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn ref_count(&self) -> usize {
        *self.shared.ref_count.lock()
    }

    pub fn pending_calls(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn same_connection(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// New handle on a connection this crate has just opened, before any
    /// proxy could have released it.
    pub(crate) fn create_proxy(&self) -> Proxy {
        *self.shared.ref_count.lock() += 1;
        Proxy::new(self.clone())
    }

    /// New handle sharing this connection. Refuses once the last proxy has
    /// been released or the transport is gone.
    pub fn try_create_proxy(&self) -> Option<Proxy> {
        let mut count = self.shared.ref_count.lock();
        if self.shared.released.load(Ordering::SeqCst) || self.is_closed() {
            return None;
        }
        *count += 1;
        Some(Proxy::new(self.clone()))
    }

    /// Runs `hook` once after the transport has been torn down, or right
    /// away if that already happened.
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut hooks = self.shared.close_hooks.lock();
        if let Some(hooks) = hooks.as_mut() {
            hooks.push(Box::new(hook));
            return;
        }
        drop(hooks);
        hook();
    }

    /// Resolves once the transport is torn down.
    pub async fn closed(&self) {
        let mut done = self.shared.done.subscribe();
        // The sender lives in `shared`, so this only errors if it is gone.
        let _ = done.wait_for(|closed| *closed).await;
    }

    /// Removes a pending call and settles it with [`RpcError::Cancelled`].
    /// Returns false if no such call is outstanding.
    pub fn cancel(&self, call_id: u32) -> bool {
        match self.shared.pending.lock().remove(&call_id) {
            Some(waiter) => {
                let _ = waiter.send(Err(RpcError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Drops one proxy's share. The last release shuts the reader task
    /// down, which closes the transport.
    pub(crate) fn release(&self) -> bool {
        let mut count = self.shared.ref_count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.shared.released.store(true, Ordering::SeqCst);
            drop(count);
            self.shared.begin_shutdown(CloseReason::Released);
            return true;
        }
        false
    }

    /// Sends `payload` as a new call. The response waiter is registered
    /// before the frame is written, and the call timeout starts before the
    /// write too.
    pub(crate) async fn begin_call(&self, payload: &[u8]) -> Result<PendingCall> {
        let deadline = Deadline::start(self.shared.options.call_timeout);
        let (tx, rx) = oneshot::channel();
        let call_id = {
            let mut pending = self.shared.pending.lock();
            if self.shared.closed.load(Ordering::SeqCst) || *self.shared.closing.borrow() {
                return Err(RpcError::ConnectionClosed);
            }
            let call_id = self.shared.allocate_call_id();
            pending.insert(call_id, tx);
            call_id
        };

        let call = PendingCall {
            call_id,
            rx,
            shared: Arc::clone(&self.shared),
            deadline,
        };

        trace!(connection = %self.shared.label, call_id, len = payload.len(), "sending call");
        self.shared.send_frame(call_id, payload, deadline).await?;
        Ok(call)
    }
}

/// When a call started and how long it may take.
#[derive(Clone, Copy, Debug)]
struct Deadline {
    at: Instant,
    limit: Duration,
}

impl Deadline {
    fn start(limit: Option<Duration>) -> Option<Self> {
        limit.map(|limit| Deadline {
            at: Instant::now() + limit,
            limit,
        })
    }
}

async fn within<F: Future>(deadline: Option<Deadline>, fut: F) -> Result<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline.at, fut)
            .await
            .map_err(|_| RpcError::Timeout(deadline.limit)),
        None => Ok(fut.await),
    }
}

impl Shared {
    fn allocate_call_id(&self) -> u32 {
        let mut next = self.next_call_id.lock();
        let call_id = *next;
        *next = call_id + 2;
        if *next >= CALL_ID_WRAP {
            *next = self.options.role.first_call_id();
        }
        call_id
    }

    /// Writes envelope then payload while holding the writer, so frames
    /// from concurrent senders never interleave.
    ///
    /// Gives up with [`RpcError::ConnectionClosed`] as soon as teardown
    /// starts, releasing the writer for `finish`. Missing `deadline` while
    /// bytes are going out tears the connection down, since the peer can
    /// no longer find the next envelope.
    async fn send_frame(
        &self,
        call_id: u32,
        payload: &[u8],
        deadline: Option<Deadline>,
    ) -> Result<()> {
        let envelope = Envelope::for_payload(call_id, payload.len())?;
        let mut closing = self.closing.subscribe();

        let write = async {
            let mut writer = within(deadline, self.writer.lock()).await?;
            let writer = writer.as_mut().ok_or(RpcError::ConnectionClosed)?;
            let written = within(deadline, async {
                writer.write(&envelope.to_bytes()).await?;
                writer.write(payload).await?;
                writer.flush().await?;
                Ok::<(), std::io::Error>(())
            })
            .await;
            if written.is_err() {
                self.begin_shutdown(CloseReason::WriteStalled);
            }
            Ok::<(), RpcError>(written??)
        };

        tokio::select! {
            written = write => written,
            _ = closing.wait_for(|closing| *closing) => Err(RpcError::ConnectionClosed),
        }
    }

    /// Asks the reader task to tear the connection down. The first reason
    /// recorded wins.
    fn begin_shutdown(&self, reason: CloseReason) {
        self.close_reason.lock().get_or_insert(reason);
        self.closing.send_replace(true);
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) {
        if self.options.role.issued(frame.call_id) {
            match self.pending.lock().remove(&frame.call_id) {
                Some(waiter) => {
                    trace!(connection = %self.label, call_id = frame.call_id, "response matched");
                    let _ = waiter.send(Ok(frame.payload));
                }
                None => {
                    warn!(
                        connection = %self.label,
                        call_id = frame.call_id,
                        "dropping response with no pending call"
                    );
                }
            }
            return;
        }

        let Some(listener) = self.listener.clone() else {
            debug!(
                connection = %self.label,
                call_id = frame.call_id,
                "no listener for peer call, ignoring"
            );
            return;
        };

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let call_id = frame.call_id;
            match listener.on_call(frame).await {
                Ok(Some(reply)) => {
                    if let Err(e) = shared.send_frame(call_id, &reply, None).await {
                        warn!(connection = %shared.label, call_id, error = %e, "failed to send reply");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(connection = %shared.label, call_id, error = %e, "listener failed");
                }
            }
        });
    }

    async fn finish(&self, reason: CloseReason) {
        match &reason {
            CloseReason::Released => debug!(connection = %self.label, "last proxy released"),
            CloseReason::PeerClosed => info!(connection = %self.label, "peer closed connection"),
            CloseReason::ReadFailed(e) => {
                warn!(connection = %self.label, error = %e, "transport read failed")
            }
            CloseReason::Protocol(msg) => {
                error!(connection = %self.label, "protocol violation: {}", msg)
            }
            CloseReason::WriteStalled => {
                warn!(connection = %self.label, "call timed out mid-write, dropping connection")
            }
        }

        // Writers blocked on a peer that stopped reading bail out here, so
        // the writer lock below is never held for long.
        self.closing.send_replace(true);

        let waiters: Vec<Waiter> = {
            let mut pending = self.pending.lock();
            self.closed.store(true, Ordering::SeqCst);
            pending.drain().map(|(_, waiter)| waiter).collect()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(reason.to_error()));
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.close().await {
                debug!(connection = %self.label, error = %e, "error closing transport");
            }
        }

        let hooks = self.close_hooks.lock().take().unwrap_or_default();
        for hook in hooks {
            hook();
        }

        self.done.send_replace(true);
    }
}

async fn run_reader(shared: Arc<Shared>, mut reader: Box<dyn TransportReader>) {
    let mut reassembler = Reassembler::new(shared.options.max_frame_len);
    let mut closing = shared.closing.subscribe();

    let reason = loop {
        let chunk = tokio::select! {
            _ = closing.wait_for(|closing| *closing) => {
                break shared.close_reason.lock().take().unwrap_or(CloseReason::Released)
            }
            chunk = reader.read_chunk() => chunk,
        };

        match chunk {
            Ok(Some(bytes)) => {
                if let Err(e) = reassembler.push(bytes, |frame| shared.dispatch(frame)) {
                    let msg = match e {
                        RpcError::ProtocolViolation(msg) => msg,
                        other => other.to_string(),
                    };
                    break CloseReason::Protocol(msg);
                }
            }
            Ok(None) => break CloseReason::PeerClosed,
            Err(e) => break CloseReason::ReadFailed(e),
        }
    };

    shared.finish(reason).await;
}

/// An issued call awaiting its response. Dropping it abandons the call and
/// frees its slot in the pending table.
pub struct PendingCall {
    call_id: u32,
    rx: oneshot::Receiver<Result<Bytes>>,
    shared: Arc<Shared>,
    deadline: Option<Deadline>,
}

impl PendingCall {
    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    /// Waits for the response until the call's deadline, which began
    /// before its request was written.
    pub async fn response(mut self) -> Result<Bytes> {
        let received = within(self.deadline, &mut self.rx).await?;
        received.unwrap_or(Err(RpcError::ConnectionClosed))
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.call_id);
    }
}
