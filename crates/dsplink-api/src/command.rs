//! Command channel: one persistent TCP connection per device.
//!
//! Callers submit [`Command`]s from any task. A single supervisor task
//! owns the socket, writes queued requests in order, correlates responses
//! by request id, forwards unsolicited notifications to the device's
//! [`Dispatcher`], and reconnects with exponential backoff when the
//! connection drops.
//!
//! ```text
//!   send() ──► bounded queue ──► supervisor ──► socket
//!     ▲                              │
//!     └──── oneshot ◄── pending ◄────┘ (response by id)
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{DEFAULT_MAX_RECORD_LEN, DEFAULT_TERMINATOR, Inbound, RecordCodec, Request};
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::reconnect::{ReconnectConfig, calculate_backoff};
use crate::types::{DeviceAddress, Method, ParamRef, ParamValue, SampleSource, ValueFormat};

// ── ChannelConfig ────────────────────────────────────────────────────

/// Tuning for a single command channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Deadline for one request, measured from submission. Default: 5s.
    pub request_timeout: Duration,
    /// Deadline for establishing the TCP connection. Default: 5s.
    pub connect_timeout: Duration,
    /// Requests allowed to wait for the connection before `send` fails
    /// fast with [`Error::Overloaded`]. Default: 50.
    pub max_queue_depth: usize,
    /// Requests written but not yet answered. Default: 8.
    pub max_in_flight: usize,
    /// Record terminator. Default: `\n`.
    pub terminator: Vec<u8>,
    /// Longest record accepted from the device. Default: 64 KiB.
    pub max_record_len: usize,
    pub reconnect: ReconnectConfig,
    /// Sent in an `auth` request right after connecting, when set.
    pub password: Option<SecretString>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            max_queue_depth: 50,
            max_in_flight: 8,
            terminator: DEFAULT_TERMINATOR.to_vec(),
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            reconnect: ReconnectConfig::default(),
            password: None,
        }
    }
}

impl ChannelConfig {
    pub fn codec(&self) -> RecordCodec {
        RecordCodec::new(&self.terminator, self.max_record_len)
    }
}

// ── ChannelState / ChannelStatus ─────────────────────────────────────

/// Lifecycle of a command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChannelState {
    /// Not opened yet, or parked after exhausting reconnect attempts.
    Disconnected,
    Connecting,
    Ready,
    /// `close()` in progress.
    Draining,
    Closed,
}

/// Observable snapshot of a channel's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub state: ChannelState,
    /// Connection attempts finished so far, successful or not.
    pub attempts: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub changed_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl ChannelStatus {
    fn initial() -> Self {
        Self {
            state: ChannelState::Disconnected,
            attempts: 0,
            consecutive_failures: 0,
            last_error: None,
            changed_at: Utc::now(),
            connected_at: None,
            disconnected_at: None,
        }
    }
}

// ── Command ──────────────────────────────────────────────────────────

/// A caller-level request, before an id is assigned.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get { param: ParamRef },
    Set { param: ParamRef, value: ParamValue },
    Subscribe { param: ParamRef, format: ValueFormat },
    Unsubscribe { param: ParamRef, format: ValueFormat },
}

impl Command {
    pub fn into_request(self, id: u64) -> Request {
        match self {
            Self::Get { param } => Request::get(id, &param),
            Self::Set { param, value } => Request::set(id, &param, value),
            Self::Subscribe { param, format } => Request::subscribe(id, &param, format),
            Self::Unsubscribe { param, format } => Request::unsubscribe(id, &param, format),
        }
    }
}

type Reply = oneshot::Sender<Result<ParamValue, Error>>;

struct QueuedRequest {
    request: Request,
    reply: Reply,
}

struct PendingRequest {
    method: Method,
    param: String,
    sent_at: Instant,
    reply: Reply,
}

enum SessionEnd {
    Cancelled,
    /// `healthy` is set once the device answered at least one request.
    Lost { error: Error, healthy: bool },
}

// ── CommandChannel ───────────────────────────────────────────────────

/// Handle to a device's command connection.
///
/// Cheaply cloneable via `Arc<ChannelInner>`. Nothing connects until
/// [`open`](Self::open) is called; [`close`](Self::close) tears the
/// connection down and fails all outstanding work.
#[derive(Clone)]
pub struct CommandChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    address: DeviceAddress,
    config: ChannelConfig,
    dispatcher: Arc<Dispatcher>,
    queue_tx: mpsc::Sender<QueuedRequest>,
    queue_rx: Mutex<Option<mpsc::Receiver<QueuedRequest>>>,
    pending: DashMap<u64, PendingRequest>,
    next_id: AtomicU64,
    status: watch::Sender<ChannelStatus>,
    /// Wakes a channel parked in `Disconnected`.
    wake: Notify,
    /// Signalled when a timed-out request frees an in-flight slot.
    slot_freed: Notify,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

impl CommandChannel {
    pub fn new(address: DeviceAddress, config: ChannelConfig, dispatcher: Arc<Dispatcher>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.max_queue_depth.max(1));
        let (status, _) = watch::channel(ChannelStatus::initial());

        Self {
            inner: Arc::new(ChannelInner {
                address,
                config,
                dispatcher,
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                pending: DashMap::new(),
                next_id: AtomicU64::new(1),
                status,
                wake: Notify::new(),
                slot_freed: Notify::new(),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.inner.address
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Spawn the supervisor task. Returns immediately; the first
    /// connection attempt happens in the background. Calling `open` on an
    /// already open channel is a no-op.
    pub async fn open(&self) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }
        let Some(queue) = self.inner.queue_rx.lock().await.take() else {
            return Ok(());
        };

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(supervise(inner, queue));
        *self.inner.task.lock().await = Some(handle);
        Ok(())
    }

    /// Wait until the first connection attempt has finished and return
    /// the resulting status.
    pub async fn wait_initial_attempt(&self) -> ChannelStatus {
        let mut rx = self.inner.status.subscribe();
        match rx
            .wait_for(|s| s.attempts > 0 || matches!(s.state, ChannelState::Draining | ChannelState::Closed))
            .await
        {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        }
    }

    /// Close the channel: stop reconnecting, drop the socket, and fail
    /// every queued or in-flight request with [`Error::ChannelLost`].
    /// Later calls wait for the first one to finish.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            let mut rx = self.inner.status.subscribe();
            let _ = rx.wait_for(|s| s.state == ChannelState::Closed).await;
            return;
        }

        debug!(device = %self.inner.address, "closing command channel");
        self.inner.set_state(ChannelState::Draining);
        self.inner.cancel.cancel();

        let handle = self.inner.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(device = %self.inner.address, error = %e, "command supervisor ended abnormally");
            }
        }
        // Never opened: the receiver is still parked here.
        if let Some(mut queue) = self.inner.queue_rx.lock().await.take() {
            drain_queue(&mut queue);
        }
        self.inner.fail_pending(|| Error::ChannelLost);

        self.inner.status.send_modify(|s| {
            s.state = ChannelState::Closed;
            s.changed_at = Utc::now();
            s.disconnected_at.get_or_insert_with(Utc::now);
        });
        info!(device = %self.inner.address, "command channel closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // ── Status ───────────────────────────────────────────────────

    pub fn status(&self) -> ChannelStatus {
        self.inner.status.borrow().clone()
    }

    pub fn state(&self) -> ChannelState {
        self.inner.status.borrow().state
    }

    /// Subscribe to status changes.
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status.subscribe()
    }

    /// Requests written to the socket and still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    // ── Requests ─────────────────────────────────────────────────

    /// Submit a command and wait for its response.
    ///
    /// Waits while the channel is connecting, up to the request timeout.
    /// Fails fast with [`Error::Overloaded`] when the wait queue is full.
    pub async fn send(&self, command: Command) -> Result<ParamValue, Error> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let request = command.into_request(id);
        let (reply, response) = oneshot::channel();

        match inner.queue_tx.try_send(QueuedRequest { request, reply }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(device = %inner.address, "command queue full");
                return Err(Error::Overloaded {
                    depth: inner.config.max_queue_depth,
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(Error::ChannelClosed),
        }
        inner.wake.notify_waiters();

        // The receiver must be dropped before the pending entry is removed.
        let outcome = tokio::time::timeout(inner.config.request_timeout, response).await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ChannelLost),
            Err(_) => {
                if inner.pending.remove(&id).is_some() {
                    inner.slot_freed.notify_one();
                }
                debug!(device = %inner.address, id, "request timed out");
                Err(Error::Timeout {
                    timeout_ms: millis(inner.config.request_timeout),
                })
            }
        }
    }

    pub async fn get(&self, param: &ParamRef) -> Result<ParamValue, Error> {
        self.send(Command::Get { param: param.clone() }).await
    }

    pub async fn set(&self, param: &ParamRef, value: ParamValue) -> Result<ParamValue, Error> {
        self.send(Command::Set {
            param: param.clone(),
            value,
        })
        .await
    }

    pub async fn subscribe(&self, param: &ParamRef, format: ValueFormat) -> Result<ParamValue, Error> {
        self.send(Command::Subscribe {
            param: param.clone(),
            format,
        })
        .await
    }

    pub async fn unsubscribe(&self, param: &ParamRef, format: ValueFormat) -> Result<ParamValue, Error> {
        self.send(Command::Unsubscribe {
            param: param.clone(),
            format,
        })
        .await
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn drain_queue(queue: &mut mpsc::Receiver<QueuedRequest>) {
    queue.close();
    while let Ok(queued) = queue.try_recv() {
        let _ = queued.reply.send(Err(Error::ChannelLost));
    }
}

// ── ChannelInner helpers ─────────────────────────────────────────────

impl ChannelInner {
    fn set_state(&self, state: ChannelState) {
        self.status.send_if_modified(|s| {
            if s.state == state {
                return false;
            }
            s.state = state;
            s.changed_at = Utc::now();
            true
        });
    }

    fn record_connected(&self) {
        self.status.send_modify(|s| {
            let now = Utc::now();
            s.state = ChannelState::Ready;
            s.attempts += 1;
            s.last_error = None;
            s.changed_at = now;
            s.connected_at = Some(now);
        });
    }

    /// The device answered a request; earlier failures no longer count.
    fn record_healthy(&self) {
        self.status.send_if_modified(|s| std::mem::replace(&mut s.consecutive_failures, 0) != 0);
    }

    fn record_failure(&self, error: &Error, failures: u32) {
        self.status.send_modify(|s| {
            s.attempts += 1;
            s.consecutive_failures = failures;
            s.last_error = Some(error.to_string());
            s.changed_at = Utc::now();
        });
    }

    fn record_lost(&self, error: &Error, failures: u32) {
        self.status.send_modify(|s| {
            let now = Utc::now();
            s.state = ChannelState::Connecting;
            s.consecutive_failures = failures;
            s.last_error = Some(error.to_string());
            s.changed_at = now;
            s.disconnected_at = Some(now);
        });
    }

    /// Resolve every in-flight request with an error built by `make`.
    fn fail_pending(&self, make: impl Fn() -> Error) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        let mut failed = 0_usize;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.reply.send(Err(make()));
                failed += 1;
            }
        }
        if failed > 0 {
            debug!(device = %self.address, failed, "failed in-flight requests");
        }
    }

    /// Move a dequeued request into the pending table. Returns `None` when
    /// its caller has already given up.
    fn admit(&self, queued: QueuedRequest) -> Option<Request> {
        let QueuedRequest { request, reply } = queued;
        let id = request.id;
        if reply.is_closed() {
            trace!(device = %self.address, id, "skipping request abandoned while queued");
            return None;
        }
        self.pending.insert(id, PendingRequest {
            method: request.method,
            param: request.params.param.clone(),
            sent_at: Instant::now(),
            reply,
        });
        // A caller that timed out before the insert found nothing to remove.
        if self.pending.remove_if(&id, |_, p| p.reply.is_closed()).is_some() {
            trace!(device = %self.address, id, "skipping request abandoned while queued");
            return None;
        }
        Some(request)
    }

    /// Route one inbound record. Returns `true` for a response.
    fn handle_inbound(&self, inbound: Inbound) -> bool {
        match inbound {
            Inbound::Response(response) => {
                let Some((_, pending)) = self.pending.remove(&response.id) else {
                    debug!(device = %self.address, id = response.id, "response for unknown or expired request");
                    return true;
                };
                trace!(
                    device = %self.address,
                    id = response.id,
                    method = %pending.method,
                    param = %pending.param,
                    elapsed_ms = millis(pending.sent_at.elapsed()),
                    "response"
                );
                let result = response.outcome.map_err(|message| Error::Device { message });
                let _ = pending.reply.send(result);
                true
            }
            Inbound::Notification(notification) => {
                self.dispatcher
                    .dispatch(&notification.into_sample(SampleSource::Notification));
                false
            }
            Inbound::Malformed(malformed) => {
                warn!(
                    device = %self.address,
                    reason = %malformed.reason,
                    raw = %malformed.raw,
                    "discarding malformed record"
                );
                let Some((_, pending)) = malformed.id.and_then(|id| self.pending.remove(&id)) else {
                    return false;
                };
                let _ = pending.reply.send(Err(malformed.to_error()));
                true
            }
        }
    }
}

// ── Supervisor ───────────────────────────────────────────────────────

type Connection = Framed<TcpStream, RecordCodec>;

/// Main loop: connect → serve → on loss, back off and reconnect.
///
/// A session that drops before the device answered anything counts as a
/// failed attempt, so a device that accepts and immediately closes is
/// retried on the same backoff schedule as one that refuses.
async fn supervise(inner: Arc<ChannelInner>, mut queue: mpsc::Receiver<QueuedRequest>) {
    let reconnect = inner.config.reconnect.clone();
    let mut failures: u32 = 0;

    loop {
        inner.set_state(ChannelState::Connecting);

        let connected = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            result = connect(&inner) => result,
        };

        match connected {
            Ok(connection) => {
                inner.record_connected();
                info!(device = %inner.address, "command channel ready");

                let started = Instant::now();
                match run_session(&inner, connection, &mut queue).await {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Lost { error, healthy } => {
                        warn!(device = %inner.address, error = %error, "command connection lost");
                        inner.fail_pending(|| Error::ChannelLost);
                        if healthy || started.elapsed() >= reconnect.max_delay {
                            failures = 0;
                        }
                        failures = failures.saturating_add(1);
                        inner.record_lost(&error, failures);
                    }
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                inner.record_failure(&e, failures);
                warn!(device = %inner.address, error = %e, failures, "connection attempt failed");
            }
        }

        if reconnect.exhausted(failures) {
            inner.set_state(ChannelState::Disconnected);
            info!(
                device = %inner.address,
                sleep_secs = reconnect.long_sleep.as_secs(),
                "reconnect attempts exhausted, parking until woken"
            );
            tokio::select! {
                biased;
                () = inner.cancel.cancelled() => break,
                () = inner.wake.notified() => debug!(device = %inner.address, "woken by new request"),
                () = tokio::time::sleep(reconnect.long_sleep) => {}
            }
            failures = 0;
        } else {
            let delay = calculate_backoff(failures.saturating_sub(1), &reconnect);
            debug!(device = %inner.address, delay_ms = millis(delay), failures, "waiting before reconnect");
            tokio::select! {
                biased;
                () = inner.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    drain_queue(&mut queue);
    inner.fail_pending(|| Error::ChannelLost);
    debug!(device = %inner.address, "command supervisor exiting");
}

async fn connect(inner: &ChannelInner) -> Result<Connection, Error> {
    let endpoint = inner.address.command_endpoint();
    debug!(device = %inner.address, %endpoint, "connecting");

    let stream = tokio::time::timeout(inner.config.connect_timeout, TcpStream::connect(&endpoint))
        .await
        .map_err(|_| Error::connection(&endpoint, "connect timed out"))?
        .map_err(|e| Error::connection(&endpoint, e))?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(device = %inner.address, error = %e, "could not disable Nagle");
    }

    let mut connection = Framed::new(stream, inner.config.codec());
    if let Some(ref password) = inner.config.password {
        authenticate(inner, &mut connection, password).await?;
    }
    Ok(connection)
}

/// Send the `auth` request and wait for its answer before any queued
/// request goes out. Notifications that arrive meanwhile are dispatched.
async fn authenticate(inner: &ChannelInner, connection: &mut Connection, password: &SecretString) -> Result<(), Error> {
    let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
    connection.send(Request::auth(id, password.expose_secret())).await?;

    match tokio::time::timeout(inner.config.request_timeout, await_auth_response(inner, connection, id)).await {
        Ok(Ok(())) => {
            debug!(device = %inner.address, "authenticated");
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::connection(
            inner.address.command_endpoint(),
            "authentication timed out",
        )),
    }
}

async fn await_auth_response(inner: &ChannelInner, connection: &mut Connection, id: u64) -> Result<(), Error> {
    while let Some(frame) = connection.next().await {
        match frame? {
            Inbound::Response(response) if response.id == id => {
                return response
                    .outcome
                    .map(|_| ())
                    .map_err(|message| Error::Authentication { message });
            }
            other => {
                inner.handle_inbound(other);
            }
        }
    }
    Err(Error::connection(
        inner.address.command_endpoint(),
        "connection closed during authentication",
    ))
}

/// Serve one connection until it drops or the channel is cancelled.
async fn run_session(
    inner: &ChannelInner,
    connection: Connection,
    queue: &mut mpsc::Receiver<QueuedRequest>,
) -> SessionEnd {
    let (mut sink, mut stream) = connection.split();
    let max_in_flight = inner.config.max_in_flight.max(1);
    let mut healthy = false;

    loop {
        let has_capacity = inner.pending.len() < max_in_flight;

        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => return SessionEnd::Cancelled,
            frame = stream.next() => match frame {
                Some(Ok(inbound)) => {
                    if inner.handle_inbound(inbound) && !healthy {
                        healthy = true;
                        inner.record_healthy();
                    }
                }
                Some(Err(e)) => return SessionEnd::Lost { error: e.into(), healthy },
                None => {
                    return SessionEnd::Lost {
                        error: Error::connection(inner.address.command_endpoint(), "connection closed by device"),
                        healthy,
                    };
                }
            },
            Some(queued) = queue.recv(), if has_capacity => {
                let Some(request) = inner.admit(queued) else {
                    continue;
                };
                trace!(device = %inner.address, id = request.id, "writing request");
                if let Err(e) = sink.send(request).await {
                    return SessionEnd::Lost { error: e.into(), healthy };
                }
            },
            () = inner.slot_freed.notified() => {},
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn channel(config: ChannelConfig) -> CommandChannel {
        let address = DeviceAddress::with_ports("127.0.0.1", 1, 1);
        let dispatcher = Arc::new(Dispatcher::new(address.clone(), None));
        CommandChannel::new(address, config, dispatcher)
    }

    #[test]
    fn default_channel_config() {
        let config = ChannelConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.max_queue_depth, 50);
        assert_eq!(config.terminator, b"\n");
        assert!(config.password.is_none());
    }

    #[test]
    fn abandoned_requests_never_hold_an_in_flight_slot() {
        let ch = channel(ChannelConfig::default());
        let param = ParamRef::new("SourceGain", 0).unwrap();

        let (reply, live_rx) = oneshot::channel();
        let live = QueuedRequest {
            request: Command::Get { param: param.clone() }.into_request(1),
            reply,
        };
        assert_eq!(ch.inner.admit(live).map(|r| r.id), Some(1));
        assert_eq!(ch.pending_count(), 1);

        let (reply, gone_rx) = oneshot::channel();
        drop(gone_rx);
        let abandoned = QueuedRequest {
            request: Command::Get { param }.into_request(2),
            reply,
        };
        assert!(ch.inner.admit(abandoned).is_none());
        assert_eq!(ch.pending_count(), 1);
        drop(live_rx);
    }

    #[test]
    fn command_carries_method_and_param() {
        let param = ParamRef::new("ZoneGain", 1).unwrap();
        let request = Command::Unsubscribe {
            param,
            format: ValueFormat::Percent,
        }
        .into_request(12);
        assert_eq!(request.id, 12);
        assert_eq!(request.method, Method::Unsubscribe);
        assert_eq!(request.params.param, "ZoneGain_1");
        assert_eq!(request.params.format, Some(ValueFormat::Percent));
    }

    #[tokio::test(start_paused = true)]
    async fn unopened_channel_reports_overload_past_queue_depth() {
        let ch = channel(ChannelConfig {
            max_queue_depth: 2,
            ..ChannelConfig::default()
        });
        let param = ParamRef::new("SourceGain", 0).unwrap();

        let mut first = tokio_test::task::spawn(ch.get(&param));
        let mut second = tokio_test::task::spawn(ch.get(&param));
        tokio_test::assert_pending!(first.poll());
        tokio_test::assert_pending!(second.poll());

        let third = ch.get(&param).await;
        assert!(matches!(third, Err(Error::Overloaded { depth: 2 })), "{third:?}");

        // Queued requests wait out the full request timeout.
        tokio::time::advance(Duration::from_millis(4900)).await;
        tokio_test::assert_pending!(first.poll());

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(matches!(first.await, Err(Error::Timeout { timeout_ms: 5000 })));
        assert!(matches!(second.await, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn closed_channel_rejects_work() {
        let ch = channel(ChannelConfig::default());
        ch.close().await;
        ch.close().await;

        assert_eq!(ch.state(), ChannelState::Closed);
        assert!(matches!(ch.open().await, Err(Error::ChannelClosed)));
        let param = ParamRef::new("SourceGain", 0).unwrap();
        assert!(matches!(ch.get(&param).await, Err(Error::ChannelClosed)));
    }

    #[test]
    fn channel_state_display() {
        assert_eq!(ChannelState::Ready.to_string(), "ready");
        assert_eq!(ChannelState::Disconnected.to_string(), "disconnected");
    }
}
