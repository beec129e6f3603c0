// ── Client registry ──
//
// Process-wide owner of device clients: one client per device address,
// shared by reference count. Releasing never closes a client directly;
// the idle sweep closes clients nobody has used for the idle timeout.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dsplink_api::DeviceAddress;
use futures_util::future::join_all;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ClientContext, DeviceClient};
use crate::config::{DeviceConfig, RegistryConfig};
use crate::error::CoreError;

/// One registry slot. The client is created lazily so concurrent
/// acquirers of a new address all wait on the same connection attempt.
///
/// An entry being swept stays in the map with `closing` set until its
/// client has let go of its sockets; acquirers wait on `closed` and then
/// start a fresh entry.
struct ManagedEntry {
    client: OnceCell<DeviceClient>,
    refs: AtomicUsize,
    last_activity: std::sync::Mutex<Instant>,
    /// Only changed while the map shard is write-locked.
    closing: AtomicBool,
    closed: CancellationToken,
    /// Client this entry replaces, closed before a new one connects.
    predecessor: Option<DeviceClient>,
}

impl ManagedEntry {
    fn new(refs: usize, predecessor: Option<DeviceClient>) -> Self {
        Self {
            client: OnceCell::new(),
            refs: AtomicUsize::new(refs),
            last_activity: std::sync::Mutex::new(Instant::now()),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
            predecessor,
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_since(&self) -> Instant {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Whether the client was closed by one of its holders.
    fn is_dead(&self) -> bool {
        self.client.get().is_some_and(DeviceClient::is_closed)
    }
}

enum Claim {
    /// A reference was taken on this entry.
    Held(Arc<ManagedEntry>),
    /// The entry is being swept; wait for it and try again.
    Closing(Arc<ManagedEntry>),
}

/// Shared registry of device clients.
///
/// Cheaply cloneable via `Arc<RegistryInner>`.
#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: RegistryConfig,
    context: ClientContext,
    entries: DashMap<DeviceAddress, Arc<ManagedEntry>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("config", &self.inner.config)
            .field("entries", &self.inner.entries.len())
            .finish_non_exhaustive()
    }
}

impl ClientRegistry {
    /// Create an empty registry. The idle sweeper starts with the first
    /// [`acquire`](Self::acquire).
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_context(config, ClientContext::default())
    }

    pub fn with_context(config: RegistryConfig, context: ClientContext) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                context,
                entries: DashMap::new(),
                sweeper: Mutex::new(None),
                cancel: CancellationToken::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    // ── Acquire / release ────────────────────────────────────────

    /// Get the shared client for `config.address`, creating it on first use.
    ///
    /// Concurrent calls for the same address make exactly one connection
    /// attempt; all callers wait for its outcome. An unreachable device
    /// still yields a client that keeps reconnecting in the background.
    /// Each successful call must be paired with a [`release`](Self::release).
    pub async fn acquire(&self, config: &DeviceConfig) -> Result<DeviceClient, CoreError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(CoreError::ShutDown);
        }
        self.ensure_sweeper().await;

        let address = config.address.clone();
        let entry = loop {
            match self.claim(&address) {
                Claim::Held(entry) => break entry,
                Claim::Closing(entry) => {
                    debug!(device = %address, "waiting for swept client to close");
                    entry.closed.cancelled().await;
                    if self.inner.shut_down.load(Ordering::Acquire) {
                        return Err(CoreError::ShutDown);
                    }
                }
            }
        };

        let context = self.inner.context.clone();
        let result = entry
            .client
            .get_or_try_init(|| async {
                if let Some(ref stale) = entry.predecessor {
                    stale.close().await;
                }
                DeviceClient::connect(config.clone(), context).await
            })
            .await;

        match result {
            Ok(client) => {
                debug!(device = %address, refs = entry.refs(), "client acquired");
                Ok(client.clone())
            }
            Err(e) => {
                entry.refs.fetch_sub(1, Ordering::AcqRel);
                self.inner.entries.remove_if(&address, |_, current| {
                    Arc::ptr_eq(current, &entry) && current.client.get().is_none() && current.refs() == 0
                });
                warn!(device = %address, error = %e, "could not create device client");
                Err(e)
            }
        }
    }

    /// Take a reference on the live entry for `address`, creating one if
    /// needed. A client closed by one of its holders is replaced; the new
    /// entry inherits the outstanding references so their releases still
    /// balance.
    fn claim(&self, address: &DeviceAddress) -> Claim {
        match self.inner.entries.entry(address.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = Arc::clone(occupied.get());
                if current.is_closing() {
                    return Claim::Closing(current);
                }
                if current.is_dead() {
                    info!(device = %address, "client was closed by a holder, replacing it");
                    let fresh = Arc::new(ManagedEntry::new(current.refs() + 1, current.client.get().cloned()));
                    occupied.insert(Arc::clone(&fresh));
                    return Claim::Held(fresh);
                }
                current.refs.fetch_add(1, Ordering::AcqRel);
                current.touch();
                Claim::Held(current)
            }
            Entry::Vacant(vacant) => {
                let fresh = Arc::new(ManagedEntry::new(1, None));
                vacant.insert(Arc::clone(&fresh));
                Claim::Held(fresh)
            }
        }
    }

    /// Drop one reference to the client for `address`. The client stays
    /// open until the idle sweep finds it unreferenced. Returns `false`
    /// when there was no reference to drop.
    pub fn release(&self, address: &DeviceAddress) -> bool {
        let Some(entry) = self.inner.entries.get(address) else {
            warn!(device = %address, "release for unknown device");
            return false;
        };

        let released = entry
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        entry.touch();

        if released {
            debug!(device = %address, refs = entry.refs(), "client released");
        } else {
            warn!(device = %address, "release without matching acquire");
        }
        released
    }

    // ── Inspection ───────────────────────────────────────────────

    pub fn entry_count(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn ref_count(&self, address: &DeviceAddress) -> Option<usize> {
        self.inner.entries.get(address).map(|e| e.refs())
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        self.inner.entries.contains_key(address)
    }

    // ── Sweep / shutdown ─────────────────────────────────────────

    /// Close and remove every unreferenced client idle for longer than
    /// the idle timeout. Returns how many were closed.
    pub async fn sweep_idle(&self) -> usize {
        sweep(&self.inner).await
    }

    /// Close every client regardless of references and stop the sweeper.
    /// Later `acquire` calls fail with [`CoreError::ShutDown`].
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();

        let sweeper = self.inner.sweeper.lock().await.take();
        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                warn!(error = %e, "idle sweeper ended abnormally");
            }
        }

        let addresses: Vec<DeviceAddress> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        let entries: Vec<Arc<ManagedEntry>> = addresses
            .iter()
            .filter_map(|a| self.inner.entries.remove(a))
            .map(|(_, entry)| entry)
            .collect();
        let clients: Vec<DeviceClient> = entries.iter().filter_map(|e| e.client.get().cloned()).collect();

        info!(clients = clients.len(), "shutting down client registry");
        join_all(clients.iter().map(DeviceClient::close)).await;
        for entry in &entries {
            entry.closed.cancel();
        }
    }

    async fn ensure_sweeper(&self) {
        let mut sweeper = self.inner.sweeper.lock().await;
        if sweeper.is_some() || self.inner.cancel.is_cancelled() {
            return;
        }
        *sweeper = Some(tokio::spawn(sweep_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.sweep_interval,
            self.inner.cancel.clone(),
        )));
    }
}

async fn sweep(inner: &RegistryInner) -> usize {
    let now = Instant::now();
    let idle_timeout = inner.config.idle_timeout;

    // Mark under the shard write lock so no acquire can take a reference
    // between the check and the mark.
    let mut expired = Vec::new();
    inner.entries.retain(|address, entry| {
        let idle = !entry.is_closing()
            && entry.refs() == 0
            && now.saturating_duration_since(entry.idle_since()) >= idle_timeout;
        if idle {
            debug!(device = %address, "client idle, closing");
            entry.closing.store(true, Ordering::Release);
            expired.push((address.clone(), Arc::clone(entry)));
        }
        true
    });

    join_all(expired.iter().map(|(_, entry)| async move {
        if let Some(client) = entry.client.get() {
            client.close().await;
        }
    }))
    .await;

    for (address, entry) in &expired {
        inner.entries.remove_if(address, |_, current| Arc::ptr_eq(current, entry));
        entry.closed.cancel();
    }

    if !expired.is_empty() {
        info!(closed = expired.len(), remaining = inner.entries.len(), "idle sweep");
    }
    expired.len()
}

async fn sweep_loop(inner: Weak<RegistryInner>, period: Duration, cancel: CancellationToken) {
    let period = period.max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else { break };
        sweep(&inner).await;
    }
    debug!("idle sweeper exiting");
}
