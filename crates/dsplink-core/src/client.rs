// ── Device client ──
//
// One command channel plus one telemetry channel for one device, shared
// by every caller that talks to that device. Subscriptions are reference
// counted per (parameter, format): the device hears `subscribe` for the
// first listener and `unsubscribe` after the last one is released.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dsplink_api::{
    ChannelState, ChannelStatus, CommandChannel, DeviceAddress, Dispatcher, Listener, ListenerId, ParamRef, ParamValue,
    Sample, SampleSource, TelemetryChannel, TelemetrySink, ValueFormat,
};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::error::CoreError;
use crate::state::{ConnectionStateRecord, ConnectionStateStore};
use crate::subscription::SubscriptionHandle;

/// Host-provided collaborators shared by every client.
#[derive(Clone, Default)]
pub struct ClientContext {
    pub state_store: Option<Arc<dyn ConnectionStateStore>>,
    pub sink: Option<Arc<dyn TelemetrySink>>,
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("state_store", &self.state_store.is_some())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

type SubscriptionKey = (ParamRef, ValueFormat);

/// Listeners for one (parameter, format) pair.
///
/// The slot lock is held across the device `subscribe`/`unsubscribe` for
/// that pair only, so a slow request never blocks other parameters. A
/// retired slot has left the table; callers that waited on it start over.
#[derive(Default)]
struct SubscriptionSlot {
    state: Mutex<SlotState>,
    /// Mirror of `state.listeners.len()`, readable without waiting.
    active: AtomicUsize,
}

#[derive(Default)]
struct SlotState {
    listeners: Vec<ListenerId>,
    retired: bool,
}

impl SubscriptionSlot {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) > 0
    }
}

/// Shared handle to one device.
///
/// Cheaply cloneable via `Arc<ClientInner>`. Normally obtained from
/// [`ClientRegistry::acquire`](crate::ClientRegistry::acquire), which
/// guarantees one client per device address.
#[derive(Clone)]
pub struct DeviceClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: DeviceConfig,
    catalog: HashSet<ParamRef>,
    dispatcher: Arc<Dispatcher>,
    command: CommandChannel,
    telemetry: TelemetryChannel,
    subscriptions: Mutex<HashMap<SubscriptionKey, Arc<SubscriptionSlot>>>,
    status_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClient")
            .field("address", &self.inner.config.address)
            .field("state", &self.inner.command.state())
            .finish_non_exhaustive()
    }
}

impl DeviceClient {
    /// Bind telemetry, open the command channel, and wait for the first
    /// connection attempt.
    ///
    /// Only local failures are fatal (the telemetry port already taken).
    /// An unreachable device still yields a client; the command channel
    /// keeps retrying in the background.
    pub async fn connect(config: DeviceConfig, context: ClientContext) -> Result<Self, CoreError> {
        let address = config.address.clone();
        let dispatcher = Arc::new(Dispatcher::new(address.clone(), context.sink.clone()));

        let telemetry = TelemetryChannel::bind(
            &address,
            config.telemetry_bind,
            config.channel.codec(),
            Arc::clone(&dispatcher),
        )
        .await?;
        telemetry.listen().await?;

        let command = CommandChannel::new(address.clone(), config.channel.clone(), Arc::clone(&dispatcher));

        let client = Self {
            inner: Arc::new(ClientInner {
                catalog: config.catalog.iter().cloned().collect(),
                config,
                dispatcher,
                command,
                telemetry,
                subscriptions: Mutex::new(HashMap::new()),
                status_task: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        };

        let task = tokio::spawn(track_status(
            Arc::downgrade(&client.inner),
            client.inner.command.watch_status(),
            address.clone(),
            context.state_store,
        ));
        *client.inner.status_task.lock().await = Some(task);

        if let Err(e) = client.inner.command.open().await {
            client.close().await;
            return Err(e.into());
        }

        let first = client.inner.command.wait_initial_attempt().await;
        if first.state == ChannelState::Ready {
            info!(device = %address, "device client connected");
        } else {
            warn!(
                device = %address,
                error = first.last_error.as_deref().unwrap_or("unknown"),
                "device not reachable yet, retrying in background"
            );
        }

        Ok(client)
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.inner.config.address
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ChannelStatus {
        self.inner.command.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.command.watch_status()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether both handles share one underlying client.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Build a wire parameter from a caller's one-based index.
    ///
    /// `param("SourceGain", 3)` is input 3 as printed on the device, which
    /// the protocol calls `SourceGain_2`.
    pub fn param(&self, category: &str, number: u32) -> Result<ParamRef, CoreError> {
        let Some(index) = number.checked_sub(1) else {
            return Err(CoreError::InvalidParameter {
                name: format!("{category}_{number}"),
                reason: "channel numbers start at 1".into(),
            });
        };
        let param = ParamRef::new(category, index)?;
        self.check_declared(&param)?;
        Ok(param)
    }

    /// Most recent sample seen for `param` from telemetry, a notification
    /// or an acknowledged `set`.
    pub fn last_seen(&self, param: &ParamRef) -> Option<Sample> {
        self.inner.dispatcher.last_seen(param)
    }

    // ── Requests ─────────────────────────────────────────────────

    pub async fn get(&self, param: &ParamRef) -> Result<ParamValue, CoreError> {
        self.check_declared(param)?;
        let value = self.inner.command.get(param).await?;
        debug!(device = %self.address(), %param, %value, "get");
        Ok(value)
    }

    /// Write a value and return the device's acknowledgement.
    ///
    /// Values are passed through unclamped; range checks belong to the
    /// caller.
    pub async fn set(&self, param: &ParamRef, value: ParamValue) -> Result<ParamValue, CoreError> {
        self.check_declared(param)?;
        let ack = self.inner.command.set(param, value.clone()).await?;
        debug!(device = %self.address(), %param, %ack, "set acknowledged");

        if self.is_subscribed(param).await {
            let confirmed = if ack.is_null() { value } else { ack.clone() };
            self.inner.dispatcher.update_cache(&Sample {
                param: param.clone(),
                value: confirmed,
                format: None,
                peak: None,
                clip: None,
                source: SampleSource::Acknowledged,
                received_at: Utc::now(),
            });
        }
        Ok(ack)
    }

    /// Register `listener` for updates of `param` in `format`.
    ///
    /// The first listener for a (parameter, format) pair also asks the
    /// device to start reporting it; if that request fails nothing is
    /// registered.
    pub async fn subscribe<F>(
        &self,
        param: &ParamRef,
        format: ValueFormat,
        listener: F,
    ) -> Result<SubscriptionHandle, CoreError>
    where
        F: Fn(&Sample) + Send + Sync + 'static,
    {
        self.check_declared(param)?;
        if self.is_closed() {
            return Err(dsplink_api::Error::ChannelClosed.into());
        }

        let key = (param.clone(), format);
        let listener: Listener = Arc::new(listener);

        loop {
            let slot = self.slot(&key).await;
            let mut state = slot.state.lock().await;
            if state.retired {
                drop(state);
                self.retire(&key, &slot).await;
                continue;
            }

            if state.listeners.is_empty() {
                if let Err(e) = self.inner.command.subscribe(param, format).await {
                    state.retired = true;
                    drop(state);
                    self.retire(&key, &slot).await;
                    return Err(e.into());
                }
                debug!(device = %self.address(), %param, %format, "device subscription started");
            }

            let id = self.inner.dispatcher.add_listener(param, format, Arc::clone(&listener));
            state.listeners.push(id);
            slot.active.store(state.listeners.len(), Ordering::Release);
            debug!(device = %self.address(), %param, %format, listeners = state.listeners.len(), "listener added");

            return Ok(SubscriptionHandle::new(self.clone(), param.clone(), format, id));
        }
    }

    /// Number of live listeners for a (parameter, format) pair.
    pub async fn subscriber_count(&self, param: &ParamRef, format: ValueFormat) -> usize {
        self.inner
            .subscriptions
            .lock()
            .await
            .get(&(param.clone(), format))
            .map_or(0, |slot| slot.active.load(Ordering::Acquire))
    }

    pub(crate) async fn release_listener(
        &self,
        param: &ParamRef,
        format: ValueFormat,
        id: ListenerId,
    ) -> Result<(), CoreError> {
        let key = (param.clone(), format);
        let Some(slot) = self.inner.subscriptions.lock().await.get(&key).cloned() else {
            return Ok(());
        };
        let mut state = slot.state.lock().await;
        if state.retired {
            return Ok(());
        }

        let before = state.listeners.len();
        state.listeners.retain(|l| *l != id);
        if state.listeners.len() == before {
            return Ok(());
        }
        self.inner.dispatcher.remove_listener(param, id);
        slot.active.store(state.listeners.len(), Ordering::Release);

        if !state.listeners.is_empty() {
            debug!(device = %self.address(), %param, %format, listeners = state.listeners.len(), "listener released");
            return Ok(());
        }

        // Retire only after the device has heard `unsubscribe`, so a new
        // subscriber for this pair cannot overtake it on the wire.
        let result = if self.is_closed() {
            Ok(())
        } else {
            self.inner.command.unsubscribe(param, format).await.map(|_| ())
        };
        state.retired = true;
        drop(state);
        self.retire(&key, &slot).await;

        result?;
        debug!(device = %self.address(), %param, %format, "device subscription stopped");
        Ok(())
    }

    /// Remove a listener without talking to the device. Used when a
    /// handle is dropped outside a runtime.
    pub(crate) fn detach_listener(&self, param: &ParamRef, id: ListenerId) {
        self.inner.dispatcher.remove_listener(param, id);
        let Ok(mut subscriptions) = self.inner.subscriptions.try_lock() else {
            return;
        };
        subscriptions.retain(|_, slot| {
            let Ok(mut state) = slot.state.try_lock() else {
                return true;
            };
            state.listeners.retain(|l| *l != id);
            slot.active.store(state.listeners.len(), Ordering::Release);
            if state.listeners.is_empty() {
                state.retired = true;
            }
            !state.retired
        });
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Close both channels. Every outstanding request fails with a
    /// channel-lost error. Safe to call any number of times.
    pub async fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            info!(device = %self.address(), "closing device client");
        }

        self.inner.subscriptions.lock().await.clear();
        self.inner.dispatcher.clear_listeners();
        self.inner.command.close().await;
        self.inner.telemetry.close().await;

        let task = self.inner.status_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(device = %self.address(), error = %e, "status task ended abnormally");
            }
        }
    }

    fn check_declared(&self, param: &ParamRef) -> Result<(), CoreError> {
        if self.inner.catalog.is_empty() || self.inner.catalog.contains(param) {
            Ok(())
        } else {
            Err(CoreError::UnknownParameter {
                param: param.wire_name(),
            })
        }
    }

    /// Current slot for `key`, created empty if absent.
    async fn slot(&self, key: &SubscriptionKey) -> Arc<SubscriptionSlot> {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        Arc::clone(subscriptions.entry(key.clone()).or_default())
    }

    /// Drop a retired slot from the table unless it was already replaced.
    async fn retire(&self, key: &SubscriptionKey, slot: &Arc<SubscriptionSlot>) {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        if subscriptions.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            subscriptions.remove(key);
        }
    }

    async fn is_subscribed(&self, param: &ParamRef) -> bool {
        self.inner
            .subscriptions
            .lock()
            .await
            .iter()
            .any(|((p, _), slot)| p == param && slot.is_active())
    }

    /// Re-issue device-side subscriptions after a reconnect; the device
    /// forgets them when the connection drops.
    async fn restore_subscriptions(&self) {
        let keys: Vec<SubscriptionKey> = self
            .inner
            .subscriptions
            .lock()
            .await
            .iter()
            .filter(|(_, slot)| slot.is_active())
            .map(|(key, _)| key.clone())
            .collect();
        if keys.is_empty() {
            return;
        }
        debug!(device = %self.address(), count = keys.len(), "restoring subscriptions");

        for (param, format) in keys {
            if let Err(e) = self.inner.command.subscribe(&param, format).await {
                warn!(device = %self.address(), %param, %format, error = %e, "could not restore subscription");
            }
        }
    }
}

/// Mirror channel status into the state store, and restore subscriptions
/// whenever the channel comes back after a disconnect.
async fn track_status(
    client: Weak<ClientInner>,
    mut status: watch::Receiver<ChannelStatus>,
    address: DeviceAddress,
    store: Option<Arc<dyn ConnectionStateStore>>,
) {
    let mut last_connected: Option<DateTime<Utc>> = None;

    loop {
        let current = status.borrow_and_update().clone();

        if let Some(ref store) = store {
            store.update(ConnectionStateRecord::from_status(&address, &current));
        }

        if current.state == ChannelState::Ready && current.connected_at != last_connected {
            let reconnected = last_connected.is_some();
            last_connected = current.connected_at;
            if reconnected {
                if let Some(inner) = client.upgrade() {
                    let client = DeviceClient { inner };
                    tokio::spawn(async move { client.restore_subscriptions().await });
                }
            }
        }

        if current.state == ChannelState::Closed || status.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn context_debug_hides_collaborators() {
        let context = ClientContext::default();
        assert_eq!(format!("{context:?}"), "ClientContext { state_store: false, sink: false }");
    }
}
