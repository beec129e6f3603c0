//! Fan-out of parameter samples to registered listeners.
//!
//! Both channels of a device feed one [`Dispatcher`]: the telemetry socket
//! for streamed values and the command connection for unsolicited
//! notifications. The listener table is copy-on-write behind an
//! [`ArcSwap`], so delivery never blocks registration and a listener may
//! register or remove listeners from inside its own callback.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use uuid::Uuid;

use crate::types::{DeviceAddress, ParamRef, Sample, ValueFormat};

/// Callback invoked for every matching sample.
pub type Listener = Arc<dyn Fn(&Sample) + Send + Sync>;

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── TelemetrySink ────────────────────────────────────────────────────

/// Error returned by a [`TelemetrySink`].
#[derive(Debug, thiserror::Error)]
#[error("telemetry sink failed: {0}")]
pub struct SinkError(pub String);

/// Optional consumer that sees every sample a device produces, for
/// recording or forwarding. Failures are logged and never reach listeners.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, device: &DeviceAddress, sample: &Sample) -> Result<(), SinkError>;
}

// ── Dispatcher ───────────────────────────────────────────────────────

struct ListenerEntry {
    id: ListenerId,
    format: ValueFormat,
    callback: Listener,
}

type ListenerTable = HashMap<ParamRef, Vec<Arc<ListenerEntry>>>;

pub struct Dispatcher {
    device: DeviceAddress,
    listeners: ArcSwap<ListenerTable>,
    last_seen: DashMap<ParamRef, Sample>,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("device", &self.device)
            .field("params", &self.listeners.load().len())
            .field("cached", &self.last_seen.len())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(device: DeviceAddress, sink: Option<Arc<dyn TelemetrySink>>) -> Self {
        Self {
            device,
            listeners: ArcSwap::from_pointee(HashMap::new()),
            last_seen: DashMap::new(),
            sink,
        }
    }

    pub fn device(&self) -> &DeviceAddress {
        &self.device
    }

    /// Register `callback` for samples of `param`.
    ///
    /// Samples that carry a format label are only delivered to listeners
    /// registered for that format; unlabelled samples reach everyone.
    pub fn add_listener(&self, param: &ParamRef, format: ValueFormat, callback: Listener) -> ListenerId {
        let entry = Arc::new(ListenerEntry {
            id: ListenerId::new(),
            format,
            callback,
        });
        let id = entry.id;

        self.listeners.rcu(|current| {
            let mut next = ListenerTable::clone(current);
            next.entry(param.clone()).or_default().push(Arc::clone(&entry));
            next
        });

        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, param: &ParamRef, id: ListenerId) -> bool {
        let previous = self.listeners.rcu(|current| {
            let mut next = ListenerTable::clone(current);
            if let Some(entries) = next.get_mut(param) {
                entries.retain(|e| e.id != id);
                if entries.is_empty() {
                    next.remove(param);
                }
            }
            next
        });

        previous
            .get(param)
            .is_some_and(|entries| entries.iter().any(|e| e.id == id))
    }

    pub fn listener_count(&self, param: &ParamRef) -> usize {
        self.listeners.load().get(param).map_or(0, Vec::len)
    }

    pub fn clear_listeners(&self) {
        self.listeners.store(Arc::new(HashMap::new()));
    }

    /// Deliver `sample` to its listeners, then record it as the latest
    /// value and hand it to the sink.
    pub fn dispatch(&self, sample: &Sample) {
        let table = self.listeners.load();
        match table.get(&sample.param) {
            Some(entries) => {
                for entry in entries {
                    if sample.format.is_some_and(|f| f != entry.format) {
                        continue;
                    }
                    let callback = &entry.callback;
                    if catch_unwind(AssertUnwindSafe(|| callback(sample))).is_err() {
                        tracing::error!(
                            device = %self.device,
                            param = %sample.param,
                            listener = %entry.id,
                            "listener panicked"
                        );
                    }
                }
            }
            None => tracing::trace!(device = %self.device, param = %sample.param, "sample without listeners"),
        }

        // Listeners still see the previous value through `last_seen`.
        self.update_cache(sample);

        if let Some(ref sink) = self.sink {
            if let Err(e) = sink.record(&self.device, sample) {
                tracing::warn!(device = %self.device, param = %sample.param, error = %e, "telemetry sink rejected sample");
            }
        }
    }

    pub fn update_cache(&self, sample: &Sample) {
        self.last_seen.insert(sample.param.clone(), sample.clone());
    }

    /// Most recent sample observed for `param`, from any source.
    pub fn last_seen(&self, param: &ParamRef) -> Option<Sample> {
        self.last_seen.get(param).map(|s| s.value().clone())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
