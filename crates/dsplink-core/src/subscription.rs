use dsplink_api::{ListenerId, ParamRef, ValueFormat};
use tracing::{debug, warn};

use crate::client::DeviceClient;
use crate::error::CoreError;

/// A live listener registration returned by
/// [`DeviceClient::subscribe`](crate::DeviceClient::subscribe).
///
/// Call [`release`](Self::release) to unregister and learn whether the
/// device-side unsubscribe succeeded. A handle dropped without release is
/// released in the background on the current runtime.
#[must_use = "dropping the handle releases the subscription"]
pub struct SubscriptionHandle {
    client: DeviceClient,
    param: ParamRef,
    format: ValueFormat,
    id: ListenerId,
    released: bool,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("device", self.client.address())
            .field("param", &self.param)
            .field("format", &self.format)
            .field("id", &self.id)
            .finish()
    }
}

impl SubscriptionHandle {
    pub(crate) fn new(client: DeviceClient, param: ParamRef, format: ValueFormat, id: ListenerId) -> Self {
        Self {
            client,
            param,
            format,
            id,
            released: false,
        }
    }

    pub fn param(&self) -> &ParamRef {
        &self.param
    }

    pub fn format(&self) -> ValueFormat {
        self.format
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Unregister the listener. Releasing the last listener for this
    /// parameter and format sends `unsubscribe` to the device.
    pub async fn release(mut self) -> Result<(), CoreError> {
        self.released = true;
        self.client.release_listener(&self.param, self.format, self.id).await
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let client = self.client.clone();
        let param = self.param.clone();
        let format = self.format;
        let id = self.id;

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            debug!(device = %client.address(), %param, "subscription handle dropped, releasing");
            runtime.spawn(async move {
                if let Err(e) = client.release_listener(&param, format, id).await {
                    warn!(device = %client.address(), %param, error = %e, "background release failed");
                }
            });
        } else {
            warn!(device = %client.address(), %param, "subscription dropped outside a runtime, device not told");
            client.detach_listener(&param, id);
        }
    }
}
