// Integration tests for `DeviceClient` against an in-process fake device.
#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use common::FakeDevice;
use dsplink_core::{
    ChannelState, ClientContext, ConnectionStateStore, CoreError, DeviceAddress, DeviceClient, DeviceConfig,
    InMemoryStateStore, ParamRef, ParamValue, Sample, SampleSource, ValueFormat,
};

// ── Helpers ─────────────────────────────────────────────────────────

async fn connect(device: &FakeDevice) -> DeviceClient {
    DeviceClient::connect(device.config(), ClientContext::default())
        .await
        .unwrap()
}

fn param(name: &str) -> ParamRef {
    name.parse().unwrap()
}

fn counting_listener() -> (Arc<AtomicUsize>, impl Fn(&Sample) + Send + Sync + 'static) {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    (hits, move |_: &Sample| {
        h.fetch_add(1, Ordering::SeqCst);
    })
}

// ── Requests ────────────────────────────────────────────────────────

#[tokio::test]
async fn set_then_get_source_gain() {
    let device = FakeDevice::start().await;
    let client = connect(&device).await;
    assert_eq!(client.status().state, ChannelState::Ready);

    let gain = param("SourceGain_2");
    let ack = tokio::time::timeout(Duration::from_secs(5), client.set(&gain, ParamValue::from(-12.0)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ack.as_f64(), Some(-12.0));

    let value = client.get(&gain).await.unwrap();
    assert_eq!(value.as_f64(), Some(-12.0));

    client.close().await;
}

#[tokio::test]
async fn rejection_and_unreachability_are_distinguished() {
    let device = FakeDevice::start().await;
    device.reject("SourceGain_0", "value out of range");
    device.hold("SourceGain_1");

    let mut config = device.config();
    config.channel.request_timeout = Duration::from_millis(200);
    let client = DeviceClient::connect(config, ClientContext::default()).await.unwrap();

    let rejected = client
        .set(&param("SourceGain_0"), ParamValue::from(20.0))
        .await
        .unwrap_err();
    assert!(rejected.is_rejected(), "{rejected:?}");

    let timed_out = client.get(&param("SourceGain_1")).await.unwrap_err();
    assert!(matches!(timed_out, CoreError::Timeout { timeout_ms: 200 }), "{timed_out:?}");
    assert!(timed_out.is_unreachable());

    // A single timeout leaves the channel usable.
    assert_eq!(client.get(&param("SourceGain_3")).await.unwrap().as_f64(), Some(0.0));

    client.close().await;
}

#[tokio::test]
async fn catalog_rejects_undeclared_parameters_locally() {
    let device = FakeDevice::start().await;
    let mut config = device.config();
    config.catalog = vec![param("SourceGain_0"), param("SourceGain_1")];
    let client = DeviceClient::connect(config, ClientContext::default()).await.unwrap();

    let err = client.get(&param("ZoneGain_0")).await.unwrap_err();
    assert!(matches!(&err, CoreError::UnknownParameter { param } if param == "ZoneGain_0"), "{err:?}");
    assert!(client.get(&param("SourceGain_1")).await.is_ok());
    assert_eq!(device.count("get", "ZoneGain_0"), 0);

    client.close().await;
}

#[tokio::test]
async fn one_based_numbers_map_to_zero_based_params() {
    let device = FakeDevice::start().await;
    let client = connect(&device).await;

    assert_eq!(client.param("SourceGain", 3).unwrap(), param("SourceGain_2"));
    let err = client.param("SourceGain", 0).unwrap_err();
    assert!(matches!(err, CoreError::InvalidParameter { .. }), "{err:?}");

    client.close().await;
}

// ── Subscriptions ───────────────────────────────────────────────────

#[tokio::test]
async fn shared_subscription_unsubscribes_once() {
    let device = FakeDevice::start().await;
    let client = connect(&device).await;
    let meter = param("OutputMeter_1");

    let (_, first) = counting_listener();
    let (_, second) = counting_listener();
    let a = client.subscribe(&meter, ValueFormat::Value, first).await.unwrap();
    let b = client.subscribe(&meter, ValueFormat::Value, second).await.unwrap();

    assert_eq!(device.count("subscribe", "OutputMeter_1"), 1);
    assert_eq!(client.subscriber_count(&meter, ValueFormat::Value).await, 2);

    a.release().await.unwrap();
    assert_eq!(device.count("unsubscribe", "OutputMeter_1"), 0);

    b.release().await.unwrap();
    assert_eq!(device.count("unsubscribe", "OutputMeter_1"), 1);
    assert_eq!(client.subscriber_count(&meter, ValueFormat::Value).await, 0);

    client.close().await;
    assert_eq!(device.count("unsubscribe", "OutputMeter_1"), 1);
}

#[tokio::test]
async fn slow_subscribe_does_not_block_other_parameters() {
    let device = FakeDevice::start().await;
    device.hold("OutputMeter_0");
    let client = connect(&device).await;

    let stalled = tokio::spawn({
        let client = client.clone();
        async move {
            let (_, listener) = counting_listener();
            client
                .subscribe(&param("OutputMeter_0"), ValueFormat::Value, listener)
                .await
                .map(|_| ())
        }
    });
    device
        .wait_until("held subscribe", |d| d.count("subscribe", "OutputMeter_0") == 1)
        .await;

    let gain = param("SourceGain_2");
    let ack = tokio::time::timeout(Duration::from_millis(500), client.set(&gain, ParamValue::from(-12.0)))
        .await
        .expect("set waited behind an unrelated subscribe")
        .unwrap();
    assert_eq!(ack.as_f64(), Some(-12.0));

    let (_, listener) = counting_listener();
    let handle = tokio::time::timeout(
        Duration::from_millis(500),
        client.subscribe(&param("OutputMeter_1"), ValueFormat::Value, listener),
    )
    .await
    .expect("subscribe waited behind an unrelated subscribe")
    .unwrap();
    handle.release().await.unwrap();

    let err = stalled.await.unwrap().unwrap_err();
    assert!(matches!(err, CoreError::Timeout { .. }), "{err:?}");
    assert_eq!(client.subscriber_count(&param("OutputMeter_0"), ValueFormat::Value).await, 0);

    client.close().await;
}

#[tokio::test]
async fn concurrent_first_subscribers_share_one_device_subscribe() {
    let device = FakeDevice::start().await;
    let client = connect(&device).await;
    let meter = param("InputMeter_3");

    let (_, first) = counting_listener();
    let (_, second) = counting_listener();
    let (a, b) = tokio::join!(
        client.subscribe(&meter, ValueFormat::Value, first),
        client.subscribe(&meter, ValueFormat::Value, second),
    );
    assert_eq!(device.count("subscribe", "InputMeter_3"), 1);
    assert_eq!(client.subscriber_count(&meter, ValueFormat::Value).await, 2);

    a.unwrap().release().await.unwrap();
    b.unwrap().release().await.unwrap();
    assert_eq!(device.count("unsubscribe", "InputMeter_3"), 1);

    client.close().await;
}

#[tokio::test]
async fn formats_are_subscribed_independently() {
    let device = FakeDevice::start().await;
    let client = connect(&device).await;
    let gain = param("ZoneGain_0");

    let (_, val) = counting_listener();
    let (_, pct) = counting_listener();
    let a = client.subscribe(&gain, ValueFormat::Value, val).await.unwrap();
    let b = client.subscribe(&gain, ValueFormat::Percent, pct).await.unwrap();

    assert_eq!(device.count("subscribe", "ZoneGain_0"), 2);
    a.release().await.unwrap();
    b.release().await.unwrap();
    assert_eq!(device.count("unsubscribe", "ZoneGain_0"), 2);

    client.close().await;
}

#[tokio::test]
async fn telemetry_reaches_listeners_and_cache() {
    let device = FakeDevice::start().await;
    let client = connect(&device).await;
    let meter = param("InputMeter_0");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = client
        .subscribe(&meter, ValueFormat::Value, move |s: &Sample| {
            let _ = tx.send(s.clone());
        })
        .await
        .unwrap();

    device
        .send_telemetry("{\"param\":\"InputMeter_0\",\"val\":-20.5,\"peak\":-4.0,\"clip\":false}\n{\"param\":\"InputMeter_1\",\"val\":-30}")
        .await;

    let sample = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sample.param, meter);
    assert_eq!(sample.value.as_f64(), Some(-20.5));
    assert_eq!(sample.peak, Some(-4.0));
    assert_eq!(sample.source, SampleSource::Telemetry);

    // Unsubscribed parameters are still cached.
    device.wait_until("cached InputMeter_1", |_| client.last_seen(&param("InputMeter_1")).is_some()).await;

    handle.release().await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn acknowledged_set_refreshes_subscribed_cache() {
    let device = FakeDevice::start().await;
    let client = connect(&device).await;
    let gain = param("SourceGain_4");
    let other = param("SourceGain_5");

    let (_, listener) = counting_listener();
    let handle = client.subscribe(&gain, ValueFormat::Value, listener).await.unwrap();

    client.set(&gain, ParamValue::from(-6.5)).await.unwrap();
    client.set(&other, ParamValue::from(-1.0)).await.unwrap();

    let cached = client.last_seen(&gain).unwrap();
    assert_eq!(cached.value.as_f64(), Some(-6.5));
    assert_eq!(cached.source, SampleSource::Acknowledged);
    assert!(client.last_seen(&other).is_none());

    handle.release().await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn dropped_handle_is_released_in_background() {
    let device = FakeDevice::start().await;
    let client = connect(&device).await;
    let meter = param("OutputMeter_2");

    let (_, listener) = counting_listener();
    let handle = client.subscribe(&meter, ValueFormat::Value, listener).await.unwrap();
    drop(handle);

    device
        .wait_until("background unsubscribe", |d| d.count("unsubscribe", "OutputMeter_2") == 1)
        .await;
    assert_eq!(client.subscriber_count(&meter, ValueFormat::Value).await, 0);

    client.close().await;
}

#[tokio::test]
async fn subscriptions_are_restored_after_reconnect() {
    let device = FakeDevice::start().await;
    let client = connect(&device).await;
    let meter = param("OutputMeter_0");

    let (_, listener) = counting_listener();
    let handle = client.subscribe(&meter, ValueFormat::Value, listener).await.unwrap();
    assert_eq!(device.count("subscribe", "OutputMeter_0"), 1);

    device.drop_connections();
    device.wait_until("reconnect", |d| d.connection_count() == 2).await;
    device
        .wait_until("subscription restored", |d| d.count("subscribe", "OutputMeter_0") == 2)
        .await;

    handle.release().await.unwrap();
    client.close().await;
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn close_is_idempotent() {
    let device = FakeDevice::start().await;
    let client = connect(&device).await;

    client.close().await;
    let after_first = client.status();
    client.close().await;
    let after_second = client.status();

    assert!(client.is_closed());
    assert_eq!(after_first.state, ChannelState::Closed);
    assert_eq!(after_first, after_second);

    let err = client.get(&param("SourceGain_0")).await.unwrap_err();
    assert!(err.is_unreachable(), "{err:?}");
    let err = client
        .subscribe(&param("SourceGain_0"), ValueFormat::Value, |_: &Sample| {})
        .await
        .unwrap_err();
    assert!(err.is_unreachable(), "{err:?}");
}

#[tokio::test]
async fn connection_state_is_recorded() {
    let device = FakeDevice::start().await;
    let store = Arc::new(InMemoryStateStore::new());
    let context = ClientContext {
        state_store: Some(store.clone()),
        sink: None,
    };
    let client = DeviceClient::connect(device.config(), context).await.unwrap();

    device
        .wait_until("connected record", |d| store.get(&d.address).is_some_and(|r| r.connected))
        .await;

    client.close().await;
    let record = store.get(&device.address).unwrap();
    assert!(!record.connected);
    assert_eq!(record.state, ChannelState::Closed);
    assert!(record.last_connected_at.is_some());
}

#[tokio::test]
async fn unreachable_device_still_yields_a_client() {
    let mut config = DeviceConfig::new(DeviceAddress::with_ports(
        "127.0.0.1",
        common::closed_tcp_port().await,
        common::free_udp_port().await,
    ));
    config.telemetry_bind = common::LOCALHOST;
    config.channel.request_timeout = Duration::from_millis(300);

    let client = DeviceClient::connect(config, ClientContext::default()).await.unwrap();
    let status = client.status();
    assert_ne!(status.state, ChannelState::Ready);
    assert!(status.last_error.is_some());

    let err = client.get(&param("SourceGain_0")).await.unwrap_err();
    assert!(err.is_unreachable(), "{err:?}");

    client.close().await;
}
