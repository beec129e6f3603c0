//! Telemetry channel: the device pushes meter readings and parameter
//! updates as UDP datagrams to a fixed local port.
//!
//! The port is owned exclusively: binding it twice in one process (or
//! against another program) fails with [`Error::PortInUse`] instead of
//! silently sharing the traffic.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{Inbound, RecordCodec};
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::types::{DeviceAddress, SampleSource};

/// Largest payload a UDP datagram can carry.
const MAX_DATAGRAM_LEN: usize = 65_535;

/// Pause after a receive error so a persistent failure cannot spin.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct TelemetryChannel {
    device: DeviceAddress,
    local_addr: SocketAddr,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    codec: RecordCodec,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TelemetryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryChannel")
            .field("device", &self.device)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl TelemetryChannel {
    /// Bind the device's telemetry port on `bind_ip`.
    ///
    /// Fails with [`Error::PortInUse`] if the port is already bound.
    pub async fn bind(
        device: &DeviceAddress,
        bind_ip: IpAddr,
        codec: RecordCodec,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, Error> {
        let port = device.telemetry_port();
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, port))
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::AddrInUse => Error::PortInUse { port },
                _ => Error::Io(e),
            })?;
        let local_addr = socket.local_addr()?;
        debug!(device = %device, %local_addr, "telemetry socket bound");

        Ok(Self {
            device: device.clone(),
            local_addr,
            socket: Mutex::new(Some(Arc::new(socket))),
            codec,
            dispatcher,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the receive loop. A second call is a no-op.
    pub async fn listen(&self) -> Result<(), Error> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let Some(socket) = self.socket.lock().await.clone() else {
            return Err(Error::ChannelClosed);
        };

        let peer = self.device.host_ip().map(|ip| ip.to_canonical());
        *task = Some(tokio::spawn(recv_loop(
            socket,
            peer,
            self.codec.clone(),
            Arc::clone(&self.dispatcher),
            self.cancel.clone(),
        )));
        info!(device = %self.device, local_addr = %self.local_addr, "telemetry listening");
        Ok(())
    }

    /// Stop receiving and release the port. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        // Held across the join: a concurrent close returns only once the
        // receive task has let go of the socket.
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                warn!(device = %self.device, error = %e, "telemetry task ended abnormally");
            }
        }
        drop(task);
        if self.socket.lock().await.take().is_some() {
            debug!(device = %self.device, port = self.local_addr.port(), "telemetry port released");
        }
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    peer: Option<IpAddr>,
    codec: RecordCodec,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0_u8; MAX_DATAGRAM_LEN];

    loop {
        let (len, from) = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "telemetry receive failed");
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        if peer.is_some_and(|ip| ip != from.ip().to_canonical()) {
            trace!(%from, "ignoring datagram from foreign source");
            continue;
        }

        let Some(datagram) = buf.get(..len) else {
            continue;
        };
        for inbound in codec.decode_datagram(datagram) {
            match inbound {
                Inbound::Notification(n) => dispatcher.dispatch(&n.into_sample(SampleSource::Telemetry)),
                Inbound::Response(r) => trace!(%from, id = r.id, "ignoring response on telemetry socket"),
                Inbound::Malformed(m) => warn!(%from, reason = %m.reason, raw = %m.raw, "discarding malformed datagram"),
            }
        }
    }

    debug!(device = %dispatcher.device(), "telemetry loop exiting");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::types::{ParamRef, Sample, ValueFormat};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn free_udp_port() -> u16 {
        let probe = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        probe.local_addr().unwrap().port()
    }

    fn dispatcher(device: &DeviceAddress) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(device.clone(), None))
    }

    #[tokio::test]
    async fn second_bind_reports_port_in_use() {
        let port = free_udp_port().await;
        let device = DeviceAddress::with_ports("127.0.0.1", 5321, port);

        let first = TelemetryChannel::bind(&device, LOCALHOST, RecordCodec::default(), dispatcher(&device))
            .await
            .unwrap();
        let second = TelemetryChannel::bind(&device, LOCALHOST, RecordCodec::default(), dispatcher(&device)).await;
        assert!(matches!(second, Err(Error::PortInUse { port: p }) if p == port), "{second:?}");

        first.close().await;
        let third = TelemetryChannel::bind(&device, LOCALHOST, RecordCodec::default(), dispatcher(&device)).await;
        assert!(third.is_ok(), "port should be free after close");
    }

    #[tokio::test]
    async fn datagrams_reach_listeners() {
        let port = free_udp_port().await;
        let device = DeviceAddress::with_ports("127.0.0.1", 5321, port);
        let dispatcher = dispatcher(&device);
        let meter = ParamRef::new("InputMeter", 1).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        dispatcher.add_listener(
            &meter,
            ValueFormat::Value,
            Arc::new(move |s: &Sample| {
                let _ = tx.send(s.clone());
            }),
        );

        let channel = TelemetryChannel::bind(&device, LOCALHOST, RecordCodec::default(), Arc::clone(&dispatcher))
            .await
            .unwrap();
        channel.listen().await.unwrap();

        let sender = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        sender
            .send_to(
                b"{\"param\":\"InputMeter_1\",\"val\":-18.5,\"peak\":-6.0,\"clip\":false}\n",
                channel.local_addr(),
            )
            .await
            .unwrap();

        let sample = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sample.value.as_f64(), Some(-18.5));
        assert_eq!(sample.peak, Some(-6.0));
        assert_eq!(sample.source, SampleSource::Telemetry);

        channel.close().await;
        channel.close().await;
    }

    #[tokio::test]
    async fn foreign_sources_are_ignored() {
        let port = free_udp_port().await;
        // Device claims a different address than the sender below.
        let device = DeviceAddress::with_ports("192.0.2.10", 5321, port);
        let dispatcher = dispatcher(&device);
        let meter = ParamRef::new("InputMeter", 0).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        dispatcher.add_listener(
            &meter,
            ValueFormat::Value,
            Arc::new(move |_: &Sample| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let channel = TelemetryChannel::bind(&device, LOCALHOST, RecordCodec::default(), Arc::clone(&dispatcher))
            .await
            .unwrap();
        channel.listen().await.unwrap();

        let sender = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        sender
            .send_to(b"{\"param\":\"InputMeter_0\",\"val\":-1}", channel.local_addr())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(dispatcher.last_seen(&meter).is_none());
        channel.close().await;
    }
}
