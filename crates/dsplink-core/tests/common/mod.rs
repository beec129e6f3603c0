// In-process stand-in for a DSP appliance: a TCP command port speaking
// newline-delimited JSON and a UDP sender for telemetry.
#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use dsplink_core::{ChannelConfig, DeviceAddress, DeviceConfig, ReconnectConfig};

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[derive(Default)]
struct State {
    connections: AtomicUsize,
    requests: Mutex<Vec<Value>>,
    params: Mutex<HashMap<String, Value>>,
    held: Mutex<HashSet<String>>,
    rejected: Mutex<HashMap<String, String>>,
}

pub struct FakeDevice {
    pub address: DeviceAddress,
    state: Arc<State>,
    generation: watch::Sender<u64>,
    accept_task: JoinHandle<()>,
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.generation.send_modify(|g| *g += 1);
    }
}

impl FakeDevice {
    pub async fn start() -> Self {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let command_port = listener.local_addr().unwrap().port();
        let telemetry_port = free_udp_port().await;

        let state = Arc::new(State::default());
        let (generation, _) = watch::channel(0_u64);

        let accept_task = tokio::spawn({
            let state = Arc::clone(&state);
            let generation = generation.clone();
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else { break };
                    state.connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, Arc::clone(&state), generation.subscribe()));
                }
            }
        });

        Self {
            address: DeviceAddress::with_ports("127.0.0.1", command_port, telemetry_port),
            state,
            generation,
            accept_task,
        }
    }

    /// Device config with short timeouts suited to tests.
    pub fn config(&self) -> DeviceConfig {
        DeviceConfig {
            channel: ChannelConfig {
                request_timeout: Duration::from_secs(2),
                reconnect: ReconnectConfig {
                    initial_delay: Duration::from_millis(20),
                    max_delay: Duration::from_millis(100),
                    ..ReconnectConfig::default()
                },
                ..ChannelConfig::default()
            },
            telemetry_bind: LOCALHOST,
            ..DeviceConfig::new(self.address.clone())
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().unwrap().clone()
    }

    /// How many `method` requests named `param` the device has seen.
    pub fn count(&self, method: &str, param: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r["method"] == method && r["params"]["param"] == param)
            .count()
    }

    /// Never answer requests for `param`.
    pub fn hold(&self, param: &str) {
        self.state.held.lock().unwrap().insert(param.to_string());
    }

    /// Answer requests for `param` with an error.
    pub fn reject(&self, param: &str, message: &str) {
        self.state
            .rejected
            .lock()
            .unwrap()
            .insert(param.to_string(), message.to_string());
    }

    /// Close every open command connection, as a power-cycled device would.
    pub fn drop_connections(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    /// Push one telemetry datagram to the client's telemetry port.
    pub async fn send_telemetry(&self, payload: &str) {
        let socket = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let target = SocketAddr::new(LOCALHOST, self.address.telemetry_port());
        socket.send_to(payload.as_bytes(), target).await.unwrap();
    }

    /// Wait until `check` holds, polling the recorded state.
    pub async fn wait_until(&self, what: &str, check: impl Fn(&Self) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check(self) {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub async fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
    socket.local_addr().unwrap().port()
}

/// A port nothing listens on.
pub async fn closed_tcp_port() -> u16 {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn serve(stream: TcpStream, state: Arc<State>, mut generation: watch::Receiver<u64>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            _ = generation.changed() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
        };
        let Ok(request) = serde_json::from_str::<Value>(&line) else { continue };
        state.requests.lock().unwrap().push(request.clone());

        let Some(reply) = respond(&state, &request) else { continue };
        let mut bytes = reply.to_string().into_bytes();
        bytes.push(b'\n');
        if write.write_all(&bytes).await.is_err() {
            break;
        }
    }
}

fn respond(state: &State, request: &Value) -> Option<Value> {
    let id = request["id"].clone();
    let param = request["params"]["param"].as_str().unwrap_or_default().to_string();

    if state.held.lock().unwrap().contains(&param) {
        return None;
    }
    if let Some(message) = state.rejected.lock().unwrap().get(&param) {
        return Some(json!({ "id": id, "error": message }));
    }

    let result = match request["method"].as_str().unwrap_or_default() {
        "set" => {
            let value = request["params"]["val"].clone();
            state.params.lock().unwrap().insert(param, value.clone());
            value
        }
        "get" => state.params.lock().unwrap().get(&param).cloned().unwrap_or(json!(0.0)),
        _ => json!(true),
    };
    Some(json!({ "id": id, "result": result }))
}
