//! In-memory transport for driving the pool without a network.

#![allow(dead_code)]

use crossbeam_channel::{Receiver, Sender};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use realtime_pool::protocol::{ControlMessage, ProtocolConfig};
use realtime_pool::{
    Connector, Envelope, EventType, Frame, InstanceDescriptor, PoolConfig, RealtimeError,
    ReconnectPolicy, Result, TableKey, WireEvent, WireLink,
};
use serde_json::{json, Value};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};

/// What the next handshake does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    Refuse,
}

/// Scripted connector. Each accepted handshake hands a [`MockServer`] to
/// the test through [`MockConnector::next_server`].
pub struct MockConnector {
    script: Mutex<VecDeque<Outcome>>,
    default: Outcome,
    attempts: AtomicUsize,
    servers_tx: Sender<MockServer>,
    servers_rx: Receiver<MockServer>,
    gate: Option<Arc<Semaphore>>,
}

impl MockConnector {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self::build(Outcome::Accept, None))
    }

    pub fn refusing() -> Arc<Self> {
        Arc::new(Self::build(Outcome::Refuse, None))
    }

    /// Handshakes wait until the returned semaphore is given permits.
    pub fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (Arc::new(Self::build(Outcome::Accept, Some(gate.clone()))), gate)
    }

    fn build(default: Outcome, gate: Option<Arc<Semaphore>>) -> Self {
        let (servers_tx, servers_rx) = crossbeam_channel::unbounded();
        Self {
            script: Mutex::new(VecDeque::new()),
            default,
            attempts: AtomicUsize::new(0),
            servers_tx,
            servers_rx,
            gate,
        }
    }

    /// Queue outcomes for the next handshakes; afterwards the default
    /// applies.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.script.lock().extend(outcomes);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn next_server(&self, timeout: Duration) -> Option<MockServer> {
        self.servers_rx.recv_timeout(timeout).ok()
    }
}

impl Connector for MockConnector {
    fn connect(&self, descriptor: &InstanceDescriptor) -> BoxFuture<'static, Result<WireLink>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().pop_front().unwrap_or(self.default);
        let servers = self.servers_tx.clone();
        let gate = self.gate.clone();
        let instance = descriptor.name.clone();

        Box::pin(async move {
            if let Some(gate) = gate {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|_| RealtimeError::Connection("gate closed".to_string()))?;
            }
            if outcome == Outcome::Refuse {
                return Err(RealtimeError::Connection("connection refused".to_string()));
            }

            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
            let (inbound_tx, inbound_rx) = mpsc::channel(256);
            let (frames_tx, frames_rx) = crossbeam_channel::unbounded();
            // Like a socket writer: stop and release the queue after Close.
            tokio::spawn(async move {
                while let Some(frame) = outbound_rx.recv().await {
                    let last = frame == Frame::Close;
                    if frames_tx.send(frame).is_err() || last {
                        break;
                    }
                }
            });
            let _ = servers.send(MockServer {
                instance,
                frames: frames_rx,
                inbound: inbound_tx,
            });

            Ok(WireLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        })
    }
}

/// Server side of one accepted mock socket. Dropping it closes the link.
pub struct MockServer {
    pub instance: String,
    frames: Receiver<Frame>,
    inbound: mpsc::Sender<WireEvent>,
}

impl MockServer {
    /// Frames written by the client, collected until nothing new arrives
    /// for `quiet` (or two seconds pass).
    pub fn frames(&self, quiet: Duration) -> Vec<Frame> {
        let deadline = Instant::now() + WAIT;
        let mut frames = Vec::new();
        while Instant::now() < deadline {
            match self.frames.recv_timeout(quiet) {
                Ok(frame) => frames.push(frame),
                Err(_) => break,
            }
        }
        frames
    }

    /// Text frames decoded as envelopes.
    pub fn envelopes(&self, quiet: Duration) -> Vec<Envelope> {
        self.frames(quiet)
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => Some(Envelope::decode(&text).unwrap()),
                Frame::Close => None,
            })
            .collect()
    }

    /// Control messages written by the client.
    pub fn control(&self, quiet: Duration) -> Vec<ControlMessage> {
        let protocol = ProtocolConfig::default();
        self.envelopes(quiet)
            .iter()
            .filter_map(|envelope| ControlMessage::from_envelope(envelope, &protocol))
            .collect()
    }

    /// Joins written by the client, as (table, events).
    pub fn joins(&self, quiet: Duration) -> Vec<(TableKey, BTreeSet<EventType>)> {
        joins_in(&self.control(quiet))
    }

    pub fn push_change(&self, schema: &str, table: &str, event: &str, record: Value) {
        let envelope = json!({
            "topic": format!("realtime:{schema}:{table}"),
            "event": "postgres_changes",
            "ref": null,
            "payload": {
                "data": {
                    "type": event,
                    "schema": schema,
                    "table": table,
                    "record": record,
                    "old_record": null,
                    "commit_timestamp": "2024-05-01T12:00:00Z"
                }
            }
        });
        self.push_raw(envelope.to_string());
    }

    pub fn push_raw(&self, text: impl Into<String>) {
        self.inbound
            .blocking_send(WireEvent::Message(text.into()))
            .unwrap();
    }

    /// Simulate the server dropping the socket.
    pub fn close_remote(&self) {
        self.inbound
            .blocking_send(WireEvent::Closed {
                remote: true,
                reason: "server restart".to_string(),
            })
            .unwrap();
    }
}

pub fn joins_in(control: &[ControlMessage]) -> Vec<(TableKey, BTreeSet<EventType>)> {
    control
        .iter()
        .filter_map(|message| match message {
            ControlMessage::Join { key, events } => Some((key.clone(), events.clone())),
            _ => None,
        })
        .collect()
}

/// Config with millisecond backoff and heartbeats effectively off.
pub fn fast_config() -> PoolConfig {
    PoolConfig {
        reconnect: ReconnectPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(40),
        },
        heartbeat_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

pub fn instance(name: &str) -> InstanceDescriptor {
    InstanceDescriptor::new(name, "https://db.example.test", "anon-key")
}

pub fn events(list: &[EventType]) -> BTreeSet<EventType> {
    list.iter().copied().collect()
}

/// Poll `condition` for up to two seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub const QUIET: Duration = Duration::from_millis(100);
pub const WAIT: Duration = Duration::from_secs(2);
