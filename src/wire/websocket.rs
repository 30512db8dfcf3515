//! Websocket transport built on tokio-tungstenite.

use super::{Connector, Frame, WireEvent, WireLink};
use crate::config::PoolConfig;
use crate::error::{RealtimeError, Result};
use crate::protocol::ProtocolConfig;
use crate::types::InstanceDescriptor;
use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, info, warn};

/// Build the realtime endpoint URL for an instance.
///
/// `https://host/` becomes `wss://host/realtime/v1/websocket?apikey=..&vsn=1.0.0`.
pub fn websocket_url(descriptor: &InstanceDescriptor, protocol: &ProtocolConfig) -> String {
    let base = descriptor.base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!(
        "{}{}?apikey={}&vsn={}",
        base,
        protocol.endpoint_path,
        descriptor.credential.expose(),
        protocol.version
    )
}

/// Connects to realtime endpoints over websockets.
#[derive(Clone, Debug)]
pub struct WebSocketConnector {
    protocol: ProtocolConfig,
    connect_timeout: Duration,
    inbound_buffer: usize,
}

impl WebSocketConnector {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            protocol: config.protocol.clone(),
            connect_timeout: config.connect_timeout,
            inbound_buffer: config.inbound_buffer,
        }
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, descriptor: &InstanceDescriptor) -> BoxFuture<'static, Result<WireLink>> {
        let url = websocket_url(descriptor, &self.protocol);
        let apikey = descriptor.credential.expose().to_string();
        let instance = descriptor.name.clone();
        let connect_timeout = self.connect_timeout;
        let inbound_buffer = self.inbound_buffer;

        Box::pin(async move {
            let mut request = url.into_client_request()?;
            let header = HeaderValue::from_str(&apikey)
                .map_err(|e| RealtimeError::Configuration(format!("invalid credential: {e}")))?;
            request.headers_mut().insert("apikey", header);

            let (stream, _response) =
                tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(request))
                    .await
                    .map_err(|_| {
                        RealtimeError::Connection(format!(
                            "handshake timed out after {connect_timeout:?}"
                        ))
                    })??;
            info!(instance = %instance, "websocket handshake complete");

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::channel(inbound_buffer);
            spawn_pump(instance, stream, outbound_rx, inbound_tx);

            Ok(WireLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        })
    }
}

/// Start the writer and reader tasks for one socket.
///
/// The writer owns the sink and never waits on the inbound queue, so a
/// full queue (a slow handler) stalls reading but never writing. The
/// writer drops `outbound` once it has written a close frame.
fn spawn_pump<S>(
    instance: String,
    stream: S,
    outbound: mpsc::UnboundedReceiver<Frame>,
    inbound: mpsc::Sender<WireEvent>,
) where
    S: Stream<Item = std::result::Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin
        + Send
        + 'static,
{
    let (write, read) = stream.split();
    let (pongs_tx, pongs_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_frames(instance.clone(), write, outbound, pongs_rx));
    tokio::spawn(read_frames(instance, read, inbound, pongs_tx, writer));
}

/// Drain queued frames into the socket. Returns why writing stopped.
async fn write_frames<W>(
    instance: String,
    mut write: W,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    mut pongs: mpsc::UnboundedReceiver<Message>,
) -> String
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(Frame::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        warn!(instance = %instance, error = %e, "websocket write failed");
                        return e.to_string();
                    }
                }
                Some(Frame::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    debug!(instance = %instance, "close frame written");
                    return "closed locally".to_string();
                }
            },
            Some(pong) = pongs.recv() => {
                let _ = write.send(pong).await;
            }
        }
    }
}

/// Forward inbound frames in order until the socket or the writer stops,
/// then report the close. Exits early if the inbound consumer goes away.
async fn read_frames<R>(
    instance: String,
    mut read: R,
    inbound: mpsc::Sender<WireEvent>,
    pongs: mpsc::UnboundedSender<Message>,
    mut writer: JoinHandle<String>,
) where
    R: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    let closed = loop {
        let message = tokio::select! {
            message = read.next() => message,
            stopped = &mut writer => {
                let reason = stopped.unwrap_or_else(|e| e.to_string());
                break WireEvent::Closed { remote: false, reason };
            }
        };
        let event = match message {
            Some(Ok(Message::Text(text))) => WireEvent::Message(text.as_str().to_owned()),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => WireEvent::Message(text),
                Err(_) => {
                    debug!(instance = %instance, "dropping non-utf8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = pongs.send(Message::Pong(data));
                continue;
            }
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                    .unwrap_or_else(|| "no close frame".to_string());
                break WireEvent::Closed { remote: true, reason };
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                let _ = inbound.send(WireEvent::Error(e.to_string())).await;
                break WireEvent::Closed { remote: false, reason: e.to_string() };
            }
            None => break WireEvent::Closed { remote: true, reason: "stream ended".to_string() },
        };
        if inbound.send(event).await.is_err() {
            return;
        }
    };

    debug!(instance = %instance, ?closed, "websocket reader exiting");
    let _ = inbound.send(closed).await;
}
