//! Transport seam between managed connections and the socket.
//!
//! A [`Connector`] performs the handshake and hands back a [`WireLink`]:
//! an outbound frame queue drained by a single writer, and an inbound
//! queue of [`WireEvent`]s raised by the socket reader. Open is signalled
//! by the connect future resolving, close and error by inbound events.
//!
//! The writer must keep draining the outbound queue regardless of inbound
//! backpressure, and must drop its receiver once it has written
//! [`Frame::Close`]; shutdown waits on that to know the socket is flushed.

mod client;
mod websocket;

pub use client::WireClient;
pub use websocket::{websocket_url, WebSocketConnector};

use crate::error::Result;
use crate::types::InstanceDescriptor;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

/// Frames queued for the socket writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Send a close frame and stop writing.
    Close,
}

/// Notifications raised by the socket reader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireEvent {
    /// A text frame.
    Message(String),
    /// A transport error that did not (yet) close the socket.
    Error(String),
    /// The socket is gone. `remote` is true when the peer closed it.
    Closed { remote: bool, reason: String },
}

/// Both halves of an established connection.
pub struct WireLink {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::Receiver<WireEvent>,
}

/// Establishes connections to backend instances.
pub trait Connector: Send + Sync + 'static {
    /// Perform the handshake for `descriptor`. Resolves once the socket is
    /// open, or with a `Connection` error.
    fn connect(&self, descriptor: &InstanceDescriptor) -> BoxFuture<'static, Result<WireLink>>;
}
