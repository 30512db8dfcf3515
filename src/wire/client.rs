//! Protocol-level handle on one open socket.

use super::Frame;
use crate::error::{RealtimeError, Result};
use crate::protocol::{ControlMessage, Envelope, ProtocolConfig, Ref, RefCounter};
use crate::types::{EventType, TableKey};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Encodes control messages and queues them for the socket writer.
///
/// All sends go through one queue, so frames are never interleaved.
#[derive(Clone)]
pub struct WireClient {
    outbound: mpsc::UnboundedSender<Frame>,
    refs: Arc<RefCounter>,
    protocol: Arc<ProtocolConfig>,
}

impl WireClient {
    pub fn new(
        outbound: mpsc::UnboundedSender<Frame>,
        refs: Arc<RefCounter>,
        protocol: Arc<ProtocolConfig>,
    ) -> Self {
        Self {
            outbound,
            refs,
            protocol,
        }
    }

    /// Join `key`'s channel for `events`. Replaces any earlier join.
    pub fn join(&self, key: &TableKey, events: &BTreeSet<EventType>) -> Result<Ref> {
        self.control(ControlMessage::Join {
            key: key.clone(),
            events: events.clone(),
        })
    }

    pub fn leave(&self, key: &TableKey) -> Result<Ref> {
        self.control(ControlMessage::Leave { key: key.clone() })
    }

    pub fn heartbeat(&self) -> Result<Ref> {
        self.control(ControlMessage::Heartbeat)
    }

    fn control(&self, message: ControlMessage) -> Result<Ref> {
        let reference = self.refs.next();
        self.send(&message.to_envelope(&self.protocol, reference))?;
        Ok(reference)
    }

    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        let text = envelope.encode()?;
        trace!(topic = %envelope.topic, event = %envelope.event, "queueing frame");
        self.outbound
            .send(Frame::Text(text))
            .map_err(|_| RealtimeError::Connection("socket writer is gone".to_string()))
    }

    /// Ask the writer to send a close frame. Idempotent.
    pub fn close(&self) {
        let _ = self.outbound.send(Frame::Close);
    }

    /// Resolves once the writer has stopped draining this client's queue,
    /// i.e. after it wrote the close frame or the socket died.
    pub fn flushed(&self) -> impl Future<Output = ()> + Send + 'static {
        let outbound = self.outbound.clone();
        async move { outbound.closed().await }
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (WireClient, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = WireClient::new(
            tx,
            Arc::new(RefCounter::new()),
            Arc::new(ProtocolConfig::default()),
        );
        (client, rx)
    }

    fn next_envelope(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Envelope {
        match rx.try_recv().unwrap() {
            Frame::Text(text) => Envelope::decode(&text).unwrap(),
            Frame::Close => panic!("Expected text frame"),
        }
    }

    #[test]
    fn test_control_messages_get_increasing_refs() {
        let (client, mut rx) = client();
        let key = TableKey::new("public", "users").unwrap();
        let events: BTreeSet<EventType> = [EventType::Insert].into_iter().collect();

        let join = client.join(&key, &events).unwrap();
        let heartbeat = client.heartbeat().unwrap();
        let leave = client.leave(&key).unwrap();
        assert!(join < heartbeat && heartbeat < leave);

        assert_eq!(next_envelope(&mut rx).event, "phx_join");
        assert_eq!(next_envelope(&mut rx).event, "heartbeat");
        let leave_frame = next_envelope(&mut rx);
        assert_eq!(leave_frame.event, "phx_leave");
        assert_eq!(leave_frame.reference(), Some(leave));
    }

    #[test]
    fn test_send_after_writer_dropped_is_connection_error() {
        let (client, rx) = client();
        drop(rx);
        assert!(!client.is_open());
        assert!(matches!(
            client.heartbeat(),
            Err(RealtimeError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_flushed_resolves_when_writer_stops() {
        let (client, mut rx) = client();
        let flushed = client.flushed();
        client.close();

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if frame == Frame::Close {
                    break;
                }
            }
        });
        tokio::time::timeout(std::time::Duration::from_secs(1), flushed)
            .await
            .expect("writer never released the queue");
        writer.await.unwrap();
        assert!(!client.is_open());
    }

    #[test]
    fn test_close_queues_close_frame() {
        let (client, mut rx) = client();
        client.close();
        assert_eq!(rx.try_recv().unwrap(), Frame::Close);
    }
}
