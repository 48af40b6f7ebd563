use crate::clock::unix_now_ms;
use crate::error::Error;
use crate::stream::types::{
    parse_stream_envelope, OutboundEnvelope, StreamConfig, StreamConnectionState,
    StreamStatusSnapshot,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub type StreamTransport = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub type TopicHandler = Arc<dyn Fn(&simd_json::OwnedValue) -> Result<(), Error> + Send + Sync>;

#[derive(Default)]
struct SubscriptionRegistry {
    next_id: u64,
    topics: HashMap<String, Vec<(u64, TopicHandler)>>,
}

impl SubscriptionRegistry {
    fn insert(&mut self, topic: &str, handler: TopicHandler) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    fn remove(&mut self, topic: &str, id: u64) -> bool {
        let Some(handlers) = self.topics.get_mut(topic) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    fn handlers_for(&self, topic: &str) -> Vec<(u64, TopicHandler)> {
        self.topics
            .get(topic)
            .map(|handlers| handlers.clone())
            .unwrap_or_default()
    }
}

/// Capability to remove exactly the handler it was returned for; sibling
/// handlers on the same topic are unaffected.
pub struct Subscription {
    registry: Arc<Mutex<SubscriptionRegistry>>,
    topic: String,
    id: u64,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn unsubscribe(self) {
        self.registry.lock().remove(&self.topic, self.id);
    }
}

enum ConnectionDirective {
    Cancelled,
    Lost,
    ReconnectRequested,
}

/// The single process-wide duplex connection to the marketplace. One run
/// loop owns the transport; everything else talks to it through the
/// registry, the outbound slot, and the reconnect signal.
pub struct StreamClient {
    config: StreamConfig,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    state: RwLock<StreamConnectionState>,
    status: RwLock<StreamStatusSnapshot>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    reconnect_signal: Notify,
    error_flag: AtomicBool,
}

impl StreamClient {
    pub fn new(config: StreamConfig) -> Self {
        let endpoint = config.endpoint();
        Self {
            config,
            registry: Arc::new(Mutex::new(SubscriptionRegistry::default())),
            state: RwLock::new(StreamConnectionState::Disconnected),
            status: RwLock::new(StreamStatusSnapshot::idle(
                endpoint,
                Some("stream idle".to_string()),
            )),
            outbound: Mutex::new(None),
            reconnect_signal: Notify::new(),
            error_flag: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> StreamConnectionState {
        *self.state.read()
    }

    pub fn status(&self) -> StreamStatusSnapshot {
        self.status.read().clone()
    }

    pub fn has_error(&self) -> bool {
        self.error_flag.load(Ordering::Relaxed)
    }

    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&simd_json::OwnedValue) -> Result<(), Error> + Send + Sync + 'static,
    {
        let id = self.registry.lock().insert(topic, Arc::new(handler));
        Subscription {
            registry: Arc::clone(&self.registry),
            topic: topic.to_string(),
            id,
        }
    }

    /// Attempts to transmit immediately. Returns false when the connection
    /// is not Open; nothing is queued for later delivery.
    pub fn send<T: Serialize>(&self, message_type: &str, data: &T) -> bool {
        if self.state() != StreamConnectionState::Open {
            return false;
        }
        let Some(sender) = self.outbound.lock().clone() else {
            return false;
        };
        let envelope = OutboundEnvelope { message_type, data };
        match simd_json::serde::to_string(&envelope) {
            Ok(text) => sender.send(text).is_ok(),
            Err(error) => {
                tracing::warn!(%error, message_type, "failed to encode outbound envelope");
                false
            }
        }
    }

    /// Forces teardown of the current transport and an immediate fresh
    /// attempt, skipping any pending retry delay. A no-op while the client
    /// is not running, so a stale request cannot fire after a later start.
    pub fn reconnect(&self) {
        if self.state() == StreamConnectionState::Disconnected {
            return;
        }
        self.reconnect_signal.notify_one();
    }

    /// The unified connection routine: connect, dispatch, tear down, wait,
    /// repeat. Both the automatic recovery path and `reconnect()` flow
    /// through this loop; cancellation is checked before any retry is
    /// scheduled, so an intentional close never reconnects.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let endpoint = self.config.endpoint();
        let mut reconnect_attempts: u32 = 0;

        while !cancel.is_cancelled() {
            self.set_state(
                StreamConnectionState::Connecting,
                Some(if reconnect_attempts == 0 {
                    "opening stream".to_string()
                } else {
                    format!("reconnect attempt {reconnect_attempts}")
                }),
            );

            let retry_delay_ms = match connect_stream(&endpoint).await {
                Ok(transport) => {
                    reconnect_attempts = 0;
                    self.error_flag.store(false, Ordering::Relaxed);
                    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                    *self.outbound.lock() = Some(outbound_tx);
                    self.set_state(
                        StreamConnectionState::Open,
                        Some("stream connected".to_string()),
                    );
                    tracing::info!(%endpoint, "stream connected");

                    let directive = self.drive(transport, outbound_rx, &cancel).await;
                    // Unsent messages die with the transport they were
                    // accepted for.
                    self.outbound.lock().take();

                    match directive {
                        ConnectionDirective::Cancelled => break,
                        ConnectionDirective::ReconnectRequested => continue,
                        ConnectionDirective::Lost => {
                            self.set_state(
                                StreamConnectionState::Connecting,
                                Some("stream lost".to_string()),
                            );
                            self.config.retry_after_loss_ms
                        }
                    }
                }
                Err(error) => {
                    self.error_flag.store(true, Ordering::Relaxed);
                    tracing::warn!(%endpoint, %error, "stream connect failed");
                    self.set_state(
                        StreamConnectionState::Connecting,
                        Some(format!("connect failed: {error}")),
                    );
                    self.config.retry_after_failure_ms
                }
            };

            reconnect_attempts = reconnect_attempts.saturating_add(1);
            self.status.write().reconnect_attempts = reconnect_attempts;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.reconnect_signal.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(retry_delay_ms)) => {}
            }
        }

        self.outbound.lock().take();
        self.set_state(
            StreamConnectionState::Disconnected,
            Some("stream stopped".to_string()),
        );
    }

    async fn drive(
        &self,
        transport: StreamTransport,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
        cancel: &CancellationToken,
    ) -> ConnectionDirective {
        let (mut sink, mut source) = transport.split();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_state(
                        StreamConnectionState::Closing,
                        Some("stream closing".to_string()),
                    );
                    let _ = sink.close().await;
                    return ConnectionDirective::Cancelled;
                }
                _ = self.reconnect_signal.notified() => {
                    self.set_state(
                        StreamConnectionState::Closing,
                        Some("reconnect requested".to_string()),
                    );
                    let _ = sink.close().await;
                    return ConnectionDirective::ReconnectRequested;
                }
                queued = outbound_rx.recv() => {
                    let Some(text) = queued else {
                        return ConnectionDirective::Lost;
                    };
                    if let Err(error) = sink.send(Message::Text(text)).await {
                        tracing::warn!(%error, "stream send failed");
                        self.error_flag.store(true, Ordering::Relaxed);
                        return ConnectionDirective::Lost;
                    }
                }
                frame = source.next() => {
                    let Some(frame) = frame else {
                        tracing::warn!("stream ended by peer");
                        return ConnectionDirective::Lost;
                    };
                    match frame {
                        Ok(Message::Text(payload)) => self.dispatch_payload(payload.into_bytes()),
                        Ok(Message::Binary(payload)) => self.dispatch_payload(payload),
                        Ok(Message::Close(_)) => {
                            tracing::info!("stream closed by peer");
                            return ConnectionDirective::Lost;
                        }
                        Ok(_) => {}
                        Err(error) => {
                            tracing::warn!(%error, "stream frame error");
                            self.error_flag.store(true, Ordering::Relaxed);
                            return ConnectionDirective::Lost;
                        }
                    }
                }
            }
        }
    }

    fn dispatch_payload(&self, mut payload: Vec<u8>) {
        match parse_stream_envelope(payload.as_mut_slice()) {
            Ok(envelope) => {
                self.status.write().last_message_ms = Some(unix_now_ms());
                self.dispatch(&envelope.message_type, &envelope.data);
            }
            // Malformed payloads are dropped without tearing down the
            // connection.
            Err(error) => tracing::debug!(%error, "dropping malformed stream payload"),
        }
    }

    pub(crate) fn dispatch(&self, topic: &str, data: &simd_json::OwnedValue) {
        let handlers = self.registry.lock().handlers_for(topic);
        for (id, handler) in handlers {
            if let Err(error) = handler(data) {
                tracing::warn!(topic, handler = id, %error, "topic handler failed");
            }
        }
    }

    fn set_state(&self, state: StreamConnectionState, reason: Option<String>) {
        *self.state.write() = state;
        let mut status = self.status.write();
        status.state = state;
        status.reason = reason;
        if state == StreamConnectionState::Open {
            status.reconnect_attempts = 0;
        }
    }
}

async fn connect_stream(endpoint: &str) -> Result<StreamTransport, Error> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let (transport, _) = connect_async_with_config(endpoint, Some(ws_config), true).await?;
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::types::StreamConfigArgs;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn test_config(host: &str) -> StreamConfig {
        StreamConfigArgs {
            host: Some(host.to_string()),
            secure: Some(false),
            retry_after_loss_ms: Some(50),
            retry_after_failure_ms: Some(50),
        }
        .normalize()
        .expect("test config should be valid")
    }

    fn envelope_data(raw: &[u8]) -> simd_json::OwnedValue {
        let mut payload = raw.to_vec();
        simd_json::to_owned_value(payload.as_mut_slice()).expect("test payload should parse")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let started = Instant::now();
        while !condition() {
            if started.elapsed() > Duration::from_secs(5) {
                panic!("timed out waiting for condition");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn dispatches_in_registration_order() {
        let client = StreamClient::new(test_config("localhost"));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first_order = Arc::clone(&order);
        let _first = client.subscribe("new-bid", move |_data| {
            first_order.lock().push(1_u32);
            Ok(())
        });
        let second_order = Arc::clone(&order);
        let _second = client.subscribe("new-bid", move |_data| {
            second_order.lock().push(2_u32);
            Ok(())
        });

        client.dispatch("new-bid", &envelope_data(br#"{"auctionId":1}"#));
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn handler_failure_does_not_block_later_handlers() {
        let client = StreamClient::new(test_config("localhost"));
        let order = Arc::new(Mutex::new(Vec::new()));

        let failing_order = Arc::clone(&order);
        let _failing = client.subscribe("new-bid", move |_data| {
            failing_order.lock().push(1_u32);
            Err(Error::InvalidArgument("handler refused payload".to_string()))
        });
        let healthy_order = Arc::clone(&order);
        let _healthy = client.subscribe("new-bid", move |_data| {
            healthy_order.lock().push(2_u32);
            Ok(())
        });

        client.dispatch("new-bid", &envelope_data(br#"{"auctionId":1}"#));
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn unsubscribe_removes_exactly_one_handler() {
        let client = StreamClient::new(test_config("localhost"));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first_order = Arc::clone(&order);
        let first = client.subscribe("new-bid", move |_data| {
            first_order.lock().push(1_u32);
            Ok(())
        });
        let second_order = Arc::clone(&order);
        let _second = client.subscribe("new-bid", move |_data| {
            second_order.lock().push(2_u32);
            Ok(())
        });

        let data = envelope_data(br#"{"auctionId":1}"#);
        client.dispatch("new-bid", &data);
        first.unsubscribe();
        client.dispatch("new-bid", &data);

        assert_eq!(*order.lock(), vec![1, 2, 2]);
    }

    #[test]
    fn unknown_topic_dispatch_is_a_no_op() {
        let client = StreamClient::new(test_config("localhost"));
        client.dispatch("unknown", &envelope_data(br#"{}"#));
    }

    #[test]
    fn send_returns_false_when_not_open() {
        let client = StreamClient::new(test_config("localhost"));
        assert!(!client.send("ping", &1_u32));
    }

    async fn spawn_stream_server() -> (u16, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("test listener should bind");
        let port = listener
            .local_addr()
            .expect("listener should have an address")
            .port();
        let accepted = Arc::new(AtomicU32::new(0));
        let accept_counter = Arc::clone(&accepted);

        tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    break;
                };
                accept_counter.fetch_add(1, Ordering::SeqCst);
                let Ok(mut socket) = tokio_tungstenite::accept_async(tcp).await else {
                    continue;
                };
                let greeting = r#"{"type":"new-bid","data":{"auctionId":42,"amount":1.5}}"#;
                if socket.send(Message::Text(greeting.to_string())).await.is_err() {
                    continue;
                }
                while let Some(frame) = socket.next().await {
                    match frame {
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
            }
        });

        (port, accepted)
    }

    #[tokio::test]
    async fn forced_reconnect_keeps_a_single_live_transport() {
        let (port, accepted) = spawn_stream_server().await;
        let client = Arc::new(StreamClient::new(test_config(&format!("127.0.0.1:{port}"))));

        let received = Arc::new(AtomicU32::new(0));
        let received_counter = Arc::clone(&received);
        let _subscription = client.subscribe("new-bid", move |data| {
            use simd_json::prelude::*;
            assert_eq!(
                data.get("auctionId").and_then(|value| value.as_u64()),
                Some(42)
            );
            received_counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let cancel = CancellationToken::new();
        let run_handle = tokio::spawn(Arc::clone(&client).run(cancel.clone()));

        wait_until(|| received.load(Ordering::SeqCst) >= 1).await;
        assert_eq!(client.state(), StreamConnectionState::Open);
        assert!(client.send("watch", &simd_json::OwnedValue::from("auction-42")));

        client.reconnect();
        wait_until(|| {
            accepted.load(Ordering::SeqCst) >= 2 && received.load(Ordering::SeqCst) >= 2
        })
        .await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        cancel.cancel();
        run_handle.await.expect("run loop should exit cleanly");
        assert_eq!(client.state(), StreamConnectionState::Disconnected);
        assert!(!client.send("watch", &simd_json::OwnedValue::from("auction-42")));

        // No reconnect may be scheduled after disposal.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connect_failure_retries_until_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("probe listener should bind");
        let port = listener
            .local_addr()
            .expect("listener should have an address")
            .port();
        drop(listener);

        let client = Arc::new(StreamClient::new(test_config(&format!("127.0.0.1:{port}"))));
        let cancel = CancellationToken::new();
        let run_handle = tokio::spawn(Arc::clone(&client).run(cancel.clone()));

        wait_until(|| client.status().reconnect_attempts >= 2).await;
        assert!(client.has_error());
        assert_eq!(client.state(), StreamConnectionState::Connecting);

        cancel.cancel();
        run_handle.await.expect("run loop should exit cleanly");
        assert_eq!(client.state(), StreamConnectionState::Disconnected);
    }
}
