//! C1 — duplex protocol transport.
//!
//! One persistent bidirectional websocket carrying framed JSON. Multiplexes
//! request/response pairs by integer id and fans out server-initiated events to
//! session-scoped and global subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{Error, Result};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TIMEOUT: Duration = Duration::from_secs(300);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Clamp a caller-supplied timeout to `[0, 300_000ms]` per spec §8 boundary behavior.
pub fn clamp_timeout(timeout: Duration) -> Duration {
    timeout.min(MAX_TIMEOUT)
}

#[derive(Debug, serde::Serialize)]
struct OutboundFrame<'a> {
    id: i64,
    method: &'a str,
    params: &'a Value,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

#[derive(Debug, serde::Deserialize)]
struct InboundFrame {
    id: Option<i64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<InboundError>,
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct InboundError {
    message: String,
}

struct PendingCommand {
    resolver: oneshot::Sender<Result<Value>>,
}

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

struct ListenerSet {
    next_id: u64,
    callbacks: HashMap<u64, Listener>,
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self {
            next_id: 0,
            callbacks: HashMap::new(),
        }
    }
}

/// Handle returned by `on()`; pass to `off()` to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<i64, PendingCommand>>,
    listeners: Mutex<HashMap<String, ListenerSet>>,
    next_id: AtomicI64,
    closing: std::sync::atomic::AtomicBool,
}

/// Optional exponential-backoff auto-reconnect policy (spec §4.1
/// "Reconnection"). `delay = base · 2^attempt` capped at `max_delay`, up to
/// `max_retries` attempts before giving up.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_retries: 5,
        }
    }
}

type ReaderTask = Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>;

/// One persistent duplex connection to the remote debugging endpoint.
pub struct Transport {
    shared: Arc<Shared>,
    sink: Arc<Mutex<WsSink>>,
    reader_task: ReaderTask,
    connected: Arc<RwLock<bool>>,
}

impl Transport {
    /// Connect to a `ws://`/`wss://` endpoint URL and start the reader loop.
    /// No auto-reconnect: an unexpected close stays closed.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        Self::connect_inner(ws_url, None).await
    }

    /// Connect with auto-reconnect enabled. An unexpected close triggers the
    /// exponential-backoff loop in `config`; an intentional `close()` suppresses it.
    pub async fn connect_with_reconnect(ws_url: &str, config: ReconnectConfig) -> Result<Self> {
        Self::connect_inner(ws_url, Some(config)).await
    }

    async fn connect_inner(ws_url: &str, reconnect: Option<ReconnectConfig>) -> Result<Self> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| Error::connection(format!("failed to connect to {ws_url}: {e}")))?;
        let (sink, source) = ws_stream.split();

        let shared = Arc::new(Shared::default());
        let connected = Arc::new(RwLock::new(true));
        let sink = Arc::new(Mutex::new(sink));
        let reader_task: ReaderTask = Arc::new(Mutex::new(None));

        let task = Self::spawn_reader(
            shared.clone(),
            source,
            connected.clone(),
            sink.clone(),
            reader_task.clone(),
            ws_url.to_string(),
            reconnect,
        );
        *reader_task.lock().await = Some(task);

        Ok(Self {
            shared,
            sink,
            reader_task,
            connected,
        })
    }

    /// Runs the reader loop to completion, then — unless the close was
    /// intentional or no reconnect policy is configured — hands off to the
    /// reconnect loop. Event subscriptions (`shared.listeners`) survive a
    /// reconnect; pending commands do not (already rejected on close).
    #[allow(clippy::too_many_arguments)]
    fn spawn_reader(
        shared: Arc<Shared>,
        source: WsSource,
        connected: Arc<RwLock<bool>>,
        sink: Arc<Mutex<WsSink>>,
        reader_task: ReaderTask,
        ws_url: String,
        reconnect: Option<ReconnectConfig>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            Self::reader_loop(shared.clone(), source, connected.clone()).await;

            if shared.closing.load(Ordering::SeqCst) {
                return;
            }
            if let Some(config) = reconnect {
                Self::reconnect_loop(shared, connected, sink, reader_task, ws_url, config).await;
            }
        })
    }

    /// Exponential-backoff reconnect attempts, capped at `max_retries`. On
    /// success, replaces the socket and restarts the reader loop (itself
    /// capable of triggering another reconnect on a later close).
    async fn reconnect_loop(
        shared: Arc<Shared>,
        connected: Arc<RwLock<bool>>,
        sink: Arc<Mutex<WsSink>>,
        reader_task: ReaderTask,
        ws_url: String,
        config: ReconnectConfig,
    ) {
        for attempt in 0..config.max_retries {
            if shared.closing.load(Ordering::SeqCst) {
                return;
            }
            let delay = config
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(config.max_delay);
            tokio::time::sleep(delay).await;

            if shared.closing.load(Ordering::SeqCst) {
                return;
            }

            match tokio_tungstenite::connect_async(&ws_url).await {
                Ok((ws_stream, _)) => {
                    let (new_sink, new_source) = ws_stream.split();
                    *sink.lock().await = new_sink;
                    *connected.write().await = true;
                    tracing::info!(attempt = attempt + 1, %ws_url, "transport reconnected");

                    let task = Self::spawn_reader(
                        shared,
                        new_source,
                        connected,
                        sink,
                        reader_task.clone(),
                        ws_url,
                        Some(config),
                    );
                    *reader_task.lock().await = Some(task);
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, %ws_url, "reconnect attempt failed: {e}");
                }
            }
        }
        tracing::warn!(%ws_url, max_retries = config.max_retries, "giving up reconnecting");
    }

    async fn reader_loop(shared: Arc<Shared>, mut source: WsSource, connected: Arc<RwLock<bool>>) {
        while let Some(msg) = source.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(_) => break,
            };
            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            let frame: InboundFrame = match serde_json::from_str(&text) {
                Ok(f) => f,
                Err(_) => continue,
            };

            if let Some(id) = frame.id {
                let pending = {
                    let mut map = shared.pending.lock().await;
                    map.remove(&id)
                };
                if let Some(pending) = pending {
                    let outcome = if let Some(err) = frame.error {
                        Err(Error::from_protocol_message(err.message))
                    } else {
                        Ok(frame.result.unwrap_or(Value::Null))
                    };
                    let _ = pending.resolver.send(outcome);
                }
                continue;
            }

            if let Some(method) = frame.method {
                let params = frame.params.unwrap_or(Value::Null);
                Self::dispatch_event(&shared, frame.session_id.as_deref(), &method, &params).await;
            }
        }

        *connected.write().await = false;
        Self::reject_all_pending(&shared, Error::connection("connection closed")).await;
        Self::dispatch_event(&shared, None, "__connection_closed", &Value::Null).await;
    }

    async fn dispatch_event(shared: &Arc<Shared>, session_id: Option<&str>, method: &str, params: &Value) {
        // Collect callbacks under the lock, then invoke after releasing it so a
        // listener is free to subscribe/unsubscribe without deadlocking.
        let mut to_invoke: Vec<Listener> = Vec::new();
        {
            let listeners = shared.listeners.lock().await;
            if let Some(session_id) = session_id {
                let key = format!("{session_id}:{method}");
                if let Some(set) = listeners.get(&key) {
                    to_invoke.extend(set.callbacks.values().cloned());
                }
            }
            if let Some(set) = listeners.get(method) {
                to_invoke.extend(set.callbacks.values().cloned());
            }
        }
        for cb in &to_invoke {
            Self::invoke_listener(cb, params);
        }
    }

    /// Listener exceptions are caught and logged; they never abort the pipeline.
    fn invoke_listener(cb: &Listener, params: &Value) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(params)));
        if let Err(_) = result {
            tracing::warn!("event listener panicked, ignoring");
        }
    }

    async fn reject_all_pending(shared: &Arc<Shared>, err: Error) {
        let mut pending = shared.pending.lock().await;
        for (_, cmd) in pending.drain() {
            let msg = Error::new(err.kind, err.message.clone());
            let _ = cmd.resolver.send(Err(msg));
        }
    }

    pub async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }

    /// Send a top-level (browser-scoped) command.
    pub async fn send<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R> {
        self.send_with_timeout(method, params, None, DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    /// Send a command scoped to a session id.
    pub async fn send_session<R: DeserializeOwned>(
        &self,
        session_id: &str,
        method: &str,
        params: Value,
    ) -> Result<R> {
        self.send_with_timeout(method, params, Some(session_id), DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    pub async fn send_with_timeout<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<R> {
        if !self.is_connected().await {
            return Err(Error::connection(format!(
                "send while not connected: {method}"
            )));
        }
        let timeout = clamp_timeout(timeout);

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().await;
            pending.insert(id, PendingCommand { resolver: tx });
        }

        let frame = OutboundFrame {
            id,
            method,
            params: &params,
            session_id,
        };
        let text = serde_json::to_string(&frame)
            .map_err(|e| Error::protocol(format!("failed to serialize frame: {e}")))?;

        {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(Message::Text(text)).await {
                self.shared.pending.lock().await.remove(&id);
                return Err(Error::connection(format!("write failed: {e}")));
            }
        }

        let value = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(Error::connection("transport dropped pending command"));
            }
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                let mut err = Error::timeout(format!("CDP command timeout: {method}"), timeout);
                if let Some(sid) = session_id {
                    err.message = format!("{} (session {sid})", err.message);
                }
                return Err(err);
            }
        };

        serde_json::from_value(value).map_err(|e| Error::protocol(format!("bad result shape: {e}")))
    }

    /// Subscribe to an event. `event` is either a bare method name (global) or
    /// `"{sessionId}:{method}"` (session-scoped).
    pub async fn on<F>(&self, event: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut listeners = self.shared.listeners.lock().await;
        let set = listeners.entry(event.to_string()).or_default();
        let id = set.next_id;
        set.next_id += 1;
        set.callbacks.insert(id, Arc::new(callback));
        SubscriptionId(id)
    }

    pub async fn off(&self, event: &str, id: SubscriptionId) {
        let mut listeners = self.shared.listeners.lock().await;
        if let Some(set) = listeners.get_mut(event) {
            set.callbacks.remove(&id.0);
        }
    }

    /// Registers a one-shot listener plus a close listener plus a timer; whichever
    /// fires first resolves/rejects and tears down all three.
    pub async fn wait_for_event<P>(
        &self,
        event: &str,
        predicate: P,
        timeout: Duration,
    ) -> Result<Value>
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<Value>>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        let tx_event = tx.clone();
        let event_sub = self
            .on(event, move |params| {
                if predicate(params) {
                    if let Ok(mut guard) = tx_event.try_lock() {
                        if let Some(sender) = guard.take() {
                            let _ = sender.send(Ok(params.clone()));
                        }
                    }
                }
            })
            .await;

        let tx_close = tx.clone();
        let close_sub = self
            .on("__connection_closed", move |_| {
                if let Ok(mut guard) = tx_close.try_lock() {
                    if let Some(sender) = guard.take() {
                        let _ = sender.send(Err(Error::connection("connection closed")));
                    }
                }
            })
            .await;

        let timeout = clamp_timeout(timeout);
        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(inner)) => inner,
            Ok(Err(_)) => Err(Error::connection("wait_for_event channel dropped")),
            Err(_) => Err(Error::timeout(format!("waitForEvent: {event}"), timeout)),
        };

        self.off(event, event_sub).await;
        self.off("__connection_closed", close_sub).await;

        result
    }

    /// Marks intent, clears pending with a connection-closed error, tears down the
    /// socket, clears subscriptions.
    pub async fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        *self.connected.write().await = false;
        Self::reject_all_pending(&self.shared, Error::connection("connection closed")).await;
        {
            let mut sink = self.sink.lock().await;
            let _ = sink.close().await;
        }
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        self.shared.listeners.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[test]
    fn clamp_timeout_caps_at_max() {
        assert_eq!(clamp_timeout(Duration::from_secs(10_000)), MAX_TIMEOUT);
        assert_eq!(clamp_timeout(Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn listener_sets_are_keyed_independently() {
        let shared = Shared::default();
        let mut listeners = shared.listeners.lock().await;
        listeners.entry("Foo".into()).or_default();
        listeners.entry("sess1:Foo".into()).or_default();
        assert_eq!(listeners.len(), 2);
    }

    fn fast_reconnect_config() -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_retries: 5,
        }
    }

    #[tokio::test]
    async fn unexpected_close_triggers_reconnect_and_new_sends_succeed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // First connection: accept the handshake then drop immediately,
            // simulating an unexpected close.
            if let Ok((stream, _)) = listener.accept().await {
                let _ = tokio_tungstenite::accept_async(stream).await;
            }
            // Second connection: reply to every request normally.
            if let Ok((stream, _)) = listener.accept().await {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                while let Some(Ok(Message::Text(text))) = ws.next().await {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    let id = frame.get("id").cloned().unwrap_or(Value::Null);
                    let reply = json!({ "id": id, "result": {} });
                    if ws.send(Message::Text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
            }
        });

        let transport = Transport::connect_with_reconnect(&format!("ws://{addr}"), fast_reconnect_config())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(transport.is_connected().await, "transport should have reconnected");

        let result: Value = transport.send("Test.method", json!({})).await.unwrap();
        assert_eq!(result, json!({}));
    }

    #[tokio::test]
    async fn intentional_close_suppresses_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let _ = tokio_tungstenite::accept_async(stream).await;
            }
        });

        let transport = Transport::connect_with_reconnect(&format!("ws://{addr}"), fast_reconnect_config())
            .await
            .unwrap();
        transport.close().await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!transport.is_connected().await);
    }
}
