//! One PubSub websocket connection: DISCONNECTED -> CONNECTING -> CONNECTED
//! -> (RECONNECTING -> CONNECTING) -> DISCONNECTING -> DISCONNECTED.
//!
//! Ported from `original_source/src/websocket/websocket.py`'s `Websocket`
//! class. A [`crate::pool::Pool`] owns a handful of these and spreads topics
//! across them; this module only knows about a single socket's topic set and
//! the PING/PONG/LISTEN/UNLISTEN/MESSAGE/RECONNECT wire protocol.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::auth::Auth;
use crate::backoff::Backoff;
use crate::constants::{LISTEN_BATCH_SIZE, MAX_BACKOFF, PING_INTERVAL, PONG_TIMEOUT, PUBSUB_URL, WS_TOPICS_LIMIT};

const CHARS_ASCII: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn create_nonce(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARS_ASCII[rng.gen_range(0..CHARS_ASCII.len())] as char)
        .collect()
}

/// A `MESSAGE` event's `data.topic`/`data.message` payload, decoded once and
/// handed to the scheduler for dispatch.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

/// A single websocket connection and the set of topics it currently carries.
pub struct WsConnection {
    pub label: String,
    auth: Arc<Auth>,
    topics: Mutex<HashSet<String>>,
    submitted: Mutex<HashSet<String>>,
    event_tx: mpsc::UnboundedSender<TopicMessage>,
    closed: Arc<AtomicBool>,
    reconnect_requested: Arc<AtomicBool>,
    topics_changed: Arc<Notify>,
    state: Mutex<ConnState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WsConnection {
    pub fn new(label: String, auth: Arc<Auth>, event_tx: mpsc::UnboundedSender<TopicMessage>) -> Arc<Self> {
        Arc::new(Self {
            label,
            auth,
            topics: Mutex::new(HashSet::new()),
            submitted: Mutex::new(HashSet::new()),
            event_tx,
            closed: Arc::new(AtomicBool::new(false)),
            reconnect_requested: Arc::new(AtomicBool::new(false)),
            topics_changed: Arc::new(Notify::new()),
            state: Mutex::new(ConnState::Disconnected),
            handle: Mutex::new(None),
        })
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.lock().await.len()
    }

    /// Snapshot of every topic currently on this connection.
    pub async fn topics_snapshot(&self) -> HashSet<String> {
        self.topics.lock().await.clone()
    }

    /// Drain topics out of `incoming` into this connection, up to
    /// `WS_TOPICS_LIMIT`. Returns the number actually added.
    pub async fn add_topics(&self, incoming: &mut HashSet<String>) -> usize {
        let mut topics = self.topics.lock().await;
        let mut added = 0;
        while topics.len() < WS_TOPICS_LIMIT {
            let Some(t) = incoming.iter().next().cloned() else { break };
            incoming.remove(&t);
            topics.insert(t);
            added += 1;
        }
        if added > 0 {
            self.topics_changed.notify_one();
        }
        added
    }

    /// Remove any of `victims` present on this connection. Returns the
    /// removed topics (for the pool to redistribute during compaction).
    pub async fn remove_topics(&self, victims: &HashSet<String>) -> HashSet<String> {
        let mut topics = self.topics.lock().await;
        let removed: HashSet<String> = topics.intersection(victims).cloned().collect();
        for t in &removed {
            topics.remove(t);
        }
        if !removed.is_empty() {
            self.topics_changed.notify_one();
        }
        removed
    }

    /// Pull every topic off this connection (used when the pool retires it
    /// during compaction).
    pub async fn drain_topics(&self) -> HashSet<String> {
        let mut topics = self.topics.lock().await;
        std::mem::take(&mut *topics)
    }

    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run().await;
        });
        // Fire-and-store; `handle` field is only consulted by `stop`.
        let this2 = self.clone();
        tokio::spawn(async move {
            *this2.handle.lock().await = Some(handle);
        });
    }

    pub async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reconnect_requested.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.lock().await.take() {
            h.abort();
        }
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = Backoff::standard(MAX_BACKOFF);
        self.auth.wait_logged_in().await;

        while !self.closed.load(Ordering::SeqCst) {
            *self.state.lock().await = ConnState::Connecting;
            let connected = connect_async(PUBSUB_URL).await;
            let (ws_stream, _) = match connected {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!("{}: connect failed: {}", self.label, e);
                    tokio::time::sleep(backoff.next_delay()).await;
                    continue;
                }
            };
            backoff.reset();
            *self.state.lock().await = ConnState::Connected;
            tracing::debug!("{}: connected", self.label);

            self.reconnect_requested.store(false, Ordering::SeqCst);
            self.submitted.lock().await.clear();
            self.topics_changed.notify_one();

            let (mut write, mut read) = ws_stream.split();
            let mut next_ping = tokio::time::Instant::now() + PING_INTERVAL;
            let mut pong_deadline: Option<tokio::time::Instant> = None;

            'socket: loop {
                if self.closed.load(Ordering::SeqCst) {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
                if self.reconnect_requested.load(Ordering::SeqCst) {
                    break 'socket;
                }

                // Resubmit topic deltas.
                self.handle_topics(&mut write).await;

                let ping_sleep = tokio::time::sleep_until(next_ping);
                let timeout_sleep = tokio::time::sleep(Duration::from_millis(500));

                tokio::select! {
                    _ = ping_sleep => {
                        if let Some(deadline) = pong_deadline {
                            if tokio::time::Instant::now() >= deadline {
                                tracing::warn!("{}: pong missing, reconnecting", self.label);
                                self.reconnect_requested.store(true, Ordering::SeqCst);
                                continue 'socket;
                            }
                        }
                        let _ = write.send(Message::Text(r#"{"type":"PING"}"#.to_string())).await;
                        pong_deadline = Some(tokio::time::Instant::now() + PONG_TIMEOUT);
                        next_ping = tokio::time::Instant::now() + PING_INTERVAL;
                    }
                    _ = timeout_sleep => {}
                    maybe_msg = read.next() => {
                        match maybe_msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(reconnect_now) = self.handle_incoming(&text, &mut pong_deadline, next_ping).await {
                                    if reconnect_now {
                                        break 'socket;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::warn!("{}: server closed the connection", self.label);
                                break 'socket;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!("{}: recv error: {}", self.label, e);
                                break 'socket;
                            }
                        }
                    }
                }
            }

            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            *self.state.lock().await = ConnState::Reconnecting;
            tokio::time::sleep(backoff.next_delay()).await;
        }
        *self.state.lock().await = ConnState::Disconnected;
    }

    /// Compute removed/added deltas against `submitted` and flush them as
    /// batched UNLISTEN/LISTEN requests.
    async fn handle_topics<S>(&self, write: &mut S)
    where
        S: futures_util::Sink<Message> + Unpin,
    {
        let current = self.topics.lock().await.clone();
        let mut submitted = self.submitted.lock().await;
        let removed: Vec<String> = submitted.difference(&current).cloned().collect();
        let added: Vec<String> = current.difference(&submitted).cloned().collect();
        if removed.is_empty() && added.is_empty() {
            return;
        }

        let auth_token = self.auth.snapshot().await.access_token.clone();
        for chunk in removed.chunks(LISTEN_BATCH_SIZE) {
            let msg = serde_json::json!({
                "type": "UNLISTEN",
                "nonce": create_nonce(30),
                "data": {"topics": chunk, "auth_token": auth_token},
            });
            let _ = write.send(Message::Text(msg.to_string())).await;
        }
        for chunk in added.chunks(LISTEN_BATCH_SIZE) {
            let msg = serde_json::json!({
                "type": "LISTEN",
                "nonce": create_nonce(30),
                "data": {"topics": chunk, "auth_token": auth_token},
            });
            let _ = write.send(Message::Text(msg.to_string())).await;
        }
        *submitted = current;
    }

    /// Returns `Some(true)` if the caller should break out to reconnect.
    async fn handle_incoming(
        &self,
        text: &str,
        pong_deadline: &mut Option<tokio::time::Instant>,
        _next_ping: tokio::time::Instant,
    ) -> Option<bool> {
        let parsed: Value = serde_json::from_str(text).ok()?;
        let msg_type = parsed.get("type").and_then(Value::as_str).unwrap_or("");
        match msg_type {
            "PONG" => {
                *pong_deadline = None;
                None
            }
            "RESPONSE" => None,
            "RECONNECT" => {
                tracing::warn!("{}: server requested reconnect", self.label);
                Some(true)
            }
            "MESSAGE" => {
                if let Some(data) = parsed.get("data") {
                    let topic = data.get("topic").and_then(Value::as_str).unwrap_or("").to_string();
                    if let Some(message_str) = data.get("message").and_then(Value::as_str) {
                        if let Ok(payload) = serde_json::from_str::<Value>(message_str) {
                            let _ = self.event_tx.send(TopicMessage { topic, payload });
                        }
                    }
                }
                None
            }
            other => {
                tracing::debug!("{}: unknown message type {}", self.label, other);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_30_ascii_chars() {
        let nonce = create_nonce(30);
        assert_eq!(nonce.len(), 30);
        assert!(nonce.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    fn test_auth() -> Arc<Auth> {
        let path = std::env::temp_dir().join(format!("ws-test-cookies-{}.json", create_nonce(8)));
        Arc::new(Auth::new(crate::http::HttpClient::new(1, None, path)))
    }

    #[tokio::test]
    async fn add_topics_drains_the_incoming_set_up_to_the_limit() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = WsConnection::new("ws-0".into(), test_auth(), tx);
        let mut incoming: HashSet<String> = (0..5).map(|i| format!("topic.{i}")).collect();
        let added = conn.add_topics(&mut incoming).await;
        assert_eq!(added, 5);
        assert!(incoming.is_empty());
        assert_eq!(conn.topic_count().await, 5);
    }

    #[tokio::test]
    async fn remove_topics_only_takes_intersection() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = WsConnection::new("ws-0".into(), test_auth(), tx);
        let mut incoming: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        conn.add_topics(&mut incoming).await;
        let victims: HashSet<String> = ["b", "z"].iter().map(|s| s.to_string()).collect();
        let removed = conn.remove_topics(&victims).await;
        assert_eq!(removed, ["b".to_string()].into_iter().collect());
        assert_eq!(conn.topic_count().await, 2);
    }
}
