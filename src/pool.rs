//! A small pool of [`crate::websocket::WsConnection`]s that together cover
//! up to `MAX_TOPICS` PubSub subscriptions.
//!
//! Ported from `original_source/src/websocket/pool.py`: `add_topics` fills
//! existing connections before opening new ones; `remove_topics` compacts
//! the pool by retiring a connection whenever what remains would fit in one
//! fewer socket.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::auth::Auth;
use crate::constants::{MAX_WEBSOCKETS, WS_TOPICS_LIMIT};
use crate::error::MinerError;
use crate::websocket::{TopicMessage, WsConnection};

pub struct Pool {
    auth: Arc<Auth>,
    connections: Mutex<Vec<Arc<WsConnection>>>,
    event_tx: mpsc::UnboundedSender<TopicMessage>,
    running: std::sync::atomic::AtomicBool,
    next_id: std::sync::atomic::AtomicUsize,
}

impl Pool {
    pub fn new(auth: Arc<Auth>) -> (Arc<Self>, mpsc::UnboundedReceiver<TopicMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                auth,
                connections: Mutex::new(Vec::new()),
                event_tx: tx,
                running: std::sync::atomic::AtomicBool::new(false),
                next_id: std::sync::atomic::AtomicUsize::new(0),
            }),
            rx,
        )
    }

    pub async fn start(&self) {
        self.running.store(true, std::sync::atomic::Ordering::SeqCst);
        for conn in self.connections.lock().await.iter() {
            conn.start();
        }
    }

    pub async fn stop(&self) {
        self.running.store(false, std::sync::atomic::Ordering::SeqCst);
        for conn in self.connections.lock().await.drain(..) {
            conn.stop().await;
        }
    }

    fn new_label(&self) -> String {
        let n = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        format!("ws-{n}")
    }

    /// Drop topics already subscribed anywhere in the pool, then fill
    /// existing connections up to their limit; open new connections (up to
    /// `MAX_WEBSOCKETS`) for the remainder.
    pub async fn add_topics(&self, topics: impl IntoIterator<Item = String>) -> Result<(), MinerError> {
        let mut remaining: HashSet<String> = topics.into_iter().collect();
        if remaining.is_empty() {
            return Ok(());
        }

        let mut connections = self.connections.lock().await;
        let mut already_subscribed: HashSet<String> = HashSet::new();
        for conn in connections.iter() {
            already_subscribed.extend(conn.topics_snapshot().await);
        }
        remaining.retain(|t| !already_subscribed.contains(t));

        for conn in connections.iter() {
            if remaining.is_empty() {
                break;
            }
            conn.add_topics(&mut remaining).await;
        }

        while !remaining.is_empty() {
            if connections.len() >= MAX_WEBSOCKETS {
                return Err(MinerError::MaxTopicsExceeded);
            }
            let conn = WsConnection::new(self.new_label(), self.auth.clone(), self.event_tx.clone());
            if self.running.load(std::sync::atomic::Ordering::SeqCst) {
                conn.start();
            }
            conn.add_topics(&mut remaining).await;
            connections.push(conn);
        }
        Ok(())
    }

    /// Remove topics across every connection, then compact: while the
    /// remaining topic count would fit one fewer connection, pop the last
    /// one, harvest its topics, stop it, and redistribute what it carried.
    pub async fn remove_topics(&self, topics: impl IntoIterator<Item = String>) {
        let victims: HashSet<String> = topics.into_iter().collect();
        if victims.is_empty() {
            return;
        }

        let mut connections = self.connections.lock().await;
        for conn in connections.iter() {
            conn.remove_topics(&victims).await;
        }

        loop {
            if connections.len() <= 1 {
                break;
            }
            let mut total = 0usize;
            for conn in connections.iter() {
                total += conn.topic_count().await;
            }
            if total > (connections.len() - 1) * WS_TOPICS_LIMIT {
                break;
            }
            let Some(last) = connections.pop() else { break };
            let mut harvested = last.drain_topics().await;
            last.stop().await;
            for conn in connections.iter() {
                if harvested.is_empty() {
                    break;
                }
                conn.add_topics(&mut harvested).await;
            }
            // Every topic must fit: len(connections)-1 was checked above to
            // accommodate `total`, so `harvested` always drains fully.
            debug_assert!(harvested.is_empty());
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn total_topics(&self) -> usize {
        let mut total = 0;
        for conn in self.connections.lock().await.iter() {
            total += conn.topic_count().await;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_auth() -> Arc<Auth> {
        let path = std::env::temp_dir().join(format!("pool-test-cookies-{}.json", std::process::id()));
        Arc::new(Auth::new(crate::http::HttpClient::new(1, None, path)))
    }

    #[tokio::test]
    async fn add_topics_opens_new_connections_as_needed() {
        let (pool, _rx) = Pool::new(test_auth());
        let topics: Vec<String> = (0..(WS_TOPICS_LIMIT + 10)).map(|i| format!("t.{i}")).collect();
        pool.add_topics(topics).await.unwrap();
        assert_eq!(pool.connection_count().await, 2);
        assert_eq!(pool.total_topics().await, WS_TOPICS_LIMIT + 10);
    }

    #[tokio::test]
    async fn remove_topics_compacts_the_pool() {
        let (pool, _rx) = Pool::new(test_auth());
        let topics: Vec<String> = (0..(WS_TOPICS_LIMIT + 10)).map(|i| format!("t.{i}")).collect();
        pool.add_topics(topics.clone()).await.unwrap();
        assert_eq!(pool.connection_count().await, 2);

        // Removing all but a handful should compact back down to one socket.
        let to_remove: Vec<String> = topics.into_iter().take(WS_TOPICS_LIMIT).collect();
        pool.remove_topics(to_remove).await;
        assert_eq!(pool.connection_count().await, 1);
        assert_eq!(pool.total_topics().await, 10);
    }

    #[tokio::test]
    async fn adding_duplicate_topics_does_not_double_subscribe() {
        let (pool, _rx) = Pool::new(test_auth());
        pool.add_topics(vec!["a".to_string(), "b".to_string()]).await.unwrap();
        pool.add_topics(vec!["b".to_string(), "c".to_string()]).await.unwrap();
        assert_eq!(pool.total_topics().await, 3);
    }
}
