//! Session manager (§4.4): owns the single broker connection, subscribes
//! to the registry's destination set, reconnects on failure, and drives
//! the heartbeat and ping-reply timers. The receive/reconnect loop runs
//! on the dispatcher's control thread; heartbeats run on their own tokio
//! task so a slow dispatch iteration never starves liveness (§5).

use crate::broker::{BrokerClient, Frame};
use crate::config::BrokerConfig;
use crate::error::AgentError;
use crate::metrics::Metrics;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

pub struct SessionManager {
    broker: Arc<Mutex<Box<dyn BrokerClient>>>,
    broker_config: BrokerConfig,
    hostname: String,
    heartbeat_destination: String,
    ping_destination: String,
    metrics: Metrics,
}

impl SessionManager {
    pub fn new(
        broker: Box<dyn BrokerClient>,
        broker_config: BrokerConfig,
        hostname: String,
        heartbeat_destination: String,
        ping_destination: String,
        metrics: Metrics,
    ) -> Self {
        Self {
            broker: Arc::new(Mutex::new(broker)),
            broker_config,
            hostname,
            heartbeat_destination,
            ping_destination,
            metrics,
        }
    }

    /// `Disconnected → Connecting → Connected` (§4.4): retries the connect
    /// with the configured backoff, then subscribes to every destination
    /// with client-ack mode and prefetch one. Loops until both succeed.
    pub async fn connect_and_subscribe(&self, destinations: &[String]) {
        loop {
            let mut broker = self.broker.lock().await;
            match broker.connect().await {
                Ok(()) => {
                    let mut subscribed_all = true;
                    for (index, destination) in destinations.iter().enumerate() {
                        let subscription_id = format!("sub-{index}");
                        if let Err(e) = broker.subscribe(destination, &subscription_id).await {
                            warn!(%destination, error = %e, "subscribe failed, reconnecting");
                            subscribed_all = false;
                            break;
                        }
                    }
                    if subscribed_all {
                        info!(count = destinations.len(), "connected and subscribed");
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "broker connect failed, retrying"),
            }
            drop(broker);
            sleep(self.broker_config.reconnect_delay).await;
        }
    }

    /// Waits for the next inbound frame. On any error (I/O failure or
    /// broker-reported drop) transitions back through `Connecting` and
    /// resubscribes before trying again (§4.4 `Connected → Disconnected`).
    pub async fn next_frame(&self, destinations: &[String]) -> Frame {
        loop {
            let received = self.broker.lock().await.recv().await;
            match received {
                Ok(frame) => return frame,
                Err(e) => {
                    warn!(error = %e, "broker connection dropped, reconnecting");
                    self.connect_and_subscribe(destinations).await;
                }
            }
        }
    }

    pub async fn ack(&self, frame: &Frame) {
        if let Err(e) = self.broker.lock().await.ack(frame).await {
            warn!(error = %e, "ack failed");
        }
    }

    pub async fn nack(&self, frame: &Frame) {
        if let Err(e) = self.broker.lock().await.nack(frame).await {
            warn!(error = %e, "nack failed");
        }
    }

    pub async fn publish(&self, destination: &str, body: &[u8]) -> Result<(), AgentError> {
        self.broker.lock().await.send(destination, body).await
    }

    pub fn is_ping_destination(&self, destination: &str) -> bool {
        destination == self.ping_destination
    }

    fn heartbeat_document(&self) -> Value {
        json!({
            "src_name": self.hostname,
            "role": "postprocessing",
            "status": "0",
            "pid": std::process::id(),
        })
    }

    /// Publishes the heartbeat document once (§4.4). A failed publish logs
    /// a warning but never transitions the session's state machine.
    pub async fn publish_heartbeat(&self) {
        let body = serde_json::to_vec(&self.heartbeat_document()).expect("heartbeat is valid JSON");
        match self.publish(&self.heartbeat_destination, &body).await {
            Ok(()) => self
                .metrics
                .heartbeats_total
                .with_label_values(&["ok"])
                .inc(),
            Err(e) => {
                warn!(error = %e, "heartbeat publish failed");
                self.metrics
                    .heartbeats_total
                    .with_label_values(&["error"])
                    .inc();
            }
        }
    }

    /// Ping reply (§4.4): acks the ping frame, then — if its body carries a
    /// `reply_to` — publishes the heartbeat document merged with the ping
    /// body to that destination.
    pub async fn handle_ping(&self, frame: &Frame) {
        self.ack(frame).await;

        let Some(reply_to) = reply_to_destination(&frame.body) else {
            return;
        };

        let mut document = self.heartbeat_document();
        if let (Value::Object(document_map), Ok(Value::Object(ping_map))) =
            (&mut document, serde_json::from_slice::<Value>(&frame.body))
        {
            for (key, value) in ping_map {
                document_map.entry(key).or_insert(value);
            }
        }

        let body = serde_json::to_vec(&document).expect("ping reply is valid JSON");
        if let Err(e) = self.publish(&reply_to, &body).await {
            warn!(error = %e, %reply_to, "ping reply publish failed");
        }
    }

    pub async fn disconnect(&self) {
        let _ = self.broker.lock().await.disconnect().await;
    }
}

fn reply_to_destination(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value.get("reply_to")?.as_str().map(str::to_string)
}

/// Spawns the heartbeat timer (§4.4, every 30s while connected, default
/// period set by [`crate::config::BrokerConfig::heartbeat_interval`]),
/// independent of inbound job traffic.
pub fn spawn_heartbeat_task(
    session: Arc<SessionManager>,
    interval: Duration,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(interval).await;
            if stop.load(Ordering::Relaxed) {
                return;
            }
            session.publish_heartbeat().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::in_memory::InMemoryBroker;
    use serde_json::json;

    fn session() -> (Arc<SessionManager>, crate::broker::in_memory::InMemoryBrokerHandle) {
        let (broker, handle) = InMemoryBroker::new();
        let manager = SessionManager::new(
            Box::new(broker),
            BrokerConfig::default(),
            "test-host".to_string(),
            "heart_beat".to_string(),
            "/topic/PING".to_string(),
            Metrics::new(),
        );
        (Arc::new(manager), handle)
    }

    #[tokio::test]
    async fn heartbeat_document_has_expected_shape() {
        let (session, handle) = session();
        session.publish_heartbeat().await;
        let published = handle.published().await;
        assert_eq!(published.len(), 1);
        let (destination, body) = &published[0];
        assert_eq!(destination, "heart_beat");
        let value: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(value["src_name"], "test-host");
        assert_eq!(value["role"], "postprocessing");
        assert_eq!(value["status"], "0");
        assert!(value["pid"].is_number());
    }

    #[tokio::test]
    async fn ping_reply_goes_to_reply_to_destination() {
        let (session, handle) = session();
        let frame = handle.push_frame("/topic/PING", json!({"reply_to": "/queue/PING_TEST"}).to_string().as_bytes());
        session.handle_ping(&frame).await;

        let acked = handle.acked_ids().await;
        assert_eq!(acked, vec![frame.message_id.clone()]);

        let published = handle.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "/queue/PING_TEST");
        let value: Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(value["role"], "postprocessing");
    }

    #[tokio::test]
    async fn ping_without_reply_to_is_acked_but_silent() {
        let (session, handle) = session();
        let frame = handle.push_frame("/topic/PING", b"{}");
        session.handle_ping(&frame).await;
        assert_eq!(handle.acked_ids().await.len(), 1);
        assert!(handle.published().await.is_empty());
    }
}
