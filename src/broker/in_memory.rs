//! Channel-backed fake broker used by tests and by demonstrations of
//! communication-only mode. Not behind `#[cfg(test)]` because
//! communication-only mode in a real deployment also needs somewhere to
//! route frames without a live broker.

use super::{BrokerClient, Frame};
use crate::error::AgentError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Shared handle a test harness uses to push inbound frames and observe
/// outbound publishes/acks, independent of the `BrokerClient` the
/// dispatcher holds.
#[derive(Clone)]
pub struct InMemoryBrokerHandle {
    inbound_tx: mpsc::UnboundedSender<Frame>,
    published: Arc<Mutex<VecDeque<(String, Vec<u8>)>>>,
    acked: Arc<Mutex<VecDeque<String>>>,
    nacked: Arc<Mutex<VecDeque<String>>>,
}

impl InMemoryBrokerHandle {
    pub fn push_frame(&self, destination: &str, body: &[u8]) -> Frame {
        let frame = Frame {
            destination: destination.to_string(),
            body: body.to_vec(),
            message_id: next_id(),
            subscription_id: format!("sub-{destination}"),
        };
        let _ = self.inbound_tx.send(frame.clone());
        frame
    }

    pub async fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().await.iter().cloned().collect()
    }

    pub async fn acked_ids(&self) -> Vec<String> {
        self.acked.lock().await.iter().cloned().collect()
    }

    pub async fn nacked_ids(&self) -> Vec<String> {
        self.nacked.lock().await.iter().cloned().collect()
    }
}

fn next_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("msg-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

pub struct InMemoryBroker {
    inbound_rx: mpsc::UnboundedReceiver<Frame>,
    published: Arc<Mutex<VecDeque<(String, Vec<u8>)>>>,
    acked: Arc<Mutex<VecDeque<String>>>,
    nacked: Arc<Mutex<VecDeque<String>>>,
}

impl InMemoryBroker {
    pub fn new() -> (Self, InMemoryBrokerHandle) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let published = Arc::new(Mutex::new(VecDeque::new()));
        let acked = Arc::new(Mutex::new(VecDeque::new()));
        let nacked = Arc::new(Mutex::new(VecDeque::new()));
        let broker = Self {
            inbound_rx,
            published: published.clone(),
            acked: acked.clone(),
            nacked: nacked.clone(),
        };
        let handle = InMemoryBrokerHandle {
            inbound_tx,
            published,
            acked,
            nacked,
        };
        (broker, handle)
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn connect(&mut self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn subscribe(&mut self, _destination: &str, _subscription_id: &str) -> Result<(), AgentError> {
        Ok(())
    }

    async fn recv(&mut self) -> Result<Frame, AgentError> {
        self.inbound_rx
            .recv()
            .await
            .ok_or_else(|| AgentError::BrokerDisconnected("in-memory channel closed".to_string()))
    }

    async fn ack(&mut self, frame: &Frame) -> Result<(), AgentError> {
        self.acked.lock().await.push_back(frame.message_id.clone());
        Ok(())
    }

    async fn nack(&mut self, frame: &Frame) -> Result<(), AgentError> {
        self.nacked.lock().await.push_back(frame.message_id.clone());
        Ok(())
    }

    async fn send(&mut self, destination: &str, body: &[u8]) -> Result<(), AgentError> {
        self.published
            .lock()
            .await
            .push_back((destination.to_string(), body.to_vec()));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), AgentError> {
        Ok(())
    }
}
