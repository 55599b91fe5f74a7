//! Broker client contract (§4.4, §6). The dispatcher never encodes STOMP
//! frames itself — per spec this is an external collaborator's concern —
//! it only depends on the small surface in [`BrokerClient`]. Two
//! implementations exist: [`in_memory::InMemoryBroker`] for tests and
//! communication-only mode, and [`stomp_client::StompBroker`] for talking
//! to a real ActiveMQ-style broker.

pub mod in_memory;
pub mod stomp_client;

use crate::error::AgentError;
use async_trait::async_trait;

/// One inbound frame, carrying enough of the STOMP headers for the
/// dispatcher to ack/nack it and know where it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub destination: String,
    pub body: Vec<u8>,
    pub message_id: String,
    pub subscription_id: String,
}

/// Client-side acknowledgement mode with prefetch of one, per §6: the
/// broker must not hand this agent more than one unacknowledged message
/// per subscription.
pub const PREFETCH_SIZE: &str = "1";

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Establishes the connection. Called once per `Connecting` state
    /// transition (§4.4); callers retry with a backoff on failure.
    async fn connect(&mut self) -> Result<(), AgentError>;

    /// Subscribes to `destination` with client-ack mode and prefetch one.
    async fn subscribe(&mut self, destination: &str, subscription_id: &str) -> Result<(), AgentError>;

    /// Waits for the next inbound frame. Returns `Err` on any I/O error or
    /// broker-reported drop, which the session manager treats as a
    /// transition back to `Disconnected`.
    async fn recv(&mut self) -> Result<Frame, AgentError>;

    async fn ack(&mut self, frame: &Frame) -> Result<(), AgentError>;

    async fn nack(&mut self, frame: &Frame) -> Result<(), AgentError>;

    async fn send(&mut self, destination: &str, body: &[u8]) -> Result<(), AgentError>;

    async fn disconnect(&mut self) -> Result<(), AgentError>;
}
