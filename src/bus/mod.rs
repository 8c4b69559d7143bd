//! Inter-component message bus.
//!
//! Topic-based publish/subscribe with consumer groups: every group sees
//! every message on a topic (pub/sub), consumers within a group share a
//! cursor (point-to-point). Delivery is at-least-once — unacknowledged
//! messages come back after a visibility timeout, and a message that
//! exhausts its redelivery budget moves to the topic's dead-letter side
//! channel where it stays inspectable.

mod memory;

pub use memory::{InMemoryBus, InMemorySubscription};

use async_trait::async_trait;
use serde::Serialize;

/// A delivered message. The `delivery_id` identifies this delivery attempt,
/// not the message: a redelivery carries a fresh id and a bumped `attempt`.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub delivery_id: String,
    pub topic: String,
    pub attempt: u32,
    pub enqueued_at: i64,
    pub payload: serde_json::Value,
}

/// Restartable subscription: a lazy sequence of messages for one consumer
/// group. Re-subscribing with the same group name resumes after the last
/// acknowledged position, never from the beginning.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next deliverable message.
    async fn next(&mut self) -> Message;
}

/// Bus contract shared by producers and consumers.
///
/// Consumers must be idempotent with respect to job id + event type:
/// at-least-once delivery means duplicates are possible by design.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Append a message to a topic and wake subscribers.
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> anyhow::Result<()>;

    /// Open (or re-open) a subscription for `group` on `topic`.
    async fn subscribe(&self, topic: &str, group: &str) -> Box<dyn Subscription>;

    /// Acknowledge a delivery; the message is never redelivered to this
    /// group. Acknowledging an unknown or already-lapsed delivery is a
    /// no-op.
    async fn ack(&self, delivery_id: &str) -> anyhow::Result<()>;

    /// Reject a delivery, making it immediately eligible for redelivery.
    async fn nack(&self, delivery_id: &str) -> anyhow::Result<()>;

    /// Inspect a topic's dead-letter side channel. Entries are retained,
    /// never silently dropped.
    async fn read_dead_letters(&self, topic: &str) -> Vec<Message>;
}
