//! In-process bus implementation.
//!
//! Topic logs with per-group cursors and in-flight tracking. The durable
//! truth for job state lives in the job store; the bus carries events
//! between components, so in-process topic logs are sufficient as long as
//! the delivery guarantees hold.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Message, MessageBus, Subscription};

/// One message as stored in a topic log.
#[derive(Debug, Clone)]
struct StoredMessage {
    enqueued_at: i64,
    payload: serde_json::Value,
}

#[derive(Debug, Default)]
struct TopicState {
    log: Vec<StoredMessage>,
    dead: Vec<Message>,
}

#[derive(Debug)]
struct InFlight {
    seq: usize,
    attempt: u32,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next log entry this group has not yet taken.
    cursor: usize,
    in_flight: HashMap<String, InFlight>,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, TopicState>,
    groups: HashMap<(String, String), GroupState>,
    /// delivery_id -> (topic, group), for ack/nack routing.
    deliveries: HashMap<String, (String, String)>,
}

/// In-memory [`MessageBus`] with visibility-timeout redelivery and
/// dead-lettering.
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
    visibility_timeout: Duration,
    max_deliveries: u32,
}

impl InMemoryBus {
    /// `max_deliveries` is the total number of times a message may be
    /// handed out before it is dead-lettered.
    pub fn new(visibility_timeout: Duration, max_deliveries: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            notify: Arc::new(Notify::new()),
            visibility_timeout,
            max_deliveries: max_deliveries.max(1),
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().await;
            let topic_state = state.topics.entry(topic.to_string()).or_default();
            topic_state.log.push(StoredMessage {
                enqueued_at: chrono::Utc::now().timestamp(),
                payload,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Box<dyn Subscription> {
        {
            // Materialize the group so its cursor persists across
            // subscription objects.
            let mut state = self.state.lock().await;
            state
                .groups
                .entry((topic.to_string(), group.to_string()))
                .or_default();
        }
        Box::new(InMemorySubscription {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
            topic: topic.to_string(),
            group: group.to_string(),
            visibility_timeout: self.visibility_timeout,
            max_deliveries: self.max_deliveries,
        })
    }

    async fn ack(&self, delivery_id: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let Some((topic, group)) = state.deliveries.remove(delivery_id) else {
            debug!("Ack for unknown delivery {} ignored", delivery_id);
            return Ok(());
        };
        if let Some(group_state) = state.groups.get_mut(&(topic, group)) {
            group_state.in_flight.remove(delivery_id);
        }
        Ok(())
    }

    async fn nack(&self, delivery_id: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let Some((topic, group)) = state.deliveries.get(delivery_id).cloned() else {
            debug!("Nack for unknown delivery {} ignored", delivery_id);
            return Ok(());
        };
        if let Some(group_state) = state.groups.get_mut(&(topic, group)) {
            if let Some(in_flight) = group_state.in_flight.get_mut(delivery_id) {
                in_flight.deadline = Instant::now();
            }
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn read_dead_letters(&self, topic: &str) -> Vec<Message> {
        let state = self.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|t| t.dead.clone())
            .unwrap_or_default()
    }
}

/// Subscription handle for one consumer group on one topic.
pub struct InMemorySubscription {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
    topic: String,
    group: String,
    visibility_timeout: Duration,
    max_deliveries: u32,
}

impl InMemorySubscription {
    /// Take the next deliverable message, or report when to wake up.
    ///
    /// Priority order: lapsed in-flight deliveries first (redelivery or
    /// dead-letter), then the next unseen log entry.
    fn poll_next(&self, state: &mut BusState, now: Instant) -> Result<Message, Option<Instant>> {
        let key = (self.topic.clone(), self.group.clone());

        loop {
            // Lapsed in-flight delivery?
            let expired = {
                let group_state = state.groups.entry(key.clone()).or_default();
                let expired_id = group_state
                    .in_flight
                    .iter()
                    .find(|(_, f)| f.deadline <= now)
                    .map(|(id, _)| id.clone());
                expired_id.map(|id| {
                    let in_flight = group_state
                        .in_flight
                        .remove(&id)
                        .expect("in-flight entry just found");
                    (id, in_flight)
                })
            };

            if let Some((old_id, in_flight)) = expired {
                state.deliveries.remove(&old_id);
                let stored = state
                    .topics
                    .entry(self.topic.clone())
                    .or_default()
                    .log[in_flight.seq]
                    .clone();

                if in_flight.attempt >= self.max_deliveries {
                    // Redelivery budget exhausted: dead-letter, exactly once.
                    warn!(
                        "Dead-lettering message on topic {} after {} deliveries",
                        self.topic, in_flight.attempt
                    );
                    state.topics.entry(self.topic.clone()).or_default().dead.push(Message {
                        delivery_id: old_id,
                        topic: self.topic.clone(),
                        attempt: in_flight.attempt,
                        enqueued_at: stored.enqueued_at,
                        payload: stored.payload,
                    });
                    continue;
                }

                let delivery_id = uuid::Uuid::new_v4().to_string();
                let attempt = in_flight.attempt + 1;
                state.groups.entry(key.clone()).or_default().in_flight.insert(
                    delivery_id.clone(),
                    InFlight {
                        seq: in_flight.seq,
                        attempt,
                        deadline: now + self.visibility_timeout,
                    },
                );
                state.deliveries.insert(delivery_id.clone(), key.clone());
                return Ok(Message {
                    delivery_id,
                    topic: self.topic.clone(),
                    attempt,
                    enqueued_at: stored.enqueued_at,
                    payload: stored.payload,
                });
            }

            // Fresh log entry?
            let topic_len = state
                .topics
                .get(&self.topic)
                .map(|t| t.log.len())
                .unwrap_or(0);
            let fresh_seq = {
                let group_state = state.groups.entry(key.clone()).or_default();
                if group_state.cursor < topic_len {
                    let seq = group_state.cursor;
                    group_state.cursor += 1;
                    Some(seq)
                } else {
                    None
                }
            };

            if let Some(seq) = fresh_seq {
                let stored = state.topics.get(&self.topic).expect("topic exists").log[seq].clone();
                let delivery_id = uuid::Uuid::new_v4().to_string();
                state.groups.entry(key.clone()).or_default().in_flight.insert(
                    delivery_id.clone(),
                    InFlight {
                        seq,
                        attempt: 1,
                        deadline: now + self.visibility_timeout,
                    },
                );
                state.deliveries.insert(delivery_id.clone(), key.clone());
                return Ok(Message {
                    delivery_id,
                    topic: self.topic.clone(),
                    attempt: 1,
                    enqueued_at: stored.enqueued_at,
                    payload: stored.payload,
                });
            }

            // Nothing deliverable; earliest in-flight deadline is the wake time
            let wake = state
                .groups
                .get(&key)
                .and_then(|g| g.in_flight.values().map(|f| f.deadline).min());
            return Err(wake);
        }
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Message {
        loop {
            // Register for wakeups before inspecting state so a publish
            // racing this check is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake = {
                let mut state = self.state.lock().await;
                match self.poll_next(&mut state, Instant::now()) {
                    Ok(message) => return message,
                    Err(wake) => wake,
                }
            };

            match wake {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}
