//! In-memory broker backend.
//!
//! Models the parts of a persistent log the pipeline relies on: retained
//! streams, durable cursors with explicit acknowledgment, ack-wait driven
//! redelivery, negative acknowledgment, and max-deliver exhaustion. Used as
//! the broker double in tests and for running without a NATS server.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use super::{
    Acker, Cursor, CursorSpec, LogBroker, Provisioned, Record, StreamSpec, subject_matches,
};
use crate::error::BrokerError;

/// In-memory broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    arrivals: Notify,
}

#[derive(Default)]
struct State {
    streams: BTreeMap<String, StreamState>,
    cursors: BTreeMap<(String, String), CursorState>,
    responses: Vec<(String, Bytes)>,
    injected_fetch_failures: usize,
}

struct StreamState {
    spec: StreamSpec,
    records: Vec<StoredRecord>,
    next_sequence: u64,
}

struct StoredRecord {
    sequence: u64,
    subject: String,
    payload: Bytes,
    reply: Option<String>,
}

struct CursorState {
    spec: CursorSpec,
    deliveries: BTreeMap<u64, Delivery>,
}

struct Delivery {
    delivered: u64,
    acks: u64,
    status: DeliveryStatus,
}

#[derive(Clone, Copy)]
enum DeliveryStatus {
    InFlight { deadline: Instant },
    Redeliver,
    Acked,
}

impl CursorState {
    fn exhausted(&self, delivery: &Delivery) -> bool {
        matches!(self.spec.max_deliver, Some(max) if max > 0 && delivery.delivered >= max as u64)
    }

    fn in_flight(&self, now: Instant) -> usize {
        self.deliveries
            .values()
            .filter(|d| matches!(d.status, DeliveryStatus::InFlight { deadline } if deadline > now))
            .count()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a record carrying a reply address.
    pub async fn publish_with_reply(
        &self,
        subject: &str,
        payload: Bytes,
        reply: Option<&str>,
    ) -> Result<u64, BrokerError> {
        let sequence = {
            let mut state = self.shared.state.lock().await;
            let stream = state
                .streams
                .values_mut()
                .find(|s| s.spec.subjects.iter().any(|f| subject_matches(f, subject)))
                .ok_or_else(|| BrokerError::Publish {
                    subject: subject.to_string(),
                    reason: "no stream captures this subject".to_string(),
                })?;

            let sequence = stream.next_sequence;
            stream.next_sequence += 1;
            stream.records.push(StoredRecord {
                sequence,
                subject: subject.to_string(),
                payload,
                reply: reply.map(str::to_string),
            });
            sequence
        };
        self.shared.arrivals.notify_waiters();
        Ok(sequence)
    }

    /// Make the next `count` fetches fail with a transport error.
    pub async fn fail_next_fetches(&self, count: usize) {
        self.shared.state.lock().await.injected_fetch_failures = count;
    }

    pub async fn stream_count(&self) -> usize {
        self.shared.state.lock().await.streams.len()
    }

    pub async fn cursor_count(&self) -> usize {
        self.shared.state.lock().await.cursors.len()
    }

    pub async fn stream_spec(&self, name: &str) -> Option<StreamSpec> {
        let state = self.shared.state.lock().await;
        state.streams.get(name).map(|s| s.spec.clone())
    }

    pub async fn cursor_spec(&self, stream: &str, cursor: &str) -> Option<CursorSpec> {
        let state = self.shared.state.lock().await;
        state
            .cursors
            .get(&(stream.to_string(), cursor.to_string()))
            .map(|c| c.spec.clone())
    }

    /// Number of times the broker received an ack for `sequence`.
    pub async fn ack_count(&self, stream: &str, cursor: &str, sequence: u64) -> u64 {
        self.delivery(stream, cursor, sequence, |d| d.acks).await
    }

    /// Number of times `sequence` was delivered on the cursor.
    pub async fn delivery_count(&self, stream: &str, cursor: &str, sequence: u64) -> u64 {
        self.delivery(stream, cursor, sequence, |d| d.delivered).await
    }

    /// Responses sent through [`LogBroker::respond`], in order.
    pub async fn responses(&self) -> Vec<(String, Bytes)> {
        self.shared.state.lock().await.responses.clone()
    }

    async fn delivery(
        &self,
        stream: &str,
        cursor: &str,
        sequence: u64,
        read: impl Fn(&Delivery) -> u64,
    ) -> u64 {
        let state = self.shared.state.lock().await;
        state
            .cursors
            .get(&(stream.to_string(), cursor.to_string()))
            .and_then(|c| c.deliveries.get(&sequence))
            .map(read)
            .unwrap_or(0)
    }
}

#[async_trait]
impl LogBroker for MemoryBroker {
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<Provisioned, BrokerError> {
        let mut state = self.shared.state.lock().await;
        if state.streams.contains_key(&spec.name) {
            return Ok(Provisioned::Existing);
        }
        if spec.subjects.is_empty() {
            return Err(BrokerError::StreamCreate {
                stream: spec.name.clone(),
                reason: "at least one subject is required".to_string(),
            });
        }
        state.streams.insert(
            spec.name.clone(),
            StreamState {
                spec: spec.clone(),
                records: Vec::new(),
                next_sequence: 1,
            },
        );
        Ok(Provisioned::Created)
    }

    async fn ensure_cursor(
        &self,
        spec: &CursorSpec,
    ) -> Result<(Provisioned, Arc<dyn Cursor>), BrokerError> {
        let mut state = self.shared.state.lock().await;
        if !state.streams.contains_key(&spec.stream) {
            return Err(BrokerError::ConsumerCreate {
                stream: spec.stream.clone(),
                consumer: spec.name.clone(),
                reason: "stream not found".to_string(),
            });
        }

        let key = (spec.stream.clone(), spec.name.clone());
        let provisioned = if state.cursors.contains_key(&key) {
            Provisioned::Existing
        } else {
            state.cursors.insert(
                key,
                CursorState {
                    spec: spec.clone(),
                    deliveries: BTreeMap::new(),
                },
            );
            Provisioned::Created
        };

        let cursor = MemoryCursor {
            shared: Arc::clone(&self.shared),
            stream: spec.stream.clone(),
            name: spec.name.clone(),
        };
        Ok((provisioned, Arc::new(cursor)))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.publish_with_reply(subject, payload, None).await?;
        Ok(())
    }

    async fn respond(&self, reply: &str, payload: Bytes) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock().await;
        state.responses.push((reply.to_string(), payload));
        Ok(())
    }
}

// ── Cursor ──────────────────────────────────────────────────────────

struct MemoryCursor {
    shared: Arc<Shared>,
    stream: String,
    name: String,
}

impl MemoryCursor {
    /// Claim up to `max` eligible records. Also returns the earliest ack
    /// deadline still pending, so the caller knows when to look again.
    fn claim(
        &self,
        state: &mut State,
        max: usize,
        ack_wait: Duration,
        now: Instant,
    ) -> Result<(Vec<Record>, Option<Instant>), BrokerError> {
        let State {
            streams, cursors, ..
        } = state;

        let stream = streams
            .get(&self.stream)
            .ok_or_else(|| BrokerError::StreamNotFound {
                stream: self.stream.clone(),
            })?;
        let cursor = cursors
            .get_mut(&(self.stream.clone(), self.name.clone()))
            .ok_or_else(|| BrokerError::Fetch {
                consumer: self.name.clone(),
                reason: "cursor was removed".to_string(),
            })?;

        let mut budget = max;
        if let Some(limit) = cursor.spec.max_ack_pending.filter(|l| *l > 0) {
            budget = budget.min((limit as usize).saturating_sub(cursor.in_flight(now)));
        }

        let mut claimed = Vec::new();
        let mut next_deadline: Option<Instant> = None;

        for stored in &stream.records {
            if claimed.len() >= budget {
                break;
            }
            if !subject_matches(&cursor.spec.filter_subject, &stored.subject) {
                continue;
            }

            let eligible = match cursor.deliveries.get(&stored.sequence) {
                None => true,
                Some(delivery) if cursor.exhausted(delivery) => false,
                Some(delivery) => match delivery.status {
                    DeliveryStatus::Acked => false,
                    DeliveryStatus::Redeliver => true,
                    DeliveryStatus::InFlight { deadline } if deadline <= now => true,
                    DeliveryStatus::InFlight { deadline } => {
                        next_deadline = Some(next_deadline.map_or(deadline, |d| d.min(deadline)));
                        false
                    }
                },
            };
            if !eligible {
                continue;
            }

            let delivery = cursor.deliveries.entry(stored.sequence).or_insert(Delivery {
                delivered: 0,
                acks: 0,
                status: DeliveryStatus::Redeliver,
            });
            delivery.delivered += 1;
            delivery.status = DeliveryStatus::InFlight {
                deadline: now + ack_wait,
            };

            let acker = MemoryAcker {
                shared: Arc::clone(&self.shared),
                stream: self.stream.clone(),
                cursor: self.name.clone(),
                sequence: stored.sequence,
            };
            claimed.push(
                Record::new(
                    stored.subject.clone(),
                    stored.payload.clone(),
                    stored.sequence,
                    delivery.delivered,
                    Arc::new(acker),
                )
                .with_reply(stored.reply.clone()),
            );
        }

        Ok((claimed, next_deadline))
    }
}

#[async_trait]
impl Cursor for MemoryCursor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<Record>, BrokerError> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.shared.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = {
                let mut state = self.shared.state.lock().await;
                if state.injected_fetch_failures > 0 {
                    state.injected_fetch_failures -= 1;
                    return Err(BrokerError::Fetch {
                        consumer: self.name.clone(),
                        reason: "injected failure".to_string(),
                    });
                }

                let ack_wait = state
                    .cursors
                    .get(&(self.stream.clone(), self.name.clone()))
                    .map(|c| c.spec.ack_wait)
                    .unwrap_or_default();
                let (records, next_deadline) =
                    self.claim(&mut state, max, ack_wait, Instant::now())?;
                if !records.is_empty() {
                    debug!(cursor = %self.name, count = records.len(), "Delivered records");
                    return Ok(records);
                }
                next_deadline
            };

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            let wake = next_deadline.map_or(deadline, |d| d.min(deadline));
            let _ = tokio::time::timeout_at(wake, notified).await;
        }
    }
}

// ── Acknowledgment ──────────────────────────────────────────────────

struct MemoryAcker {
    shared: Arc<Shared>,
    stream: String,
    cursor: String,
    sequence: u64,
}

impl MemoryAcker {
    async fn settle(&self, status: DeliveryStatus) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock().await;
        let delivery = state
            .cursors
            .get_mut(&(self.stream.clone(), self.cursor.clone()))
            .and_then(|c| c.deliveries.get_mut(&self.sequence))
            .ok_or_else(|| BrokerError::Ack {
                sequence: self.sequence,
                reason: "no delivery recorded".to_string(),
            })?;

        if matches!(status, DeliveryStatus::Acked) {
            delivery.acks += 1;
        }
        if !matches!(delivery.status, DeliveryStatus::Acked) {
            delivery.status = status;
        }
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(DeliveryStatus::Acked).await
    }

    async fn nak(&self) -> Result<(), BrokerError> {
        self.settle(DeliveryStatus::Redeliver).await?;
        self.shared.arrivals.notify_waiters();
        Ok(())
    }
}
