//! NATS JetStream backend.
//!
//! Streams map to JetStream streams, cursors to durable pull consumers with
//! explicit acknowledgment. The broker is an external server reached over
//! `NATS_URL`.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{
    self, AckKind,
    consumer::{AckPolicy, PullConsumer, pull},
    stream::{self, StorageType},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    Acker, Cursor, CursorSpec, LogBroker, Provisioned, REPLY_TO_HEADER, Record, StorageMode,
    StreamSpec,
};
use crate::error::BrokerError;

/// Extra time allowed past the server-side fetch expiry before the client
/// gives up on a pull request.
const FETCH_GRACE: Duration = Duration::from_millis(500);

/// JetStream-backed broker.
#[derive(Clone)]
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsBroker {
    /// Connect to the NATS server at `url`.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BrokerError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: async_nats::Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self { client, jetstream }
    }
}

fn storage_type(mode: StorageMode) -> StorageType {
    match mode {
        StorageMode::File => StorageType::File,
        StorageMode::Memory => StorageType::Memory,
    }
}

/// JetStream treats a non-positive limit as unlimited.
fn limit(value: Option<i64>) -> i64 {
    value.filter(|v| *v > 0).unwrap_or(-1)
}

#[async_trait]
impl LogBroker for NatsBroker {
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<Provisioned, BrokerError> {
        if self.jetstream.get_stream(&spec.name).await.is_ok() {
            return Ok(Provisioned::Existing);
        }

        self.jetstream
            .create_stream(stream::Config {
                name: spec.name.clone(),
                subjects: spec.subjects.clone(),
                storage: storage_type(spec.storage),
                max_age: spec.max_age,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::StreamCreate {
                stream: spec.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Provisioned::Created)
    }

    async fn ensure_cursor(
        &self,
        spec: &CursorSpec,
    ) -> Result<(Provisioned, Arc<dyn Cursor>), BrokerError> {
        let stream = self
            .jetstream
            .get_stream(&spec.stream)
            .await
            .map_err(|_| BrokerError::StreamNotFound {
                stream: spec.stream.clone(),
            })?;

        if let Ok(consumer) = stream.get_consumer::<pull::Config>(&spec.name).await {
            let cursor = NatsCursor {
                consumer,
                name: spec.name.clone(),
            };
            return Ok((Provisioned::Existing, Arc::new(cursor)));
        }

        let consumer = stream
            .create_consumer(pull::Config {
                durable_name: Some(spec.name.clone()),
                filter_subject: spec.filter_subject.clone(),
                ack_policy: AckPolicy::Explicit,
                ack_wait: spec.ack_wait,
                max_deliver: limit(spec.max_deliver),
                max_ack_pending: limit(spec.max_ack_pending),
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::ConsumerCreate {
                stream: spec.stream.clone(),
                consumer: spec.name.clone(),
                reason: e.to_string(),
            })?;

        let cursor = NatsCursor {
            consumer,
            name: spec.name.clone(),
        };
        Ok((Provisioned::Created, Arc::new(cursor)))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        let publish_err = |e: &dyn std::fmt::Display| BrokerError::Publish {
            subject: subject.to_string(),
            reason: e.to_string(),
        };

        // The first await sends; the second waits for the stream's ack.
        self.jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| publish_err(&e))?
            .await
            .map_err(|e| publish_err(&e))?;
        Ok(())
    }

    async fn respond(&self, reply: &str, payload: Bytes) -> Result<(), BrokerError> {
        let publish_err = |e: &dyn std::fmt::Display| BrokerError::Publish {
            subject: reply.to_string(),
            reason: e.to_string(),
        };

        self.client
            .publish(reply.to_string(), payload)
            .await
            .map_err(|e| publish_err(&e))?;
        self.client.flush().await.map_err(|e| publish_err(&e))?;
        Ok(())
    }
}

// ── Cursor ──────────────────────────────────────────────────────────

struct NatsCursor {
    consumer: PullConsumer,
    name: String,
}

impl NatsCursor {
    fn to_record(&self, message: jetstream::Message) -> Result<Record, BrokerError> {
        let (sequence, delivered) = {
            let info = message.info().map_err(|e| BrokerError::Fetch {
                consumer: self.name.clone(),
                reason: format!("message metadata: {e}"),
            })?;
            (info.stream_sequence, info.delivered.max(1) as u64)
        };

        let reply = message
            .headers
            .as_ref()
            .and_then(|h| h.get(REPLY_TO_HEADER))
            .map(|v| v.as_str().to_string())
            .filter(|v| !v.is_empty());

        let subject = message.subject.to_string();
        let payload = message.payload.clone();
        let acker = NatsAcker { message, sequence };

        Ok(Record::new(subject, payload, sequence, delivered, Arc::new(acker)).with_reply(reply))
    }
}

#[async_trait]
impl Cursor for NatsCursor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<Record>, BrokerError> {
        let deadline = Instant::now() + wait + FETCH_GRACE;
        let fetch_err = |reason: String| BrokerError::Fetch {
            consumer: self.name.clone(),
            reason,
        };

        let request = self
            .consumer
            .fetch()
            .max_messages(max.max(1))
            .expires(wait)
            .messages();
        let mut batch = tokio::time::timeout_at(deadline, request)
            .await
            .map_err(|_| BrokerError::Timeout(wait))?
            .map_err(|e| fetch_err(e.to_string()))?;

        let mut records = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, batch.next()).await {
                Err(_) if records.is_empty() => return Err(BrokerError::Timeout(wait)),
                Err(_) | Ok(None) => break,
                Ok(Some(Ok(message))) => records.push(self.to_record(message)?),
                Ok(Some(Err(e))) if records.is_empty() => return Err(fetch_err(e.to_string())),
                Ok(Some(Err(e))) => {
                    // Keep what already arrived; the next fetch surfaces the fault.
                    warn!(consumer = %self.name, error = %e, "Fetch ended early");
                    break;
                }
            }
        }

        debug!(consumer = %self.name, count = records.len(), "Fetched records");
        Ok(records)
    }
}

// ── Acknowledgment ──────────────────────────────────────────────────

struct NatsAcker {
    message: jetstream::Message,
    sequence: u64,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.message.ack().await.map_err(|e| BrokerError::Ack {
            sequence: self.sequence,
            reason: e.to_string(),
        })
    }

    async fn nak(&self) -> Result<(), BrokerError> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BrokerError::Ack {
                sequence: self.sequence,
                reason: format!("nak: {e}"),
            })
    }
}
