//! Persistent log broker abstraction.
//!
//! The pipeline only needs a handful of operations from the log store:
//! create a stream if absent, create a durable cursor if absent, pull-fetch
//! a bounded batch from the cursor, and acknowledge individual records.
//!
//! Two backends implement it:
//! - **NATS JetStream** (`nats`) for production
//! - **In-memory** (`memory`) for tests and local runs without a server

pub mod memory;
pub mod nats;

pub use memory::MemoryBroker;
pub use nats::NatsBroker;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{BrokerError, ConfigError};

/// Name of the stream holding inbound log records.
pub const STREAM_NAME: &str = "AGENT_STREAM";

/// Name of the durable cursor the analyst reads through.
pub const CONSUMER_NAME: &str = "AGENT_CONSUMER";

/// Subject producers publish technical log records on.
pub const SUBJECT_NAME: &str = "agent.technical.support";

/// Header carrying the address a producer wants the analysis sent back to.
pub const REPLY_TO_HEADER: &str = "Reply-To";

// ── Provisioning specs ──────────────────────────────────────────────

/// Where the broker keeps a stream's records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageMode {
    /// Persisted to disk; survives broker restarts.
    #[default]
    File,
    /// Held in broker memory only.
    Memory,
}

impl FromStr for StorageMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::InvalidValue {
                key: "storage".to_string(),
                message: format!("unknown storage mode '{other}' (expected file or memory)"),
            }),
        }
    }
}

/// Configuration of a retained stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    /// Subject filter(s) captured by the stream.
    pub subjects: Vec<String>,
    pub storage: StorageMode,
    /// Retention horizon: records older than this are discarded by the broker.
    pub max_age: Duration,
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subjects: vec![subject.into()],
            storage: StorageMode::File,
            max_age: Duration::from_secs(24 * 3600),
        }
    }

    pub fn with_storage(mut self, storage: StorageMode) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }
}

/// Configuration of a durable pull cursor. Acknowledgment is always explicit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorSpec {
    pub stream: String,
    /// Durable name; the cursor resumes from its last acknowledged position.
    pub name: String,
    pub filter_subject: String,
    /// Maximum delivery attempts per record. `None` means unlimited.
    pub max_deliver: Option<i64>,
    /// Maximum unacknowledged records in flight. `None` means unlimited.
    pub max_ack_pending: Option<i64>,
    /// How long the broker waits for an ack before redelivering.
    pub ack_wait: Duration,
}

impl CursorSpec {
    pub fn new(
        stream: impl Into<String>,
        name: impl Into<String>,
        filter_subject: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            name: name.into(),
            filter_subject: filter_subject.into(),
            max_deliver: None,
            max_ack_pending: None,
            ack_wait: Duration::from_secs(60),
        }
    }

    pub fn with_max_deliver(mut self, max_deliver: Option<i64>) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    pub fn with_max_ack_pending(mut self, max_ack_pending: Option<i64>) -> Self {
        self.max_ack_pending = max_ack_pending;
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }
}

/// Outcome of an idempotent create-if-absent call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Created,
    Existing,
}

impl Provisioned {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Existing => "existing",
        }
    }
}

// ── Records ─────────────────────────────────────────────────────────

/// Backend hook that settles one delivered record.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Acknowledge: the cursor may advance past this record.
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Negative acknowledge: make the record eligible for redelivery now.
    async fn nak(&self) -> Result<(), BrokerError>;
}

/// One message pulled from a stream.
///
/// Cloning is cheap; all clones share the same ack state, so a record is
/// acknowledged at most once no matter which clone settles it.
#[derive(Clone)]
pub struct Record {
    subject: String,
    payload: Bytes,
    reply: Option<String>,
    sequence: u64,
    delivered: u64,
    acker: Arc<dyn Acker>,
    acked: Arc<AtomicBool>,
}

impl Record {
    pub fn new(
        subject: impl Into<String>,
        payload: Bytes,
        sequence: u64,
        delivered: u64,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            reply: None,
            sequence,
            delivered,
            acker,
            acked: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_reply(mut self, reply: Option<String>) -> Self {
        self.reply = reply;
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Address the producer asked the result to be sent to, if any.
    pub fn reply(&self) -> Option<&str> {
        self.reply.as_deref()
    }

    /// Stream sequence number (position in the log).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Delivery attempt number, starting at 1.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }

    /// Acknowledge the record. A second acknowledgment is rejected.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        if self.acked.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyAcknowledged {
                sequence: self.sequence,
            });
        }
        if let Err(e) = self.acker.ack().await {
            // The broker never saw the ack; allow a later attempt.
            self.acked.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Ask the broker to redeliver the record.
    pub async fn nak(&self) -> Result<(), BrokerError> {
        if self.is_acked() {
            return Err(BrokerError::AlreadyAcknowledged {
                sequence: self.sequence,
            });
        }
        self.acker.nak().await
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("delivered", &self.delivered)
            .field("payload_len", &self.payload.len())
            .field("reply", &self.reply)
            .field("acked", &self.is_acked())
            .finish()
    }
}

// ── Broker traits ───────────────────────────────────────────────────

/// A durable, resumable read position into a stream.
#[async_trait]
pub trait Cursor: Send + Sync {
    /// Durable cursor name.
    fn name(&self) -> &str;

    /// Fetch up to `max` pending records, waiting at most `wait` for any to
    /// arrive. An empty vector means nothing arrived in time.
    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<Record>, BrokerError>;
}

/// Backend-agnostic persistent log broker.
#[async_trait]
pub trait LogBroker: Send + Sync {
    /// Create the stream unless one with the same name exists. An existing
    /// stream is left untouched.
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<Provisioned, BrokerError>;

    /// Create the durable cursor unless it exists, and bind to it.
    async fn ensure_cursor(
        &self,
        spec: &CursorSpec,
    ) -> Result<(Provisioned, Arc<dyn Cursor>), BrokerError>;

    /// Append a record to whichever stream captures `subject`.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Send a one-off response to a reply address (not persisted).
    async fn respond(&self, reply: &str, payload: Bytes) -> Result<(), BrokerError>;
}

/// Whether a NATS-style subject filter (`*` one token, `>` the rest)
/// matches a concrete subject. An empty filter matches everything.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    if filter.is_empty() {
        return true;
    }
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(f), Some(s)) if f == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
