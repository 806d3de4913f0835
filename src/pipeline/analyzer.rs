//! Log analyzer: the batch processor at the end of the pipeline.
//!
//! Flow per record:
//! 1. Decode the payload as a `LogMessage` (undecodable → handled, dropped)
//! 2. Skip records whose stream sequence is already stored (redelivery)
//! 3. Ask the LLM for an analysis, bounded by a timeout
//! 4. Persist the entry with its analysis
//! 5. Respond to the producer's reply address, if any

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{LogBroker, Record};
use crate::error::{LlmError, PipelineError};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{Batch, BatchProcessor, LogMessage};
use crate::store::{LogStore, NewLogEntry};

/// Default agent name.
pub const DEFAULT_AGENT_NAME: &str = "Agent Sig";

/// Default system prompt for the analyst.
pub const DEFAULT_INSTRUCTIONS: &str = "You are a technical analyst that executes natural language reporting from technical information and raw SIGINT data. Analyze system logs and provide concise, actionable insights.";

/// Upper bound on a single analysis call.
const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(30);

const ANALYSIS_MAX_TOKENS: u32 = 1024;

const ANALYSIS_TEMPERATURE: f32 = 0.2;

/// Characters of the analysis echoed into the completion log line.
const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub agent_name: String,
    /// System prompt sent with every analysis request.
    pub instructions: String,
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            agent_name: DEFAULT_AGENT_NAME.to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            timeout: ANALYSIS_TIMEOUT,
            max_tokens: ANALYSIS_MAX_TOKENS,
            temperature: ANALYSIS_TEMPERATURE,
        }
    }
}

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisOutcome {
    Stored { id: i64 },
    /// Already stored by an earlier delivery.
    Duplicate,
    /// Payload was not a log message; nothing to analyze.
    Undecodable,
}

/// Response body sent to the producer's reply address.
#[derive(Debug, Serialize)]
struct AnalysisReply<'a> {
    original_message: &'a LogMessage,
    analysis: &'a str,
    timestamp: String,
}

pub struct LogAnalyzer {
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn LogStore>,
    responder: Option<Arc<dyn LogBroker>>,
    config: AnalyzerConfig,
}

impl LogAnalyzer {
    pub fn new(llm: Arc<dyn LlmProvider>, store: Arc<dyn LogStore>, config: AnalyzerConfig) -> Self {
        Self {
            llm,
            store,
            responder: None,
            config,
        }
    }

    /// Send analyses back to producers that set a reply address.
    pub fn with_responder(mut self, responder: Arc<dyn LogBroker>) -> Self {
        self.responder = Some(responder);
        self
    }

    /// Run the full per-record flow.
    pub async fn analyze_record(&self, record: &Record) -> Result<AnalysisOutcome, PipelineError> {
        let message = match LogMessage::from_payload(record.payload()) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    sequence = record.sequence(),
                    subject = %record.subject(),
                    error = %e,
                    "Dropping undecodable log record"
                );
                return Ok(AnalysisOutcome::Undecodable);
            }
        };

        if self.store.has_stream_sequence(record.sequence()).await? {
            debug!(sequence = record.sequence(), "Record already analyzed, skipping");
            return Ok(AnalysisOutcome::Duplicate);
        }

        info!(
            sequence = record.sequence(),
            host = %message.hostname,
            severity = %message.severity,
            service = %message.service,
            "Processing log message"
        );

        let analysis = self.analyze(&message).await?;

        let context = serde_json::to_string(&message.context)
            .map_err(|e| PipelineError::Analysis(format!("serialize context: {e}")))?;
        let id = self
            .store
            .insert_log_entry(&NewLogEntry {
                timestamp: message.timestamp.clone(),
                hostname: message.hostname.clone(),
                severity: message.severity.clone(),
                service: message.service.clone(),
                message: message.message.clone(),
                context: Some(context),
                analysis: Some(analysis.clone()),
                stream_sequence: Some(record.sequence()),
            })
            .await?;

        if let Some(reply) = record.reply() {
            self.respond(reply, &message, &analysis).await;
        }

        info!(
            id,
            agent = %self.config.agent_name,
            service = %message.service,
            preview = %preview(&analysis),
            "Analysis complete"
        );
        Ok(AnalysisOutcome::Stored { id })
    }

    /// Ask the LLM to analyze one message.
    pub async fn analyze(&self, message: &LogMessage) -> Result<String, PipelineError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(self.config.instructions.clone()),
            ChatMessage::user(build_analysis_prompt(message)),
        ])
        .with_temperature(self.config.temperature)
        .with_max_tokens(self.config.max_tokens);

        let response = tokio::time::timeout(self.config.timeout, self.llm.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: self.llm.model_name().to_string(),
                timeout: self.config.timeout,
            })??;

        let analysis = response.content.trim();
        if analysis.is_empty() {
            return Err(PipelineError::Analysis(format!(
                "empty analysis from {} (finish_reason={:?})",
                self.llm.model_name(),
                response.finish_reason
            )));
        }
        debug!(
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Analysis tokens"
        );
        Ok(analysis.to_string())
    }

    /// Reply delivery is best effort; the entry is already stored.
    async fn respond(&self, reply: &str, message: &LogMessage, analysis: &str) {
        let Some(responder) = &self.responder else {
            debug!(reply = %reply, "No responder configured, skipping reply");
            return;
        };

        let body = AnalysisReply {
            original_message: message,
            analysis,
            timestamp: Utc::now().to_rfc3339(),
        };
        let payload = match serde_json::to_vec(&body) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!(error = %e, "Failed to encode analysis reply");
                return;
            }
        };
        if let Err(e) = responder.respond(reply, payload).await {
            warn!(reply = %reply, error = %e, "Failed to send analysis reply");
        }
    }
}

#[async_trait]
impl BatchProcessor<Record> for LogAnalyzer {
    /// Attempts every record; fails the batch if any record failed.
    async fn process_batch(
        &self,
        batch: &Batch<Record>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let total = batch.len();
        let mut failed = 0;

        for (index, record) in batch.items.iter().enumerate() {
            if cancel.is_cancelled() {
                let skipped = total - index;
                warn!(batch_id = %batch.id, skipped, "Batch cancelled, leaving remaining records");
                failed += skipped;
                break;
            }
            if let Err(e) = self.analyze_record(record).await {
                error!(
                    batch_id = %batch.id,
                    sequence = record.sequence(),
                    error = %e,
                    "Failed to analyze record"
                );
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(PipelineError::Batch {
                batch_id: batch.id,
                failed,
                total,
            });
        }
        Ok(())
    }
}

// ── Prompt construction ─────────────────────────────────────────────

/// Build the analysis prompt for one log message.
fn build_analysis_prompt(message: &LogMessage) -> String {
    let context = if message.context.is_empty() {
        "none".to_string()
    } else {
        serde_json::Value::Object(message.context.clone()).to_string()
    };

    format!(
        "Analyze this technical log entry and provide insights:\n\
         Timestamp: {}\n\
         Host: {}\n\
         Severity: {}\n\
         Service: {}\n\
         Message: {}\n\
         Additional Context: {}",
        message.timestamp,
        message.hostname,
        message.severity,
        message.service,
        message.message,
        context
    )
}

fn preview(analysis: &str) -> String {
    let mut preview: String = analysis.chars().take(PREVIEW_CHARS).collect();
    if analysis.chars().count() > PREVIEW_CHARS {
        preview.push_str("...");
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Acker, CONSUMER_NAME, MemoryBroker, STREAM_NAME, SUBJECT_NAME, StreamSpec};
    use crate::broker::{Cursor, CursorSpec};
    use crate::error::BrokerError;
    use crate::llm::provider::{CompletionResponse, FinishReason};
    use crate::pipeline::types::FlushTrigger;
    use crate::store::LibSqlBackend;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Returns a canned analysis, or fails for payloads containing "boom".
    struct MockAnalystLlm {
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl MockAnalystLlm {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl LlmProvider for MockAnalystLlm {
        fn model_name(&self) -> &str {
            "mock-analyst"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let prompt = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            self.prompts.lock().unwrap().push(prompt.clone());
            if prompt.contains("boom") {
                return Err(LlmError::RequestFailed {
                    provider: "mock".into(),
                    reason: "scripted failure".into(),
                });
            }
            Ok(CompletionResponse {
                content: "Disk pressure on the host; rotate logs and expand the volume.".into(),
                input_tokens: 100,
                output_tokens: 20,
                finish_reason: FinishReason::Stop,
                response_id: None,
            })
        }
    }

    struct NoopAcker;

    #[async_trait]
    impl Acker for NoopAcker {
        async fn ack(&self) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn nak(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn log_json(message: &str) -> Bytes {
        Bytes::from(
            serde_json::json!({
                "timestamp": "2025-01-01T00:00:00Z",
                "hostname": "db-2",
                "severity": "critical",
                "service": "postgres",
                "message": message,
                "context": {"disk_used_pct": 97}
            })
            .to_string(),
        )
    }

    fn record(sequence: u64, payload: Bytes) -> Record {
        Record::new(SUBJECT_NAME, payload, sequence, 1, Arc::new(NoopAcker))
    }

    async fn analyzer(llm: Arc<MockAnalystLlm>) -> (LogAnalyzer, Arc<LibSqlBackend>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let analyzer = LogAnalyzer::new(llm, store.clone(), AnalyzerConfig::default());
        (analyzer, store)
    }

    #[test]
    fn prompt_includes_all_fields() {
        let message = LogMessage::from_payload(&log_json("disk almost full")).unwrap();
        let prompt = build_analysis_prompt(&message);
        assert!(prompt.starts_with("Analyze this technical log entry"));
        assert!(prompt.contains("Host: db-2"));
        assert!(prompt.contains("Severity: critical"));
        assert!(prompt.contains("Service: postgres"));
        assert!(prompt.contains("Message: disk almost full"));
        assert!(prompt.contains(r#""disk_used_pct":97"#));
    }

    #[test]
    fn preview_truncates_long_analysis() {
        assert_eq!(preview("short"), "short");
        let long = "a".repeat(150);
        let p = preview(&long);
        assert_eq!(p.len(), PREVIEW_CHARS + 3);
        assert!(p.ends_with("..."));
    }

    #[tokio::test]
    async fn record_is_analyzed_and_stored() {
        let llm = Arc::new(MockAnalystLlm::new());
        let (analyzer, store) = analyzer(llm.clone()).await;

        let outcome = analyzer
            .analyze_record(&record(5, log_json("disk almost full")))
            .await
            .unwrap();
        assert!(matches!(outcome, AnalysisOutcome::Stored { .. }));

        let entries = store.get_log_entries(10, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stream_sequence, Some(5));
        assert_eq!(entries[0].context.as_deref(), Some(r#"{"disk_used_pct":97}"#));
        assert!(entries[0].analysis.as_deref().unwrap().contains("Disk pressure"));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn redelivered_record_is_not_analyzed_twice() {
        let llm = Arc::new(MockAnalystLlm::new());
        let (analyzer, store) = analyzer(llm.clone()).await;
        let rec = record(9, log_json("disk almost full"));

        analyzer.analyze_record(&rec).await.unwrap();
        let again = analyzer.analyze_record(&rec).await.unwrap();

        assert_eq!(again, AnalysisOutcome::Duplicate);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.count_log_entries().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn undecodable_payload_is_handled_without_llm() {
        let llm = Arc::new(MockAnalystLlm::new());
        let (analyzer, store) = analyzer(llm.clone()).await;

        let outcome = analyzer
            .analyze_record(&record(1, Bytes::from_static(b"not json")))
            .await
            .unwrap();
        assert_eq!(outcome, AnalysisOutcome::Undecodable);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.count_log_entries().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_llm_times_out() {
        let llm = Arc::new(MockAnalystLlm {
            delay: Duration::from_secs(60),
            ..MockAnalystLlm::new()
        });
        let (analyzer, store) = analyzer(llm).await;

        let result = analyzer
            .analyze_record(&record(1, log_json("disk almost full")))
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::Llm(LlmError::Timeout { .. }))
        ));
        assert_eq!(store.count_log_entries().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn batch_attempts_every_record_and_reports_failures() {
        let llm = Arc::new(MockAnalystLlm::new());
        let (analyzer, store) = analyzer(llm.clone()).await;
        let batch = Batch::new(
            vec![
                record(1, log_json("first")),
                record(2, log_json("boom")),
                record(3, log_json("third")),
            ],
            Instant::now(),
            FlushTrigger::Size,
        );

        let result = analyzer
            .process_batch(&batch, &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::Batch {
                failed: 1,
                total: 3,
                ..
            })
        ));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 3);
        assert!(store.has_stream_sequence(1).await.unwrap());
        assert!(!store.has_stream_sequence(2).await.unwrap());
        assert!(store.has_stream_sequence(3).await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_batch_leaves_remaining_records() {
        let llm = Arc::new(MockAnalystLlm::new());
        let (analyzer, _store) = analyzer(llm.clone()).await;
        let batch = Batch::new(
            vec![record(1, log_json("a")), record(2, log_json("b"))],
            Instant::now(),
            FlushTrigger::Interval,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = analyzer.process_batch(&batch, &cancel).await;
        assert!(matches!(
            result,
            Err(PipelineError::Batch { failed: 2, .. })
        ));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reply_carries_original_message_and_analysis() {
        let broker = MemoryBroker::new();
        broker
            .ensure_stream(&StreamSpec::new(STREAM_NAME, SUBJECT_NAME))
            .await
            .unwrap();
        broker
            .publish_with_reply(SUBJECT_NAME, log_json("disk almost full"), Some("_INBOX.reply"))
            .await
            .unwrap();
        let (_, cursor) = broker
            .ensure_cursor(&CursorSpec::new(STREAM_NAME, CONSUMER_NAME, SUBJECT_NAME))
            .await
            .unwrap();
        let fetched = cursor.fetch(1, Duration::ZERO).await.unwrap();

        let llm = Arc::new(MockAnalystLlm::new());
        let (analyzer, _store) = analyzer(llm).await;
        let analyzer = analyzer.with_responder(Arc::new(broker.clone()));
        analyzer.analyze_record(&fetched[0]).await.unwrap();

        let responses = broker.responses().await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, "_INBOX.reply");
        let body: serde_json::Value = serde_json::from_slice(&responses[0].1).unwrap();
        assert_eq!(body["original_message"]["hostname"], "db-2");
        assert!(body["analysis"].as_str().unwrap().contains("Disk pressure"));
        assert!(body["timestamp"].is_string());
    }
}
