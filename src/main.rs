use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use log_analyst::broker::{LogBroker, NatsBroker, Record};
use log_analyst::config::AppConfig;
use log_analyst::llm::create_provider;
use log_analyst::pipeline::{
    AckOnSuccess, AnalysisHandler, BatchProcessor, BatchQueue, LogAnalyzer, PullConsumer,
    QueueHandler, RecordHandler, StreamProvisioner,
};
use log_analyst::store::{LibSqlBackend, LogStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("loading configuration")?;

    eprintln!("📜 Log Analyst v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Broker: {}", config.nats_url);
    eprintln!(
        "   Stream: {} ({}) -> consumer {}",
        config.stream.name, config.cursor.filter_subject, config.cursor.name
    );
    eprintln!(
        "   Model: {} ({})",
        config.llm.model,
        config.llm.backend.label()
    );
    eprintln!("   Database: {}", config.db_path.display());
    if config.batching {
        eprintln!(
            "   Batching: {} records / {:?}, buffer {}",
            config.queue.batch_size, config.queue.flush_interval, config.queue.capacity
        );
    } else {
        eprintln!("   Batching: off");
    }

    // ── Storage & LLM ───────────────────────────────────────────────────
    let store: Arc<dyn LogStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );
    let llm = create_provider(&config.llm).context("creating LLM provider")?;

    // ── Broker ──────────────────────────────────────────────────────────
    let broker: Arc<dyn LogBroker> = Arc::new(
        NatsBroker::connect(&config.nats_url)
            .await
            .context("connecting to broker")?,
    );
    let cursor = StreamProvisioner::new(Arc::clone(&broker))
        .provision(&config.stream, &config.cursor)
        .await
        .context("provisioning stream and consumer")?;

    let analyzer = LogAnalyzer::new(llm, store, config.analyzer.clone())
        .with_responder(Arc::clone(&broker));

    // ── Pipeline ────────────────────────────────────────────────────────
    let mut queue = None;
    let handler: Arc<dyn RecordHandler> = if config.batching {
        let processor: Arc<dyn BatchProcessor<Record>> = Arc::new(AckOnSuccess::new(analyzer));
        let batches = Arc::new(BatchQueue::new(config.queue.clone(), processor)?);
        spawn_failure_logger(&batches);
        batches.start().await?;
        queue = Some(Arc::clone(&batches));
        Arc::new(QueueHandler::new(batches))
    } else {
        Arc::new(AnalysisHandler::new(Arc::new(analyzer)))
    };

    let cancel = CancellationToken::new();
    let consumer = PullConsumer::new(cursor, handler, config.fetch).spawn(cancel.child_token());

    shutdown_signal().await;
    info!("Shutdown requested");

    cancel.cancel();
    match consumer.await {
        Ok(stats) => info!(
            fetched = stats.fetched,
            acked = stats.acked,
            deferred = stats.deferred,
            failed = stats.failed,
            fetch_errors = stats.fetch_errors,
            "Consumer stopped"
        ),
        Err(e) => error!(error = %e, "Consumer task failed"),
    }

    if let Some(queue) = queue {
        // Unacked records in a failed final flush are redelivered on the next run.
        if let Err(e) = queue.stop().await {
            warn!(error = %e, "Queue did not drain cleanly");
        }
    }

    info!("Log Analyst stopped");
    Ok(())
}

fn spawn_failure_logger(queue: &BatchQueue<Record>) {
    let mut failures = queue.errors();
    tokio::spawn(async move {
        loop {
            match failures.recv().await {
                Ok(failure) => error!(
                    batch_id = %failure.batch_id,
                    size = failure.size,
                    trigger = %failure.trigger,
                    reason = %failure.reason,
                    "Batch flush failed"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Flush failure log lagged")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
