//! Stream provisioner: idempotent create-if-absent for the stream and the
//! durable cursor the pipeline reads through. Runs once at startup; any
//! error it returns is fatal.

use std::sync::Arc;

use tracing::info;

use crate::broker::{Cursor, CursorSpec, LogBroker, Provisioned, StreamSpec};
use crate::error::BrokerError;

pub struct StreamProvisioner {
    broker: Arc<dyn LogBroker>,
}

impl StreamProvisioner {
    pub fn new(broker: Arc<dyn LogBroker>) -> Self {
        Self { broker }
    }

    /// Ensure the stream exists. An existing stream is left untouched.
    pub async fn provision_stream(&self, spec: &StreamSpec) -> Result<Provisioned, BrokerError> {
        let outcome = self.broker.ensure_stream(spec).await?;
        info!(
            stream = %spec.name,
            subjects = ?spec.subjects,
            storage = ?spec.storage,
            max_age_secs = spec.max_age.as_secs(),
            outcome = outcome.label(),
            "Stream ready"
        );
        Ok(outcome)
    }

    /// Ensure the durable cursor exists and bind to it.
    pub async fn provision_cursor(
        &self,
        spec: &CursorSpec,
    ) -> Result<(Provisioned, Arc<dyn Cursor>), BrokerError> {
        let (outcome, cursor) = self.broker.ensure_cursor(spec).await?;
        info!(
            stream = %spec.stream,
            consumer = %spec.name,
            filter = %spec.filter_subject,
            outcome = outcome.label(),
            "Durable consumer ready"
        );
        Ok((outcome, cursor))
    }

    /// Stream then cursor, in that order.
    pub async fn provision(
        &self,
        stream: &StreamSpec,
        cursor: &CursorSpec,
    ) -> Result<Arc<dyn Cursor>, BrokerError> {
        self.provision_stream(stream).await?;
        let (_, cursor) = self.provision_cursor(cursor).await?;
        Ok(cursor)
    }
}
