//! Polls unpublished outbox records and hands them to the queue.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::domain::CONTENT_TYPE_JSON;
use crate::metrics::PipelineMetrics;
use crate::ports::{MessagePublisher, OutboxStore, StoreError};
use crate::shutdown::Shutdown;

pub const DEFAULT_QUEUE_NAME: &str = "transactions-ingest";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub queue_name: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to fetch unpublished outbox records: {0}")]
    Fetch(#[source] StoreError),

    #[error("Failed to mark {count} outbox record(s) published: {source}")]
    MarkPublished {
        count: usize,
        #[source]
        source: StoreError,
    },
}

/// Result of one relay cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
}

pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn MessagePublisher>,
    config: RelayConfig,
    metrics: Arc<PipelineMetrics>,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn MessagePublisher>,
        config: RelayConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
            metrics,
        }
    }

    /// Runs relay cycles until shutdown. A cycle already in progress is allowed to finish.
    pub async fn run(&self, shutdown: Shutdown) {
        info!(
            "Outbox relay started (queue: {}, batch size: {}, interval: {:?})",
            self.config.queue_name, self.config.batch_size, self.config.poll_interval
        );

        while !shutdown.is_cancelled() {
            if let Err(e) = self.relay_batch().await {
                self.metrics.record_relay_error();
                error!("Outbox relay cycle failed: {}", e);
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.config.poll_interval) => {}
            }
        }

        info!("Outbox relay stopped");
    }

    /// One cycle: fetch oldest unpublished records, publish each, mark the successes published.
    pub async fn relay_batch(&self) -> Result<RelayReport, RelayError> {
        let records = self
            .store
            .fetch_unpublished(self.config.batch_size)
            .await
            .map_err(RelayError::Fetch)?;

        if records.is_empty() {
            debug!("No unpublished outbox records");
            return Ok(RelayReport::default());
        }

        let mut report = RelayReport {
            fetched: records.len(),
            ..RelayReport::default()
        };
        let mut published = Vec::with_capacity(records.len());

        for record in &records {
            match self
                .publisher
                .publish(&self.config.queue_name, &record.payload, CONTENT_TYPE_JSON)
                .await
            {
                Ok(()) => published.push(record.id),
                Err(e) => {
                    report.failed += 1;
                    self.metrics.record_relay_error();
                    warn!(
                        "Failed to publish outbox record {} (transaction {}): {}",
                        record.id, record.transaction_id, e
                    );
                }
            }
        }

        if !published.is_empty() {
            self.store
                .mark_published(&published, Utc::now())
                .await
                .map_err(|source| RelayError::MarkPublished {
                    count: published.len(),
                    source,
                })?;
        }

        report.published = published.len();
        self.metrics.record_relayed(report.published as u64);
        info!(
            "Relayed {} of {} outbox record(s) to {}",
            report.published, report.fetched, self.config.queue_name
        );

        Ok(report)
    }
}
