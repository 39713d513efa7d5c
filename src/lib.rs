pub mod adapters;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod ports;
pub mod rules;
pub mod services;
pub mod shutdown;
pub mod use_cases;
pub mod validation;

use std::sync::Arc;

use crate::metrics::PipelineMetrics;
use crate::ports::{MessageConsumer, MessagePublisher, OutboxStore, TransactionStore};
use crate::rules::RuleEngine;
use crate::services::{OutboxRelay, ProcessorConfig, RelayConfig, TransactionProcessor};
use crate::shutdown::Shutdown;

/// Relay and processor wired to one store and one queue.
pub struct Pipeline {
    pub relay: OutboxRelay,
    pub processor: Arc<TransactionProcessor>,
    pub metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn new<S, Q, C>(
        store: S,
        publisher: Q,
        consumer: C,
        relay_config: RelayConfig,
        processor_config: ProcessorConfig,
    ) -> Self
    where
        S: TransactionStore + OutboxStore + Clone + 'static,
        Q: MessagePublisher + 'static,
        C: MessageConsumer + 'static,
    {
        let metrics = Arc::new(PipelineMetrics::new());

        let relay = OutboxRelay::new(
            Arc::new(store.clone()),
            Arc::new(publisher),
            relay_config,
            metrics.clone(),
        );
        let processor = TransactionProcessor::new(
            Arc::new(store),
            Arc::new(consumer),
            RuleEngine::standard(),
            processor_config,
            metrics.clone(),
        );

        Self {
            relay,
            processor: Arc::new(processor),
            metrics,
        }
    }

    /// Runs relay and processor side by side until shutdown.
    pub async fn run(self, shutdown: Shutdown) {
        let Pipeline { relay, processor, .. } = self;
        tokio::join!(relay.run(shutdown.clone()), processor.run(shutdown));
    }
}
