//! Queue-driven worker that finalizes transactions and maintains merchant daily aggregates.

use bigdecimal::BigDecimal;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tracing::{error, field, info, info_span, warn, Instrument, Span};

use crate::domain::{
    AggregateKey, MerchantDailyAggregate, RuleDecision, TransactionMessage, TransactionStatus,
    TransitionError,
};
use crate::metrics::PipelineMetrics;
use crate::ports::{MessageConsumer, ReceivedMessage, StoreError, TransactionStore, UnitOfWork};
use crate::rules::RuleEngine;
use crate::shutdown::Shutdown;

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;
pub const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub max_concurrency: usize,
    /// Attempts per delivery before a contended message is abandoned.
    pub max_retries: u32,
    pub max_delivery_count: u32,
    pub receive_wait: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            receive_wait: DEFAULT_RECEIVE_WAIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    DeserializationFailed,
    NotFound,
    TenantNotFound,
    UnexpectedError,
    MaxDeliveryCountExceeded,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::DeserializationFailed => "DeserializationFailed",
            DeadLetterReason::NotFound => "NotFound",
            DeadLetterReason::TenantNotFound => "TenantNotFound",
            DeadLetterReason::UnexpectedError => "UnexpectedError",
            DeadLetterReason::MaxDeliveryCountExceeded => "MaxDeliveryCountExceeded",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl ProcessingError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ProcessingError::Store(e) if e.is_conflict())
    }
}

/// What happened to one delivery. Each variant maps to exactly one queue settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Final status committed; completed.
    Applied(TransactionStatus),
    /// Already past `Received`; completed without side effects.
    Duplicate(TransactionStatus),
    /// Conflicts on every attempt; abandoned for redelivery.
    Contended { attempts: u32 },
    /// Shutdown interrupted the attempt; abandoned.
    Cancelled,
    /// Dead-lettered without touching the transaction.
    Poison {
        reason: DeadLetterReason,
        description: String,
    },
    /// Compensating reject attempted, then dead-lettered.
    Failed { description: String },
}

/// Result of one attempt that did not fail.
enum Step {
    Applied(TransactionStatus),
    Duplicate(TransactionStatus),
    Missing(DeadLetterReason, String),
}

pub struct TransactionProcessor {
    store: Arc<dyn TransactionStore>,
    consumer: Arc<dyn MessageConsumer>,
    rules: RuleEngine,
    config: ProcessorConfig,
    metrics: Arc<PipelineMetrics>,
}

impl TransactionProcessor {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        consumer: Arc<dyn MessageConsumer>,
        rules: RuleEngine,
        config: ProcessorConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            consumer,
            rules,
            config,
            metrics,
        }
    }

    /// Receives and handles messages with at most `max_concurrency` handlers in flight.
    /// On shutdown it stops receiving and waits for running handlers to settle their messages.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) {
        info!(
            "Transaction processor started (max concurrency: {}, max retries: {})",
            self.config.max_concurrency, self.config.max_retries
        );

        let mut handlers = JoinSet::new();

        loop {
            while handlers.len() >= self.config.max_concurrency {
                if let Some(Err(e)) = handlers.join_next().await {
                    error!("Message handler panicked: {}", e);
                }
            }

            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.consumer.receive(self.config.receive_wait) => received,
            };

            match received {
                Ok(Some(message)) => {
                    let processor = Arc::clone(&self);
                    let handler_shutdown = shutdown.clone();
                    handlers.spawn(async move {
                        processor.process_message(&message, &handler_shutdown).await;
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Failed to receive message: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.config.receive_wait) => {}
                    }
                }
            }
        }

        info!("Transaction processor draining {} handler(s)", handlers.len());
        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                error!("Message handler panicked: {}", e);
            }
        }
        info!("Transaction processor stopped");
    }

    /// Handles one delivery end to end, including its queue settlement.
    pub async fn process_message(&self, message: &ReceivedMessage, shutdown: &Shutdown) -> ProcessOutcome {
        let span = info_span!(
            "process_message",
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            tenant_id = field::Empty,
            transaction_id = field::Empty,
        );

        async {
            let outcome = self.handle(message, shutdown).await;
            self.settle(message, &outcome).await;
            outcome
        }
        .instrument(span)
        .await
    }

    async fn handle(&self, message: &ReceivedMessage, shutdown: &Shutdown) -> ProcessOutcome {
        if message.delivery_count > self.config.max_delivery_count {
            return ProcessOutcome::Poison {
                reason: DeadLetterReason::MaxDeliveryCountExceeded,
                description: format!(
                    "Delivery count {} exceeds maximum of {}",
                    message.delivery_count, self.config.max_delivery_count
                ),
            };
        }

        let payload = match TransactionMessage::from_payload(&message.body) {
            Ok(payload) => payload,
            Err(e) => {
                return ProcessOutcome::Poison {
                    reason: DeadLetterReason::DeserializationFailed,
                    description: e.to_string(),
                }
            }
        };

        let span = Span::current();
        span.record("tenant_id", field::display(payload.tenant_id));
        span.record("transaction_id", field::display(&payload.transaction_id));

        let mut attempts = 0;
        loop {
            attempts += 1;

            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return ProcessOutcome::Cancelled,
                result = self.attempt(&payload) => result,
            };

            match result {
                Ok(Step::Applied(status)) => return ProcessOutcome::Applied(status),
                Ok(Step::Duplicate(status)) => return ProcessOutcome::Duplicate(status),
                Ok(Step::Missing(reason, description)) => {
                    return ProcessOutcome::Poison { reason, description }
                }
                Err(e) if e.is_conflict() => {
                    self.metrics.record_conflict();
                    warn!("Concurrency conflict on attempt {}/{}: {}", attempts, self.config.max_retries, e);
                    if attempts >= self.config.max_retries {
                        return ProcessOutcome::Contended { attempts };
                    }
                }
                Err(e) => {
                    let description = e.to_string();
                    self.reject_after_error(&payload, &description).await;
                    return ProcessOutcome::Failed { description };
                }
            }
        }
    }

    async fn attempt(&self, payload: &TransactionMessage) -> Result<Step, ProcessingError> {
        let Some(mut record) = self
            .store
            .find_transaction(payload.tenant_id, &payload.transaction_id)
            .await?
        else {
            return Ok(Step::Missing(
                DeadLetterReason::NotFound,
                format!(
                    "Transaction {} not found for tenant {}",
                    payload.transaction_id, payload.tenant_id
                ),
            ));
        };

        if record.status != TransactionStatus::Received {
            return Ok(Step::Duplicate(record.status));
        }

        let Some(tenant) = self.store.find_tenant(payload.tenant_id).await? else {
            return Ok(Step::Missing(
                DeadLetterReason::TenantNotFound,
                format!("Tenant {} not found", payload.tenant_id),
            ));
        };

        let mut uow = self.store.begin().await?;

        let applied = async {
            record.begin_processing()?;
            uow.save_transaction(&record, TransactionStatus::Received).await?;

            let key = AggregateKey::new(record.tenant_id, record.merchant_id.clone(), record.business_date());
            let aggregate = uow.load_aggregate(&key).await?;
            let current_total = aggregate
                .as_ref()
                .map(|a| a.total_amount.clone())
                .unwrap_or_else(|| BigDecimal::from(0));

            let results = self
                .rules
                .evaluate(&mut uow, &record, &tenant, &current_total)
                .await?;
            let decision = RuleDecision::from_results(&results);

            record.finish(&decision)?;
            uow.save_transaction(&record, TransactionStatus::Processing).await?;

            if record.is_purchase() && !decision.is_rejected() {
                let mut aggregate = aggregate.unwrap_or_else(|| MerchantDailyAggregate::open(&key));
                aggregate.record_purchase(&record.amount, Utc::now());
                uow.save_aggregate(&aggregate).await?;
            }

            Ok::<_, ProcessingError>(decision)
        }
        .await;

        let decision = match applied {
            Ok(decision) => decision,
            Err(e) => {
                rollback(uow).await;
                return Err(e);
            }
        };

        uow.commit().await?;

        match &decision {
            RuleDecision::Approved => info!("Transaction processed"),
            RuleDecision::Review(reason) => info!("Transaction sent to review: {}", reason),
            RuleDecision::Rejected(reason) => info!("Transaction rejected: {}", reason),
        }

        Ok(Step::Applied(record.status))
    }

    async fn reject_after_error(&self, payload: &TransactionMessage, detail: &str) {
        match self
            .store
            .reject_with_error(payload.tenant_id, &payload.transaction_id, detail)
            .await
        {
            Ok(true) => warn!("Transaction rejected after processing error: {}", detail),
            Ok(false) => warn!("Transaction could not be rejected; it is missing or already final"),
            Err(e) => error!("Failed to reject transaction after processing error: {}", e),
        }
    }

    async fn settle(&self, message: &ReceivedMessage, outcome: &ProcessOutcome) {
        let settled = match outcome {
            ProcessOutcome::Applied(status) => {
                match status {
                    TransactionStatus::Rejected => self.metrics.record_rejected(),
                    TransactionStatus::Review => self.metrics.record_in_review(),
                    _ => self.metrics.record_processed(),
                }
                self.consumer.complete(message).await
            }
            ProcessOutcome::Duplicate(status) => {
                self.metrics.record_duplicate();
                info!("Transaction already {}; completing duplicate delivery", status);
                self.consumer.complete(message).await
            }
            ProcessOutcome::Contended { attempts } => {
                self.metrics.record_abandoned();
                warn!("Abandoning message after {} conflicting attempt(s)", attempts);
                self.consumer.abandon(message).await
            }
            ProcessOutcome::Cancelled => {
                self.metrics.record_abandoned();
                info!("Abandoning message on shutdown");
                self.consumer.abandon(message).await
            }
            ProcessOutcome::Poison { reason, description } => {
                self.metrics.record_dead_lettered();
                error!("Dead-lettering message ({}): {}", reason.as_str(), description);
                self.consumer
                    .dead_letter(message, reason.as_str(), description)
                    .await
            }
            ProcessOutcome::Failed { description } => {
                self.metrics.record_dead_lettered();
                error!("Dead-lettering message after unexpected error: {}", description);
                self.consumer
                    .dead_letter(message, DeadLetterReason::UnexpectedError.as_str(), description)
                    .await
            }
        };

        if let Err(e) = settled {
            error!("Failed to settle message {}: {}", message.message_id, e);
        }
    }
}

async fn rollback(uow: Box<dyn UnitOfWork>) {
    if let Err(e) = uow.rollback().await {
        warn!("Rollback failed: {}", e);
    }
}
