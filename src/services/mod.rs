pub mod outbox_relay;
pub mod transaction_processor;

pub use outbox_relay::{OutboxRelay, RelayConfig, RelayError, RelayReport};
pub use transaction_processor::{
    DeadLetterReason, ProcessOutcome, ProcessingError, ProcessorConfig, TransactionProcessor,
};
