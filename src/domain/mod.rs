pub mod aggregate;
pub mod message;
pub mod outbox;
pub mod tenant;
pub mod transaction;

pub use aggregate::{AggregateKey, MerchantDailyAggregate};
pub use message::{TransactionMessage, CONTENT_TYPE_JSON};
pub use outbox::OutboxRecord;
pub use tenant::Tenant;
pub use transaction::{
    RuleDecision, TransactionRecord, TransactionStatus, TransactionType, TransitionError,
};
