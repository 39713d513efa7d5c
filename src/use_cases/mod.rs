pub mod ingest_batch;

pub use ingest_batch::{IngestBatch, IngestCommand, IngestError, IngestOutcome, TransactionItem};
