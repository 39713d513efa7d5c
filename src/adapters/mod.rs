//! Adapters implementing the ports in `crate::ports`.

pub mod memory_queue;
pub mod memory_store;
pub mod postgres_store;
pub mod redis_queue;

pub use memory_queue::{DeadLetter, InMemoryConsumer, InMemoryQueue};
pub use memory_store::InMemoryStore;
pub use postgres_store::PostgresStore;
pub use redis_queue::{DeadLetterRecord, RedisQueue};
