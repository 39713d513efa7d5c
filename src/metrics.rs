//! In-process pipeline counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

pub const MESSAGES_RELAYED: &str = "outbox.messages_relayed";
pub const RELAY_ERRORS: &str = "outbox.relay_errors";
pub const TRANSACTIONS_PROCESSED: &str = "transactions.processed";
pub const TRANSACTIONS_REJECTED: &str = "transactions.rejected";
pub const TRANSACTIONS_IN_REVIEW: &str = "transactions.in_review";
pub const TRANSACTIONS_DUPLICATES: &str = "transactions.duplicates";
pub const CONCURRENCY_CONFLICTS: &str = "transactions.concurrency_conflicts";
pub const DEAD_LETTERED: &str = "queue.dead_lettered";
pub const ABANDONED: &str = "queue.abandoned";

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    messages_relayed: AtomicU64,
    relay_errors: AtomicU64,
    processed: AtomicU64,
    rejected: AtomicU64,
    in_review: AtomicU64,
    duplicates: AtomicU64,
    concurrency_conflicts: AtomicU64,
    dead_lettered: AtomicU64,
    abandoned: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_relayed: u64,
    pub relay_errors: u64,
    pub processed: u64,
    pub rejected: u64,
    pub in_review: u64,
    pub duplicates: u64,
    pub concurrency_conflicts: u64,
    pub dead_lettered: u64,
    pub abandoned: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_relayed(&self, count: u64) {
        self.messages_relayed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_relay_error(&self) {
        self.relay_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_in_review(&self) {
        self.in_review.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.concurrency_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            relay_errors: self.relay_errors.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            in_review: self.in_review.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            concurrency_conflicts: self.concurrency_conflicts.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Counter values keyed by their published metric names.
    pub fn named(&self) -> Vec<(&'static str, u64)> {
        vec![
            (MESSAGES_RELAYED, self.messages_relayed),
            (RELAY_ERRORS, self.relay_errors),
            (TRANSACTIONS_PROCESSED, self.processed),
            (TRANSACTIONS_REJECTED, self.rejected),
            (TRANSACTIONS_IN_REVIEW, self.in_review),
            (TRANSACTIONS_DUPLICATES, self.duplicates),
            (CONCURRENCY_CONFLICTS, self.concurrency_conflicts),
            (DEAD_LETTERED, self.dead_lettered),
            (ABANDONED, self.abandoned),
        ]
    }
}
