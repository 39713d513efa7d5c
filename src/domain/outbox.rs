use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Durable "to be sent" record written in the same commit as its transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub transaction_id: String,
    pub payload: String,
    pub published: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    pub fn new(tenant_id: Uuid, transaction_id: impl Into<String>, payload: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            transaction_id: transaction_id.into(),
            payload,
            published: false,
            published_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn mark_published(&mut self, at: DateTime<Utc>) {
        self.published = true;
        self.published_at = Some(at);
    }
}
