//! Transaction domain entity.
//! Framework-agnostic representation of an ingested financial transaction and its status machine.

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::message::TransactionMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    #[serde(alias = "Purchase", alias = "purchase")]
    Purchase,
    #[serde(alias = "Refund", alias = "refund")]
    Refund,
    #[serde(alias = "Reversal", alias = "reversal")]
    Reversal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Purchase => "PURCHASE",
            TransactionType::Refund => "REFUND",
            TransactionType::Reversal => "REVERSAL",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PURCHASE" => Ok(TransactionType::Purchase),
            "REFUND" => Ok(TransactionType::Refund),
            "REVERSAL" => Ok(TransactionType::Reversal),
            other => Err(format!("unknown transaction type '{}'", other)),
        }
    }
}

/// Lifecycle of a transaction. Only moves forward:
/// `Received -> Processing -> {Processed | Rejected | Review}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Received,
    Processing,
    Processed,
    Rejected,
    Review,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Received => "Received",
            TransactionStatus::Processing => "Processing",
            TransactionStatus::Processed => "Processed",
            TransactionStatus::Rejected => "Rejected",
            TransactionStatus::Review => "Review",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Processed | TransactionStatus::Rejected | TransactionStatus::Review
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Received" => Ok(TransactionStatus::Received),
            "Processing" => Ok(TransactionStatus::Processing),
            "Processed" => Ok(TransactionStatus::Processed),
            "Rejected" => Ok(TransactionStatus::Rejected),
            "Review" => Ok(TransactionStatus::Review),
            other => Err(format!("unknown transaction status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal status transition for transaction {transaction_id}: {from} -> {to}")]
pub struct TransitionError {
    pub transaction_id: String,
    pub from: TransactionStatus,
    pub to: TransactionStatus,
}

/// Final verdict of the rule engine for one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleDecision {
    Approved,
    Review(String),
    Rejected(String),
}

impl RuleDecision {
    pub fn target_status(&self) -> TransactionStatus {
        match self {
            RuleDecision::Approved => TransactionStatus::Processed,
            RuleDecision::Review(_) => TransactionStatus::Review,
            RuleDecision::Rejected(_) => TransactionStatus::Rejected,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, RuleDecision::Rejected(_))
    }
}

/// Domain entity representing a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub transaction_id: String,
    pub merchant_id: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub transaction_type: TransactionType,
    pub original_transaction_id: Option<String>,
    pub status: TransactionStatus,
    pub occurred_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
    pub batch_id: Option<Uuid>,
    pub rejection_reason: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// Builds a freshly accepted transaction in `Received` status.
    pub fn received(message: &TransactionMessage) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: message.tenant_id,
            transaction_id: message.transaction_id.clone(),
            merchant_id: message.merchant_id.clone(),
            amount: message.amount.clone(),
            currency: message.currency.clone(),
            transaction_type: message.transaction_type,
            original_transaction_id: message.original_transaction_id.clone(),
            status: TransactionStatus::Received,
            occurred_at: message.occurred_at,
            metadata: message.metadata.clone(),
            batch_id: message.batch_id,
            rejection_reason: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Calendar day (UTC) the merchant aggregate is keyed on.
    pub fn business_date(&self) -> NaiveDate {
        self.occurred_at.date_naive()
    }

    pub fn is_purchase(&self) -> bool {
        self.transaction_type == TransactionType::Purchase
    }

    pub fn begin_processing(&mut self) -> Result<(), TransitionError> {
        if self.status != TransactionStatus::Received {
            return Err(self.illegal(TransactionStatus::Processing));
        }
        self.status = TransactionStatus::Processing;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn finish(&mut self, decision: &RuleDecision) -> Result<(), TransitionError> {
        let target = decision.target_status();
        if self.status != TransactionStatus::Processing {
            return Err(self.illegal(target));
        }

        let now = Utc::now();
        self.status = target;
        self.rejection_reason = match decision {
            RuleDecision::Approved => None,
            RuleDecision::Review(reason) | RuleDecision::Rejected(reason) => Some(reason.clone()),
        };
        self.processed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Compensating rejection after an unexpected failure. Allowed from any non-final status.
    pub fn reject_with_error(&mut self, detail: &str) -> Result<(), TransitionError> {
        if self.status.is_final() {
            return Err(self.illegal(TransactionStatus::Rejected));
        }

        let now = Utc::now();
        self.status = TransactionStatus::Rejected;
        self.rejection_reason = Some(format!("Processing error: {}", detail));
        self.processed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    fn illegal(&self, to: TransactionStatus) -> TransitionError {
        TransitionError {
            transaction_id: self.transaction_id.clone(),
            from: self.status,
            to,
        }
    }
}
