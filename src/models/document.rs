//! Index-side projection of a transaction.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::models::events::{TransactionEvent, TransactionType};
use crate::models::ids::{AccountId, CategoryId, CurrencyId, TransactionId};

// Document field names referenced by partial updates and queries.
pub const STATUS_FIELD: &str = "status";
pub const CATEGORY_ID_FIELD: &str = "category_id";
pub const CATEGORY_NAME_FIELD: &str = "category_name";
pub const CATEGORY_LOGO_HASH_ID_FIELD: &str = "category_logo_hash_id";
pub const CATEGORY_LOGO_FIELD: &str = "category_logo";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Finished,
    Reverted,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Finished => "finished",
            DocumentStatus::Reverted => "reverted",
        }
    }
}

/// The document stored under `id` in the transactions collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedTransaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    pub category_id: CategoryId,
    pub category_name: String,
    #[serde(rename = "type")]
    pub r#type: Option<TransactionType>,
    pub description: String,
    pub name: String,
    pub category_logo_hash_id: String,
    pub category_logo: String,
    pub sum: f64,
    pub currency_id: CurrencyId,
    pub account_type: String,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        serialize_with = "crate::utils::date::serialize_opt",
        deserialize_with = "crate::utils::date::deserialize_opt"
    )]
    pub date: Option<DateTime<FixedOffset>>,
    pub status: DocumentStatus,
}

impl IndexedTransaction {
    /// Maps every event field onto the document; nothing is merged with prior state.
    pub fn from_event(event: &TransactionEvent, status: DocumentStatus) -> Self {
        Self {
            id: event.id,
            account_id: event.account_id,
            category_id: event.category_id,
            category_name: event.category_name.clone(),
            r#type: event.r#type,
            description: event.description.clone(),
            name: event.name.clone(),
            category_logo_hash_id: event.category_logo_hash_id.clone(),
            category_logo: event.category_logo.clone(),
            sum: event.sum,
            currency_id: event.currency_id,
            account_type: event.account_type.clone(),
            created_at: event.created_at,
            date: event.date,
            status,
        }
    }
}
