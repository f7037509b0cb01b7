//! Wire envelope and domain events.
//!
//! The envelope is `{"type": "transactions"|"categories", "payload": ...}`. The
//! discriminator is resolved first; the payload is then decoded exactly once into
//! the event type it names. The payload may be embedded JSON or a JSON string
//! holding the encoded event.

use chrono::{DateTime, FixedOffset, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IndexerError, Result};
use crate::models::ids::{AccountId, CategoryId, CurrencyId, TransactionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Transactions,
    Categories,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Transactions => "transactions",
            EntityType::Categories => "categories",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "transactions" => Some(EntityType::Transactions),
            "categories" => Some(EntityType::Categories),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outer wire wrapper. `kind` stays a string so an unknown discriminator is
/// reported as a routing error rather than a decode error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

impl ChangeEnvelope {
    pub fn new(kind: EntityType, payload: Value) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            payload,
        }
    }

    pub fn transaction(event: &TransactionEvent) -> Result<Self> {
        let payload = serde_json::to_value(event)
            .map_err(|e| IndexerError::Decode(format!("unencodable transaction event: {}", e)))?;
        Ok(Self::new(EntityType::Transactions, payload))
    }

    pub fn category(event: &CategoryEvent) -> Result<Self> {
        let payload = serde_json::to_value(event)
            .map_err(|e| IndexerError::Decode(format!("unencodable category event: {}", e)))?;
        Ok(Self::new(EntityType::Categories, payload))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| IndexerError::Decode(format!("unencodable envelope: {}", e)))
    }

    /// Resolves the discriminator, then decodes the payload into that event type.
    pub fn into_event(self) -> Result<DomainEvent> {
        let kind = EntityType::from_str(&self.kind).ok_or(IndexerError::Routing(self.kind))?;
        match kind {
            EntityType::Transactions => {
                decode_payload(self.payload, kind).map(DomainEvent::Transaction)
            }
            EntityType::Categories => decode_payload(self.payload, kind).map(DomainEvent::Category),
        }
    }
}

fn decode_payload<T: DeserializeOwned>(payload: Value, kind: EntityType) -> Result<T> {
    let decoded = match payload {
        Value::String(encoded) => serde_json::from_str(&encoded),
        other => serde_json::from_value(other),
    };
    decoded.map_err(|e| IndexerError::Decode(format!("invalid {} payload: {}", kind, e)))
}

/// A decoded change event, ready for routing.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    Transaction(TransactionEvent),
    Category(CategoryEvent),
}

impl DomainEvent {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let envelope: ChangeEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| IndexerError::Decode(format!("malformed envelope: {}", e)))?;
        envelope.into_event()
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            DomainEvent::Transaction(_) => EntityType::Transactions,
            DomainEvent::Category(_) => EntityType::Categories,
        }
    }

    /// Log key that keeps all events of one entity in one partition.
    pub fn partition_key(&self) -> String {
        match self {
            DomainEvent::Transaction(ev) => format!("transaction:{}", ev.id),
            DomainEvent::Category(ev) => format!("category:{}", ev.category_id),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Income,
    Expense,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionAction {
    Create,
    Update,
    Delete,
}

impl TransactionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionAction::Create => "create",
            TransactionAction::Update => "update",
            TransactionAction::Delete => "delete",
        }
    }
}

/// A create/update/delete of one transaction in the primary store.
///
/// `id` and `action` are required. Every other field defaults to its empty value
/// when absent, and is written to the document as such.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub id: TransactionId,
    #[serde(default)]
    pub account_id: AccountId,
    #[serde(default)]
    pub category_id: CategoryId,
    #[serde(default)]
    pub category_name: String,
    #[serde(rename = "type", default)]
    pub r#type: Option<TransactionType>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category_logo_hash_id: String,
    #[serde(default)]
    pub category_logo: String,
    #[serde(default)]
    pub sum: f64,
    #[serde(default)]
    pub currency_id: CurrencyId,
    #[serde(default)]
    pub account_type: String,
    #[serde(default, deserialize_with = "crate::utils::date::deserialize_utc_opt")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        serialize_with = "crate::utils::date::serialize_opt",
        deserialize_with = "crate::utils::date::deserialize_opt"
    )]
    pub date: Option<DateTime<FixedOffset>>,
    pub action: TransactionAction,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryAction {
    #[default]
    Update,
}

/// An edit to a category, denormalized into every transaction referencing it.
/// `None` and `""` both mean "leave this field alone".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryEvent {
    pub category_id: CategoryId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_logo_hash_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_logo: Option<String>,
    #[serde(default)]
    pub action: CategoryAction,
}
