//! Change events consumed from the log and the document shape written to the index.

pub mod document;
pub mod events;
pub mod ids;

pub use document::{DocumentStatus, IndexedTransaction};
pub use events::{
    CategoryAction, CategoryEvent, ChangeEnvelope, DomainEvent, EntityType, TransactionAction,
    TransactionEvent, TransactionType,
};
pub use ids::{AccountId, CategoryId, CurrencyId, TransactionId};
