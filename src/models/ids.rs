//! Type aliases for entity IDs. The primary store hands out integer ids; the
//! transaction id doubles as the index document id.

pub type TransactionId = i64;
pub type AccountId = i64;
pub type CategoryId = i64;
pub type CurrencyId = i64;
