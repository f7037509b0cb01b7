// Library root - the worker binary and integration tests build on these

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod index;
pub mod indexer;
pub mod metrics;
pub mod models;
pub mod propagator;
pub mod retry;
pub mod server;
pub mod topic;
pub mod utils;
pub mod worker;

pub use config::Config;
pub use dispatcher::{Dispatcher, Outcome};
pub use error::{IndexerError, Result, WriteErrorKind};
pub use indexer::{DeleteMode, TransactionIndexer};
pub use metrics::{PartitionState, WorkerMetrics};
pub use propagator::{CategoryPropagator, FanOut};
pub use worker::PartitionSupervisor;
