pub mod builder;
pub mod cancel;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod corpus;
pub mod db;
pub mod embedding;
pub mod error;
pub mod index;
mod metrics;
pub mod search;
pub mod server;
pub mod store;
pub mod utils;

pub use cancel::CancellationToken;
pub use catalog::Catalog;
pub use config::Opts;
pub use error::{Error, Result};
pub use search::SearchOrchestrator;
pub use store::PersistentStore;
