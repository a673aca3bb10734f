pub mod client;
pub mod config;
pub mod protocol;

pub use client::{ClientError, Connection, Search, SearchBatch, SearchResults, Subscription};
pub use config::ConnectionConfig;
