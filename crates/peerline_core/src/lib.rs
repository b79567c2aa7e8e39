//! Local state for the Peerline client: config files, logging and the
//! SQLite chat store.

pub mod config;
pub mod logging;
pub mod persistence;

pub use config::AppConfig;
pub use persistence::{ChatRow, Database, MessageRow};
