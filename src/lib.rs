pub mod config;
pub mod engine;
pub mod error;
pub mod exif;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod queue;
pub mod session;
pub mod timestamp;
pub mod types;
