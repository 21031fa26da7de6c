// Core modules
pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod models;
pub mod notify;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod supervisor;

// Re-export commonly used types
pub use error::TraderError;
pub use models::*;
pub use strategy::PatternScanner;

// Error handling
pub type Result<T> = std::result::Result<T, TraderError>;
