// Core modules
pub mod alerts;
pub mod config;
pub mod data;
pub mod db;
pub mod engine;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod monitoring;
pub mod regime;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use models::*;
pub use strategy::Strategy;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
