//! NutriSage Common Library
//!
//! Core of the NutriSage nutrition assistant:
//! - Bounded answer refinement with groundedness and precision critics
//! - Per-identity hourly and daily quotas over a durable counter store
//! - Safety gate on input and output
//! - Long-term memory, retrieval and chat-model adapters
//! - Error types, configuration and metrics

pub mod assistant;
pub mod cache;
pub mod config;
pub mod errors;
pub mod llm;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod ratelimit;
pub mod refinement;
pub mod session;

// Re-export commonly used types
pub use assistant::{Assistant, ChatRequest, Reply, ReplyStatus};
pub use config::AppConfig;
pub use errors::{AppError, Result};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
