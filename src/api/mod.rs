//! API module
//!
//! This module provides the HTTP surface for superobjective: the axum server and the
//! reqwest client the CLI talks through.

pub mod client;
pub mod server;

// Re-export commonly used types
pub use client::{Client, ClientConfig, ClientError};
pub use server::{router, serve, AppState, ServerConfig};
