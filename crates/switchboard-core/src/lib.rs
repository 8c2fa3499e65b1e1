//! switchboard-core - provider registry and chat-completion client
//!
//! This crate provides:
//! - A persisted registry of AI providers with active-provider selection and
//!   load balancing (round-robin, weighted, least-latency)
//! - An HTTP client for one provider's chat-completions endpoint with
//!   timeouts, circuit breaking, streaming, and periodic health checks
//! - The shared error taxonomy both components speak

pub mod breaker;
pub mod client;
pub mod error;
pub mod registry;

// Re-export main types for convenience
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use client::{
    ChatCompletion, ChatMessage, ChatRole, ClientConfig, ClientConfigUpdate, ClientEvent,
    HealthCheckResult, MASKED_API_KEY, ProviderClient, SendOptions, StreamChunk, Usage,
};
pub use error::{Error, Result};
pub use registry::{
    LoadBalancing, ProviderConfig, ProviderKind, ProviderRegistry, ProviderStore, Strategy,
};
