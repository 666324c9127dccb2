//! MCP server core: tool registry and dispatch pipeline with validated
//! inputs, bounded concurrency, uniform envelopes and service metrics.

pub mod envelope;
pub mod gate;
pub mod metrics;
pub mod params;
pub mod server;
