//! Model client module: adapter seam, HTTP client, rate limiting, registry.

mod adapter;
mod llm_client;
mod rate_limiter;
mod registry;

#[cfg(test)]
pub(crate) mod mock;

pub use adapter::*;
pub use llm_client::*;
pub use rate_limiter::*;
pub use registry::*;
