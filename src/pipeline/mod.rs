//! Pipeline module - normalization, prompts, classification and orchestration.

mod classify;
pub mod context;
mod normalize;
mod orchestrator;
mod prompts;

pub use classify::*;
pub use context::{PipelineContext, RunSettings, Shutdown, ShutdownTrigger, shutdown_channel};
pub use normalize::*;
pub use orchestrator::*;
pub use prompts::*;
