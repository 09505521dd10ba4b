//! tierqa - Multi-model QA evaluation with LLM judging and difficulty tiers.
//!
//! ## Architecture
//!
//! tierqa uses two bounded pools:
//! - **Item pool**: Items processed concurrently by the orchestrator
//! - **Responder pool**: Candidate models answering one item concurrently
//!
//! ## Pipeline
//!
//! Records → Normalize → Candidates answer → Judge → Classify → Partition
//!
//! Items where an enabled candidate produced no answer go to the `error`
//! partition unjudged; a retry pass re-asks only the failed candidates.
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Network/API uncertainties (retry, backoff, fallback)

pub mod checkpoint;
pub mod client;
pub mod models;
pub mod pipeline;
pub mod pool;

// Re-exports for convenience
pub use checkpoint::{AuditLog, CheckpointStore, Partition, run_output_dir, versioned_output_dir};
pub use client::{CandidateSlot, EndpointRegistry, LLMClient, ModelAdapter};
pub use models::{Config, FinalizedItem, QAItem, Result, RunReport, Tier, TierError};
pub use pipeline::{DataNormalizer, Orchestrator, PipelineContext, RunSettings, shutdown_channel};
pub use pool::{JudgeService, ResponderPool};
