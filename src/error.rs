//! Top-level error taxonomy composing every component's error enum.

use crate::capability::CapabilityError;
use crate::executor::DoerError;
use crate::planner::PlannerError;
use crate::registry::RegistryError;
use crate::resolver::ResolverError;
use crate::sandbox::ExecutorError;
use crate::store::StoreError;
use crate::synthesizer::SynthesizerError;

/// Unified error type returned by the CLI and server entry points.
#[derive(Debug, thiserror::Error)]
pub enum AgentFlowError {
    /// A referenced block, pipeline, or run id does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A pipeline or block definition failed structural validation.
    #[error("validation error: {0}")]
    Validation(String),
    /// An operation exceeded its deadline.
    #[error("timed out after {seconds}s")]
    Timeout {
        /// Deadline budget in seconds.
        seconds: u64,
    },
    /// A configured resource ceiling (memory, CPU, iterations) was hit.
    #[error("resource limit exceeded: {0}")]
    ResourceExceeded(String),
    /// Block registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Pipeline/execution storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Sandbox execution failure.
    #[error(transparent)]
    Sandbox(#[from] ExecutorError),
    /// Block synthesis failed to converge.
    #[error(transparent)]
    Synthesis(#[from] SynthesizerError),
    /// Planning failed to produce a valid pipeline.
    #[error(transparent)]
    Planning(#[from] PlannerError),
    /// Template resolution or type coercion failed.
    #[error(transparent)]
    Resolution(#[from] ResolverError),
    /// Language/embedding capability call failed.
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    /// A downstream HTTP dependency returned an unexpected response.
    #[error("upstream error: {0}")]
    Upstream(String),
    /// The run was cancelled before completion.
    #[error("cancelled")]
    Cancelled,
    /// The DAG scheduler could not run a pipeline.
    #[error(transparent)]
    Execution(#[from] DoerError),
}
