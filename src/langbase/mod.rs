//! Langbase Pipes client and the reasoning-service seam used by the pipeline.
//!
//! The executor only depends on [`ReasoningClient`]; [`LangbaseClient`] is the
//! production implementation that talks to the Langbase HTTP API.

mod client;
mod types;


pub use client::LangbaseClient;
pub use types::*;

use async_trait::async_trait;

use crate::error::LangbaseResult;

/// A reasoning service that turns a stage request into raw completion text.
///
/// Implementations perform exactly one attempt per call. Retry, backoff and
/// timeouts are owned by the step executor so that they follow the stage's
/// retry policy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    /// Run the request and return the completion text.
    async fn complete(&self, request: PipeRequest) -> LangbaseResult<String>;
}
