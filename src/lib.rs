pub mod config;
pub mod console;
pub mod core;
pub mod detection;
pub mod diagnostics;
pub mod error;
pub mod execution;
pub mod jobs;
pub mod orchestrator;
pub mod project;
pub mod server;

use async_trait::async_trait;
use crate::core::{BuildRequest, BuildResult};
use crate::error::BuildError;
use tokio_util::sync::CancellationToken;

pub use crate::orchestrator::BuildOrchestrator;

#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn build(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildResult, BuildError>;

    async fn clean(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildResult, BuildError>;
}

#[async_trait]
impl BuildRunner for BuildOrchestrator {
    async fn build(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildResult, BuildError> {
        BuildOrchestrator::build(self, request, cancel).await
    }

    async fn clean(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildResult, BuildError> {
        BuildOrchestrator::clean(self, request, cancel).await
    }
}
