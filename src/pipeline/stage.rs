//! Pipeline stage trait

use anyhow::Result;
use async_trait::async_trait;

/// Trait for pipeline stages that process media data
#[async_trait]
pub trait PipelineStage: Send {
    /// Run the stage, processing data until its input ends or it is stopped
    async fn run(&mut self) -> Result<()>;

    /// Get the name of this stage for logging
    fn name(&self) -> &'static str;

    /// Gracefully shutdown the stage
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
