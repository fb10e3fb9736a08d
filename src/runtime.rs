//! Composition root wiring pipeline, workers and service together.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    gateway::Gateway,
    pipeline::{Pipeline, PipelineError},
    service::OpenNettyService,
    worker::WorkerPool,
};

/// A running OpenNetty instance: one connected pipeline, one worker pool,
/// one service surface. A process typically owns exactly one.
pub struct OpenNetty {
    service: OpenNettyService,
    pool: WorkerPool,
    lifetime: CancellationToken,
}

impl OpenNetty {
    /// Connect the pipeline and spawn the workers for `gateways`.
    ///
    /// # Errors
    /// [`PipelineError`] when the pipeline cannot be connected.
    pub fn start(gateways: Vec<Arc<Gateway>>) -> Result<Self, PipelineError> {
        let lifetime = CancellationToken::new();
        let pipeline = Pipeline::new();
        pipeline.connect(&lifetime)?;
        let pool = WorkerPool::start(&gateways, &pipeline, &lifetime);
        let service = OpenNettyService::new(pipeline, gateways);
        Ok(Self {
            service,
            pool,
            lifetime,
        })
    }

    /// The client-facing operations.
    #[must_use]
    pub const fn service(&self) -> &OpenNettyService { &self.service }

    /// A token cancelled when the runtime shuts down.
    #[must_use]
    pub fn lifetime(&self) -> &CancellationToken { &self.lifetime }

    /// Stop the workers, complete the pipeline and wind down.
    pub async fn shutdown(self) {
        self.lifetime.cancel();
        self.pool.shutdown().await;
    }
}

impl std::fmt::Debug for OpenNetty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenNetty").finish_non_exhaustive()
    }
}
