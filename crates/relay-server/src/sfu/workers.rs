use crate::engine::{EngineError, MediaEngine, Router, Worker, WorkerSettings};
use futures_util::future::select_all;
use relay_protocol::{RtpCodecCapability, WorkerId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Fixed set of media workers, handed out round-robin
pub struct WorkerPool {
    workers: Vec<Arc<dyn Worker>>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Starts `count` workers. Any failure aborts startup.
    pub async fn start(
        engine: &dyn MediaEngine,
        count: usize,
        settings: &WorkerSettings,
    ) -> Result<Self, EngineError> {
        let mut workers = Vec::with_capacity(count);
        for _ in 0..count.max(1) {
            let worker = engine.create_worker(settings).await?;
            tracing::info!("Media worker {} ready", worker.id());
            workers.push(worker);
        }
        Ok(Self::from_workers(workers))
    }

    pub fn from_workers(workers: Vec<Arc<dyn Worker>>) -> Self {
        Self {
            workers,
            next: AtomicUsize::new(0),
        }
    }

    pub fn workers(&self) -> &[Arc<dyn Worker>] {
        &self.workers
    }

    pub fn next_worker(&self) -> Option<Arc<dyn Worker>> {
        if self.workers.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Some(self.workers[index].clone())
    }

    /// Creates a router on the next worker
    pub async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn Router>, EngineError> {
        let worker = self
            .next_worker()
            .ok_or(EngineError::Closed("Worker pool"))?;
        worker.create_router(media_codecs).await
    }

    /// Resolves with the id of the first worker that dies
    pub async fn wait_for_death(&self) -> WorkerId {
        if self.workers.is_empty() {
            return std::future::pending().await;
        }

        let watchers = self.workers.iter().map(|worker| {
            let id = worker.id();
            let mut died = worker.died();
            Box::pin(async move {
                let dead = died.wait_for(|dead| *dead).await.is_ok();
                if !dead {
                    // Sender gone without a death notice
                    std::future::pending::<()>().await;
                }
                id
            })
        });

        let (id, _, _) = select_all(watchers).await;
        id
    }
}
