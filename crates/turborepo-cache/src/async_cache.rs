use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::warn;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};

use crate::{CacheError, CacheHitMetadata, CacheMultiplexer, CacheOpts, RemoteClient};

enum WorkerRequest {
    Put {
        anchor: AbsoluteSystemPathBuf,
        hash: String,
        files: Vec<AnchoredSystemPathBuf>,
        duration: u64,
    },
    /// Ack once every write queued before this request has landed.
    Flush(oneshot::Sender<()>),
}

/// Front-end over the multiplexer that takes cache writes off the task's
/// critical path. Reads stay synchronous with the caller; writes are queued
/// to a bounded worker pool and flushed on `shutdown`.
pub struct AsyncCache {
    real_cache: Arc<CacheMultiplexer>,
    writer_sender: mpsc::Sender<WorkerRequest>,
    worker_handle: JoinHandle<()>,
}

impl AsyncCache {
    pub fn new(
        opts: &CacheOpts,
        repo_root: &AbsoluteSystemPath,
        remote_client: Option<Box<dyn RemoteClient>>,
    ) -> Result<AsyncCache, CacheError> {
        let max_workers = opts.workers.max(1) as usize;
        let real_cache = Arc::new(CacheMultiplexer::new(opts, repo_root, remote_client)?);
        let (writer_sender, mut write_consumer) = mpsc::channel::<WorkerRequest>(max_workers);

        let worker_handle = {
            let real_cache = real_cache.clone();
            tokio::spawn(async move {
                let mut workers = FuturesUnordered::new();
                while let Some(request) = write_consumer.recv().await {
                    let (anchor, hash, files, duration) = match request {
                        WorkerRequest::Put {
                            anchor,
                            hash,
                            files,
                            duration,
                        } => (anchor, hash, files, duration),
                        WorkerRequest::Flush(ack) => {
                            while workers.next().await.is_some() {}
                            ack.send(()).ok();
                            continue;
                        }
                    };
                    if workers.len() >= max_workers {
                        workers.next().await;
                    }
                    let real_cache = real_cache.clone();
                    workers.push(tokio::spawn(async move {
                        // Cache storage errors are warnings, never task
                        // failures.
                        if let Err(err) = real_cache.put(&anchor, &hash, &files, duration).await {
                            warn!("failed to save {hash} to cache: {err}");
                        }
                    }));
                }
                while workers.next().await.is_some() {}
            })
        };

        Ok(AsyncCache {
            real_cache,
            writer_sender,
            worker_handle,
        })
    }

    /// Queues a write. Returns once the write is accepted, not completed.
    pub async fn put(
        &self,
        anchor: AbsoluteSystemPathBuf,
        hash: String,
        files: Vec<AnchoredSystemPathBuf>,
        duration: u64,
    ) -> Result<(), CacheError> {
        self.writer_sender
            .send(WorkerRequest::Put {
                anchor,
                hash,
                files,
                duration,
            })
            .await
            .map_err(|_| CacheError::CacheShuttingDown)
    }

    /// Waits for every write queued so far to land, without closing the
    /// cache.
    pub async fn wait(&self) -> Result<(), CacheError> {
        let (ack, done) = oneshot::channel();
        self.writer_sender
            .send(WorkerRequest::Flush(ack))
            .await
            .map_err(|_| CacheError::CacheShuttingDown)?;
        done.await.map_err(|_| CacheError::CacheShuttingDown)
    }

    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        self.real_cache.fetch(anchor, hash).await
    }

    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        self.real_cache.exists(hash).await
    }

    pub fn expanded_outputs(&self, hash: &str) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        self.real_cache.expanded_outputs(hash)
    }

    /// Closes the write queue and waits for in-flight writes to land.
    pub async fn shutdown(self) {
        let AsyncCache {
            writer_sender,
            worker_handle,
            ..
        } = self;
        drop(writer_sender);
        if worker_handle.await.is_err() {
            warn!("cache writer worker panicked during shutdown");
        }
    }
}
