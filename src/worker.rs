//! The worker pool (C6): binds queue consumers to the crawler's entry point
//! with bounded concurrency, per-message deadlines, and ack/nack semantics
//! derived from the error family of whatever the crawler returns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::crawler::Crawler;
use crate::error::{CrawlError, ErrorFamily};
use crate::queue::{Ack, ConsumeHandler, Queue};
use crate::resource::AnnotatedResource;

/// Which per-message deadline a queue's messages use (spec.md §4.6 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Hashes,
    Files,
    Directories,
}

impl QueueKind {
    fn deadline(self, config: &crate::config::Config) -> Duration {
        match self {
            Self::Hashes => config.hash_timeout,
            Self::Files => config.file_timeout,
            Self::Directories => config.dir_timeout,
        }
    }
}

/// Binds a [`Crawler`] to one queue's deliveries, applying the per-message
/// deadline for that queue and translating the crawl outcome into an
/// ack/nack decision.
pub struct CrawlHandler {
    crawler: Arc<Crawler>,
    kind: QueueKind,
    /// Bounds how many crawls this handler runs concurrently; queue
    /// consumption naturally backpressures once the bound is hit.
    concurrency: Arc<Semaphore>,
}

impl CrawlHandler {
    pub fn new(crawler: Arc<Crawler>, kind: QueueKind, max_concurrency: usize) -> Self {
        Self { crawler, kind, concurrency: Arc::new(Semaphore::new(max_concurrency)) }
    }
}

#[async_trait]
impl ConsumeHandler for CrawlHandler {
    async fn handle(&self, resource: AnnotatedResource) -> Result<Ack, CrawlError> {
        let _permit = self
            .concurrency
            .acquire()
            .await
            .map_err(|e| CrawlError::Infrastructure(format!("worker semaphore closed: {e}")))?;

        let deadline = self.kind.deadline(self.crawler.config());
        let cancel = CancellationToken::new();
        let crawl_cancel = cancel.clone();

        let outcome = tokio::select! {
            res = self.crawler.crawl(&crawl_cancel, resource.clone()) => res,
            _ = tokio::time::sleep(deadline) => {
                cancel.cancel();
                Err(CrawlError::Timeout { stage: "crawl-deadline" })
            },
        };

        match outcome {
            Ok(()) => Ok(Ack::Ack),
            Err(e) => self.resolve(&resource, e).await,
        }
    }
}

impl CrawlHandler {
    async fn resolve(&self, resource: &AnnotatedResource, e: CrawlError) -> Result<Ack, CrawlError> {
        match e.family() {
            ErrorFamily::PermanentContent => {
                warn!(id = resource.id(), error = %e, "permanent content error, indexing as invalid");
                let cancel = CancellationToken::new();
                self.crawler.record_permanent_failure(&cancel, resource, e.to_string()).await?;
                Ok(Ack::Ack)
            },
            ErrorFamily::Timeout => {
                // Includes `DirectoryTooLarge`: a successful partial crawl,
                // not a failure. Either way the resource is left unindexed
                // (or partially indexed) and acked rather than redelivered.
                info!(id = resource.id(), error = %e, "timed out or partial crawl, acking without reindex");
                Ok(Ack::Ack)
            },
            ErrorFamily::TemporaryTransport => {
                let wait = self.crawler.config().retry_wait;
                warn!(id = resource.id(), error = %e, ?wait, "temporary transport error, nacking for redelivery");
                tokio::time::sleep(wait).await;
                Ok(Ack::NackRequeue)
            },
            ErrorFamily::FatalInfrastructure => {
                error!(id = resource.id(), error = %e, "fatal infrastructure error, pausing consumption");
                Err(e)
            },
        }
    }
}

/// A named queue plus the handler bound to it; [`WorkerPool::run`] drives
/// `N` concurrent consumers per queue until cancelled.
pub struct WorkerPool {
    queues: Vec<(Arc<dyn Queue>, Arc<CrawlHandler>, usize)>,
}

impl WorkerPool {
    pub fn new(crawler: Arc<Crawler>, queues: crate::queue::Queues, workers_per_queue: usize) -> Self {
        let concurrency = workers_per_queue.max(1);
        Self {
            queues: vec![
                (
                    queues.hashes,
                    Arc::new(CrawlHandler::new(Arc::clone(&crawler), QueueKind::Hashes, concurrency)),
                    concurrency,
                ),
                (
                    queues.files,
                    Arc::new(CrawlHandler::new(Arc::clone(&crawler), QueueKind::Files, concurrency)),
                    concurrency,
                ),
                (
                    queues.directories,
                    Arc::new(CrawlHandler::new(crawler, QueueKind::Directories, concurrency)),
                    concurrency,
                ),
            ],
        }
    }

    /// Runs all queues' consumer pools until `cancel` fires, then waits up
    /// to `shutdown_grace` for in-flight crawls to finish before returning.
    pub async fn run(self, cancel: CancellationToken, shutdown_grace: Duration) -> Result<(), CrawlError> {
        let mut handles = Vec::new();

        for (queue, handler, workers) in self.queues {
            for _ in 0..workers {
                let queue = Arc::clone(&queue);
                let handler = Arc::clone(&handler);
                let cancel = cancel.clone();
                handles.push(tokio::spawn(async move { queue.consume(&cancel, handler).await }));
            }
        }

        cancel.cancelled().await;

        let grace = tokio::time::timeout(shutdown_grace, async {
            for handle in handles {
                let _ = handle.await;
            }
        });

        if grace.await.is_err() {
            warn!("shutdown grace period elapsed with consumers still in flight");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use tokio_util::sync::CancellationToken;
    use url::Url;

    use super::*;
    use crate::config::Config;
    use crate::extractor::Extractor;
    use crate::index::{Document, Indexes};
    use crate::protocol::ProtocolClient;
    use crate::queue::Queues;
    use crate::resource::{Resource, ResourceType};

    struct AlwaysUnsupported;

    #[async_trait]
    impl ProtocolClient for AlwaysUnsupported {
        async fn stat(&self, _cancel: &CancellationToken, _resource: &Resource) -> Result<(ResourceType, u64), CrawlError> {
            Ok((ResourceType::Unsupported, 0))
        }

        async fn ls(
            &self,
            _cancel: &CancellationToken,
            _resource: &Resource,
            _sink: tokio::sync::mpsc::Sender<AnnotatedResource>,
        ) -> Result<(), CrawlError> {
            Ok(())
        }

        fn gateway_url(&self, resource: &AnnotatedResource) -> Url {
            Url::parse(&format!("http://gw.test/ipfs/{}", resource.id())).unwrap()
        }
    }

    struct NoopExtractor;

    #[async_trait]
    impl Extractor for NoopExtractor {
        async fn extract(
            &self,
            _cancel: &CancellationToken,
            _resource: &Resource,
            _gateway_url: Url,
            _max_size: u64,
        ) -> Result<Map<String, Value>, CrawlError> {
            Ok(Map::new())
        }
    }

    #[tokio::test]
    async fn handler_acks_and_indexes_unsupported() {
        let crawler = Arc::new(Crawler::new(
            Arc::new(AlwaysUnsupported),
            Arc::new(NoopExtractor),
            Indexes::in_memory(),
            Queues::in_memory(),
            Config::default(),
        ));
        let handler = CrawlHandler::new(Arc::clone(&crawler), QueueKind::Hashes, 4);

        let r = AnnotatedResource::root(Resource::ipfs("Q-unsup"));
        let ack = handler.handle(r).await.unwrap();
        assert_eq!(ack, Ack::Ack);

        let cancel = CancellationToken::new();
        let doc = crawler.indexes().unsupported.get(&cancel, "Q-unsup").await.unwrap();
        assert!(matches!(doc, Some(Document::Unsupported(_))));
    }
}
