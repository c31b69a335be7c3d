//! The queue adapter boundary (C4): a durable priority queue with
//! `Publish`/`Consume`, at-least-once delivery via ack/nack. The broker
//! itself is an external collaborator; this module defines the interface,
//! the three named queues the crawler dispatches onto, and a concurrency-safe
//! in-memory implementation used by tests and as a runnable demo.
//!
//! Wire configuration matched by any real backend: durable, priority levels
//! 0..9, messages expire after 1 week, lazy (disk-optimized) persistence.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::CrawlError;
use crate::resource::AnnotatedResource;

/// Messages older than this are dropped by the broker as stale work.
pub const MESSAGE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const MAX_PRIORITY: u8 = 9;

/// A validated priority level in `[0, 9]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(u8);

impl Priority {
    /// Reserved for retry/backoff.
    pub const RETRY: Priority = Priority(0);
    /// Root-of-crawl hashes.
    pub const ROOT: Priority = Priority(9);

    pub fn new(value: u8) -> Result<Self, CrawlError> {
        if value <= MAX_PRIORITY {
            Ok(Self(value))
        } else {
            Err(CrawlError::invalid(format!("priority {value} exceeds max {MAX_PRIORITY}")))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// A uniformly random priority in `[1, 7]`, used for directory children
    /// (spec.md §4.5.5): resources within a directory are correlated in
    /// availability, so spreading them across bands de-correlates consumer
    /// load.
    pub fn random_child(rng: &mut impl rand::Rng) -> Self {
        Self(rng.gen_range(1..=7))
    }
}

/// What a consumer returns to tell the queue how to resolve a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Acknowledge: remove the message permanently.
    Ack,
    /// Temporary failure: return the message to the queue for redelivery.
    NackRequeue,
    /// Permanent failure: discard the message without redelivery.
    NackDiscard,
}

#[async_trait]
pub trait ConsumeHandler: Send + Sync {
    /// `Err` signals a fatal infrastructure failure: the caller stops
    /// consumption rather than acking or requeuing (spec.md §4.6/§7).
    async fn handle(&self, resource: AnnotatedResource) -> Result<Ack, CrawlError>;
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn publish(
        &self,
        cancel: &CancellationToken,
        resource: AnnotatedResource,
        priority: Priority,
    ) -> Result<(), CrawlError>;

    /// Delivers messages one-by-one to `handler`. Runs until cancelled.
    async fn consume(&self, cancel: &CancellationToken, handler: Arc<dyn ConsumeHandler>) -> Result<(), CrawlError>;

    /// Approximate number of messages currently queued, across all
    /// priority bands. Exposed for tests and monitoring; backends for
    /// which this is expensive may return a best-effort estimate.
    async fn depth(&self) -> Result<usize, CrawlError>;
}

/// A concurrency-safe in-memory priority queue. Ten `VecDeque`s (one per
/// priority level) behind a single mutex, with a `Notify` to wake waiting
/// consumers — this is a reference/test double, not a broker.
pub struct MemoryQueue {
    levels: Mutex<[VecDeque<AnnotatedResource>; 10]>,
    notify: Notify,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self { levels: Mutex::new(std::array::from_fn(|_| VecDeque::new())), notify: Notify::new() }
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.levels.lock().await.iter().map(VecDeque::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub(crate) async fn pop_highest(&self) -> Option<AnnotatedResource> {
        let mut levels = self.levels.lock().await;
        for level in levels.iter_mut().rev() {
            if let Some(r) = level.pop_front() {
                return Some(r);
            }
        }
        None
    }

    /// Drains and handles whatever is currently queued, then returns. Useful
    /// for tests that want deterministic, non-looping consumption.
    pub async fn drain_once(&self, handler: &(dyn ConsumeHandler)) -> Result<usize, CrawlError> {
        let cancel = CancellationToken::new();
        let mut processed = 0;
        while let Some(resource) = self.pop_highest().await {
            processed += 1;
            match handler.handle(resource.clone()).await? {
                Ack::Ack => {},
                Ack::NackRequeue => {
                    self.publish(&cancel, resource, Priority::RETRY).await?;
                },
                Ack::NackDiscard => {},
            }
        }
        Ok(processed)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn publish(
        &self,
        _cancel: &CancellationToken,
        resource: AnnotatedResource,
        priority: Priority,
    ) -> Result<(), CrawlError> {
        let mut levels = self.levels.lock().await;
        levels[priority.get() as usize].push_back(resource);
        drop(levels);
        self.notify.notify_one();
        Ok(())
    }

    async fn consume(&self, cancel: &CancellationToken, handler: Arc<dyn ConsumeHandler>) -> Result<(), CrawlError> {
        loop {
            let resource = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                popped = self.pop_highest() => popped,
            };

            let Some(resource) = resource else {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = self.notify.notified() => {},
                }
                continue;
            };

            match handler.handle(resource.clone()).await {
                Ok(Ack::Ack) => {},
                Ok(Ack::NackRequeue) => {
                    self.publish(cancel, resource, Priority::RETRY).await?;
                },
                Ok(Ack::NackDiscard) => {},
                Err(e) => return Err(e),
            }
        }
    }

    async fn depth(&self) -> Result<usize, CrawlError> {
        Ok(self.len().await)
    }
}

/// The three named queues the crawler dispatches onto.
#[derive(Clone)]
pub struct Queues {
    pub files: Arc<dyn Queue>,
    pub directories: Arc<dyn Queue>,
    pub hashes: Arc<dyn Queue>,
}

impl Queues {
    pub fn in_memory() -> Self {
        Self {
            files: Arc::new(MemoryQueue::new()),
            directories: Arc::new(MemoryQueue::new()),
            hashes: Arc::new(MemoryQueue::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_rejects_out_of_range() {
        assert!(Priority::new(10).is_err());
        assert!(Priority::new(9).is_ok());
    }

    #[test]
    fn random_child_is_in_one_to_seven() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let p = Priority::random_child(&mut rng).get();
            assert!((1..=7).contains(&p));
        }
    }

    #[tokio::test]
    async fn publish_then_pop_highest_priority_first() {
        let q = MemoryQueue::new();
        let cancel = CancellationToken::new();
        let r = |id: &str| AnnotatedResource::root(crate::resource::Resource::ipfs(id));

        q.publish(&cancel, r("low"), Priority::new(1).unwrap()).await.unwrap();
        q.publish(&cancel, r("high"), Priority::new(8).unwrap()).await.unwrap();

        let first = q.pop_highest().await.unwrap();
        assert_eq!(first.id(), "high");
        let second = q.pop_highest().await.unwrap();
        assert_eq!(second.id(), "low");
    }
}
