//! End-to-end exercise of the crawler against the in-memory `Index`/`Queue`
//! reference implementations and stub `Protocol`/`Extractor` collaborators,
//! through the crate's public API only.

use std::sync::Arc;

use async_trait::async_trait;
use ipcrawl::{
    AnnotatedResource, Config, Crawler, CrawlError, Extractor, Index, Indexes, ProtocolClient, Queue, Queues,
    Reference, Resource, ResourceType,
};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

struct StubProtocol {
    stat: (ResourceType, u64),
}

#[async_trait]
impl ProtocolClient for StubProtocol {
    async fn stat(&self, _cancel: &CancellationToken, _resource: &Resource) -> Result<(ResourceType, u64), CrawlError> {
        Ok(self.stat)
    }

    async fn ls(
        &self,
        _cancel: &CancellationToken,
        _resource: &Resource,
        _sink: mpsc::Sender<AnnotatedResource>,
    ) -> Result<(), CrawlError> {
        Ok(())
    }

    fn gateway_url(&self, resource: &AnnotatedResource) -> Url {
        Url::parse(&format!("http://gateway.test/ipfs/{}", resource.id())).unwrap()
    }
}

struct StubExtractor;

#[async_trait]
impl Extractor for StubExtractor {
    async fn extract(
        &self,
        _cancel: &CancellationToken,
        _resource: &Resource,
        _gateway_url: Url,
        _max_size: u64,
    ) -> Result<Map<String, Value>, CrawlError> {
        let mut m = Map::new();
        m.insert("mime".into(), Value::String("application/octet-stream".into()));
        Ok(m)
    }
}

fn build_crawler(stat_kind: ResourceType, stat_size: u64) -> (Crawler, Indexes, Queues) {
    let indexes = Indexes::in_memory();
    let queues = Queues::in_memory();
    let crawler = Crawler::new(
        Arc::new(StubProtocol { stat: (stat_kind, stat_size) }),
        Arc::new(StubExtractor),
        indexes.clone(),
        queues.clone(),
        Config::default(),
    );
    (crawler, indexes, queues)
}

#[tokio::test]
async fn single_file_is_indexed_with_no_publishes() {
    let (crawler, indexes, queues) = build_crawler(ResourceType::File, 0);
    let cancel = CancellationToken::new();

    let r = AnnotatedResource {
        resource: Resource::ipfs("Q-file-1"),
        reference: None,
        kind: ResourceType::File,
        size: 100,
    };
    crawler.crawl(&cancel, r).await.unwrap();

    assert!(indexes.files.get(&cancel, "Q-file-1").await.unwrap().is_some());
    assert_eq!(queues.hashes.depth().await.unwrap(), 0);
    assert_eq!(queues.files.depth().await.unwrap(), 0);
    assert_eq!(queues.directories.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn unsupported_hash_resolves_without_queue_publish() {
    let (crawler, indexes, queues) = build_crawler(ResourceType::Unsupported, 0);
    let cancel = CancellationToken::new();

    let r = AnnotatedResource::root(Resource::ipfs("Q-symlink"));
    crawler.crawl(&cancel, r).await.unwrap();

    assert!(indexes.unsupported.get(&cancel, "Q-symlink").await.unwrap().is_some());
    assert_eq!(queues.hashes.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn reobservation_is_cheap_and_idempotent() {
    let (crawler, indexes, _queues) = build_crawler(ResourceType::File, 0);
    let cancel = CancellationToken::new();

    let a = Reference { parent: Resource::ipfs("Q-parent-a"), name: "x".into(), kind: ResourceType::File };
    let b = Reference { parent: Resource::ipfs("Q-parent-b"), name: "y".into(), kind: ResourceType::File };

    for reference in [a, b.clone()] {
        let r = AnnotatedResource {
            resource: Resource::ipfs("Q-shared"),
            reference: Some(reference),
            kind: ResourceType::File,
            size: 5,
        };
        crawler.crawl(&cancel, r).await.unwrap();
    }

    // Re-observing the exact same reference again must not grow the list.
    let r = AnnotatedResource {
        resource: Resource::ipfs("Q-shared"),
        reference: Some(b),
        kind: ResourceType::File,
        size: 5,
    };
    crawler.crawl(&cancel, r).await.unwrap();

    let doc = indexes.files.get(&cancel, "Q-shared").await.unwrap().unwrap();
    let ipcrawl::index::Document::File(f) = doc else { panic!("expected file document") };
    assert_eq!(f.references.len(), 2);
}
