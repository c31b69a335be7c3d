//! The crawler (C5): the single mutator in the pipeline. Orchestrates
//! pre-crawl dedup, directory streaming, file extraction, child dispatch,
//! and terminal indexing. Every other component is a stateless collaborator
//! injected at construction.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::error::CrawlError;
use crate::extractor::Extractor;
use crate::index::{
    Document, DocumentPatch, ExistingItem, FileDocument, DirectoryDocument, Indexes, InvalidDocument,
    UnsupportedDocument,
};
use crate::instrumentation::Instrumentation;
use crate::protocol::ProtocolClient;
use crate::queue::{Priority, Queues};
use crate::resource::{AnnotatedResource, Link, LinkType, Reference, Resource, ResourceType};

pub struct Crawler {
    protocol: Arc<dyn ProtocolClient>,
    extractor: Arc<dyn Extractor>,
    indexes: Indexes,
    queues: Queues,
    config: Config,
    instr: Instrumentation,
}

impl Crawler {
    pub fn new(
        protocol: Arc<dyn ProtocolClient>,
        extractor: Arc<dyn Extractor>,
        indexes: Indexes,
        queues: Queues,
        config: Config,
    ) -> Self {
        Self { protocol, extractor, indexes, queues, config, instr: Instrumentation::new("crawler") }
    }

    pub fn indexes(&self) -> &Indexes {
        &self.indexes
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The single polymorphic entry point, dispatching on the resource's
    /// declared type (spec.md §4.5).
    #[instrument(skip_all, fields(cid = %r.id(), kind = %r.kind))]
    pub async fn crawl(&self, cancel: &CancellationToken, r: AnnotatedResource) -> Result<(), CrawlError> {
        let _span = self.instr.span("crawl").entered();

        match r.kind {
            ResourceType::Undefined => self.crawl_hash(cancel, r).await,
            ResourceType::File => self.crawl_file(cancel, r).await,
            ResourceType::Directory => self.crawl_dir(cancel, r).await,
            ResourceType::Unsupported => self.index_unsupported(cancel, &r).await,
            ResourceType::Invalid => Err(CrawlError::UnexpectedType(r.kind)),
        }
    }

    /// Enqueues a freshly discovered resource as a root of a crawl, at the
    /// highest priority band (spec.md §4.5.5).
    pub async fn publish_root(&self, cancel: &CancellationToken, resource: Resource) -> Result<(), CrawlError> {
        let r = AnnotatedResource::root(resource);
        self.queues.hashes.publish(cancel, r, Priority::ROOT).await
    }

    // --- 4.5.1 pre-crawl ---------------------------------------------------

    #[instrument(skip(self, cancel))]
    async fn pre_crawl(&self, cancel: &CancellationToken, r: &AnnotatedResource) -> Result<ExistingItem, CrawlError> {
        let existing = self.indexes.find_any(cancel, r.id()).await?;

        let Some(kind) = existing.index else {
            return Ok(ExistingItem::not_found());
        };

        let index = self.indexes.for_kind(kind);
        let mut references = existing.references.clone();

        if let Some(reference) = r.reference.clone() {
            let is_new = crate::index::add_reference_if_new(&mut references, reference);

            if is_new {
                index
                    .update(cancel, r.id(), DocumentPatch { references: references.clone(), last_seen: Utc::now() })
                    .await?;
            } else if let Some(doc) = index.get(cancel, r.id()).await? {
                let age = Utc::now() - doc.last_seen();
                let min_age = chrono::Duration::from_std(self.config.min_update_age).unwrap_or(chrono::Duration::zero());
                if age > min_age {
                    index.update(cancel, r.id(), DocumentPatch { references, last_seen: Utc::now() }).await?;
                }
            }
        }

        info!(?kind, "resource already finalized, skipping crawl");
        Ok(ExistingItem { index: Some(kind), references })
    }

    fn initial_references(r: &AnnotatedResource, existing: &ExistingItem) -> Vec<Reference> {
        let mut refs = existing.references.clone();
        if let Some(reference) = r.reference.clone() {
            crate::index::add_reference_if_new(&mut refs, reference);
        }
        refs
    }

    async fn write_invalid(
        &self,
        cancel: &CancellationToken,
        r: &AnnotatedResource,
        existing: &ExistingItem,
        reason: impl Into<String>,
    ) -> Result<(), CrawlError> {
        let now = Utc::now();
        let doc = Document::Invalid(InvalidDocument {
            error: reason.into(),
            references: Self::initial_references(r, existing),
            first_seen: now,
            last_seen: now,
        });
        self.indexes.invalid.index(cancel, r.id(), doc).await
    }

    /// Writes an Unsupported marker if the resource is not already
    /// finalized elsewhere. Used both for top-level dispatch and for
    /// directory entries classified Unsupported (no queue round-trip, the
    /// outcome is already known).
    #[instrument(skip(self, cancel))]
    async fn index_unsupported(&self, cancel: &CancellationToken, r: &AnnotatedResource) -> Result<(), CrawlError> {
        let existing = self.pre_crawl(cancel, r).await?;
        if !existing.should_crawl() {
            return Ok(());
        }

        let now = Utc::now();
        let doc = Document::Unsupported(UnsupportedDocument {
            references: Self::initial_references(r, &existing),
            first_seen: now,
            last_seen: now,
        });
        self.indexes.unsupported.index(cancel, r.id(), doc).await
    }

    /// Records a document for a permanent-content error surfaced from a
    /// sub-collaborator (extractor/protocol decode failures), used by the
    /// worker pool on permanent error (spec.md §4.6 step 5). A no-op if the
    /// resource is already finalized.
    pub async fn record_permanent_failure(
        &self,
        cancel: &CancellationToken,
        r: &AnnotatedResource,
        reason: impl Into<String>,
    ) -> Result<(), CrawlError> {
        let existing = self.indexes.find_any(cancel, r.id()).await?;
        if !existing.should_crawl() {
            return Ok(());
        }
        self.write_invalid(cancel, r, &existing, reason).await
    }

    // --- 4.5.3 file crawl ---------------------------------------------------

    #[instrument(skip(self, cancel))]
    async fn crawl_file(&self, cancel: &CancellationToken, r: AnnotatedResource) -> Result<(), CrawlError> {
        let existing = self.pre_crawl(cancel, &r).await?;
        if !existing.should_crawl() {
            return Ok(());
        }
        self.do_crawl_file(cancel, r, existing).await
    }

    async fn do_crawl_file(
        &self,
        cancel: &CancellationToken,
        r: AnnotatedResource,
        existing: ExistingItem,
    ) -> Result<(), CrawlError> {
        if r.size > self.config.metadata_max_size {
            self.write_invalid(cancel, &r, &existing, "too large").await?;
            return Ok(());
        }

        let gateway = self.protocol.gateway_url(&r);
        let metadata = self.extractor.extract(cancel, &r.resource, gateway, self.config.metadata_max_size).await?;

        let now = Utc::now();
        let doc = Document::File(FileDocument {
            size: r.size,
            references: Self::initial_references(&r, &existing),
            metadata,
            first_seen: now,
            last_seen: now,
        });
        self.indexes.files.index(cancel, r.id(), doc).await
    }

    // --- 4.5.2 directory crawl ----------------------------------------------

    #[instrument(skip(self, cancel))]
    async fn crawl_dir(&self, cancel: &CancellationToken, r: AnnotatedResource) -> Result<(), CrawlError> {
        let existing = self.pre_crawl(cancel, &r).await?;
        if !existing.should_crawl() {
            return Ok(());
        }
        self.do_crawl_dir(cancel, r, existing).await
    }

    async fn do_crawl_dir(
        &self,
        cancel: &CancellationToken,
        r: AnnotatedResource,
        existing: ExistingItem,
    ) -> Result<(), CrawlError> {
        let (tx, mut rx) = mpsc::channel(self.config.dir_entry_buffer_size);
        let dir_cancel = cancel.child_token();

        let producer = {
            let protocol = Arc::clone(&self.protocol);
            let resource = r.resource.clone();
            let producer_cancel = dir_cancel.clone();
            tokio::spawn(async move { protocol.ls(&producer_cancel, &resource, tx).await })
        };

        let mut links = Vec::new();
        let consumer_result = self.process_dir_entries(&dir_cancel, cancel, &mut rx, &mut links).await;

        let producer_result = producer
            .await
            .map_err(|e| CrawlError::Infrastructure(format!("directory listing task panicked: {e}")))?;

        match (producer_result, consumer_result) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(dir_cnt)) => self.finish_dir(cancel, r, existing, links, dir_cnt).await,
        }
    }

    async fn process_dir_entries(
        &self,
        dir_cancel: &CancellationToken,
        parent_cancel: &CancellationToken,
        rx: &mut mpsc::Receiver<AnnotatedResource>,
        links: &mut Vec<Link>,
    ) -> Result<u64, CrawlError> {
        let mut dir_cnt: u64 = 0;

        loop {
            let entry = tokio::select! {
                _ = parent_cancel.cancelled() => {
                    dir_cancel.cancel();
                    return Err(CrawlError::Timeout { stage: "dir-entry" });
                },
                timed = tokio::time::timeout(self.config.dir_entry_timeout, rx.recv()) => timed,
            };

            let entry = match entry {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(_elapsed) => {
                    dir_cancel.cancel();
                    return Err(CrawlError::Timeout { stage: "dir-entry" });
                },
            };

            dir_cnt += 1;
            if dir_cnt <= self.config.max_dir_size {
                links.push(entry_to_link(&entry)?);
            }

            if let Err(e) = self.dispatch_child(parent_cancel, &entry).await {
                dir_cancel.cancel();
                return Err(e);
            }
        }

        Ok(dir_cnt)
    }

    async fn finish_dir(
        &self,
        cancel: &CancellationToken,
        r: AnnotatedResource,
        existing: ExistingItem,
        links: Vec<Link>,
        dir_cnt: u64,
    ) -> Result<(), CrawlError> {
        if dir_cnt > self.config.max_dir_size {
            warn!(dir_cnt, max = self.config.max_dir_size, "directory exceeds configured size limit");
            return Err(CrawlError::DirectoryTooLarge);
        }

        let now = Utc::now();
        let doc = Document::Directory(DirectoryDocument {
            size: r.size,
            links,
            references: Self::initial_references(&r, &existing),
            first_seen: now,
            last_seen: now,
        });
        self.indexes.directories.index(cancel, r.id(), doc).await
    }

    // --- 4.5.5 child dispatch -----------------------------------------------

    async fn dispatch_child(&self, cancel: &CancellationToken, entry: &AnnotatedResource) -> Result<(), CrawlError> {
        match entry.kind {
            ResourceType::Undefined => {
                let priority = Priority::random_child(&mut rand::thread_rng());
                self.queues.hashes.publish(cancel, entry.clone(), priority).await
            },
            ResourceType::File => {
                let priority = Priority::random_child(&mut rand::thread_rng());
                self.queues.files.publish(cancel, entry.clone(), priority).await
            },
            ResourceType::Directory => {
                let priority = Priority::random_child(&mut rand::thread_rng());
                self.queues.directories.publish(cancel, entry.clone(), priority).await
            },
            ResourceType::Unsupported => self.index_unsupported(cancel, entry).await,
            ResourceType::Invalid => Err(CrawlError::UnexpectedType(entry.kind)),
        }
    }

    // --- 4.5.4 hash crawl -----------------------------------------------------

    #[instrument(skip(self, cancel))]
    async fn crawl_hash(&self, cancel: &CancellationToken, r: AnnotatedResource) -> Result<(), CrawlError> {
        let existing = self.pre_crawl(cancel, &r).await?;
        if !existing.should_crawl() {
            return Ok(());
        }

        let (kind, size) = self.protocol.stat(cancel, &r.resource).await?;
        let resolved = r.with_kind(kind).with_size(size);

        match kind {
            ResourceType::File => self.do_crawl_file(cancel, resolved, existing).await,
            ResourceType::Directory => self.do_crawl_dir(cancel, resolved, existing).await,
            ResourceType::Unsupported => self.index_unsupported(cancel, &resolved).await,
            ResourceType::Undefined | ResourceType::Invalid => {
                self.write_invalid(cancel, &resolved, &existing, "unrecognized type").await
            },
        }
    }
}

fn entry_to_link(entry: &AnnotatedResource) -> Result<Link, CrawlError> {
    let kind = LinkType::try_from(entry.kind)?;
    let name = entry.reference.as_ref().map(|r| r.name.clone()).unwrap_or_default();
    Ok(Link { hash: entry.id().to_owned(), name, size: entry.size, kind })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use url::Url;

    use super::*;

    struct StubProtocol {
        stat_kind: ResourceType,
        stat_size: u64,
        ls_entries: Vec<AnnotatedResource>,
    }

    #[async_trait]
    impl ProtocolClient for StubProtocol {
        async fn stat(&self, _cancel: &CancellationToken, _resource: &Resource) -> Result<(ResourceType, u64), CrawlError> {
            Ok((self.stat_kind, self.stat_size))
        }

        async fn ls(
            &self,
            _cancel: &CancellationToken,
            _resource: &Resource,
            sink: mpsc::Sender<AnnotatedResource>,
        ) -> Result<(), CrawlError> {
            for entry in self.ls_entries.clone() {
                sink.send(entry).await.map_err(|_| CrawlError::Infrastructure("closed".into()))?;
            }
            Ok(())
        }

        fn gateway_url(&self, resource: &AnnotatedResource) -> Url {
            Url::parse(&format!("http://gw.test/ipfs/{}", resource.id())).unwrap()
        }
    }

    #[derive(Default)]
    struct StubExtractor {
        calls: AtomicU64,
    }

    #[async_trait]
    impl Extractor for StubExtractor {
        async fn extract(
            &self,
            _cancel: &CancellationToken,
            _resource: &Resource,
            _gateway_url: Url,
            _max_size: u64,
        ) -> Result<Map<String, Value>, CrawlError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Map::new())
        }
    }

    fn test_crawler(protocol: StubProtocol, extractor: Arc<StubExtractor>, config: Config) -> Crawler {
        Crawler::new(Arc::new(protocol), extractor, Indexes::in_memory(), Queues::in_memory(), config)
    }

    fn default_protocol() -> StubProtocol {
        StubProtocol { stat_kind: ResourceType::File, stat_size: 0, ls_entries: vec![] }
    }

    // Scenario 1: single file.
    #[tokio::test]
    async fn crawls_single_file() {
        let crawler = test_crawler(default_protocol(), Arc::new(StubExtractor::default()), Config::default());
        let cancel = CancellationToken::new();
        let r = AnnotatedResource { resource: Resource::ipfs("Q-file-1"), reference: None, kind: ResourceType::File, size: 100 };

        crawler.crawl(&cancel, r).await.unwrap();

        let doc = crawler.indexes.files.get(&cancel, "Q-file-1").await.unwrap().unwrap();
        match doc {
            Document::File(f) => {
                assert_eq!(f.size, 100);
                assert!(f.references.is_empty());
            },
            _ => panic!("expected file document"),
        }
        assert!(crawler.indexes.directories.get(&cancel, "Q-file-1").await.unwrap().is_none());
    }

    // Scenario 2: small directory with two children.
    #[tokio::test]
    async fn crawls_small_directory() {
        let parent = Resource::ipfs("Q-dir-1");
        let a = AnnotatedResource {
            resource: Resource::ipfs("Q-a"),
            reference: Some(Reference { parent: parent.clone(), name: "a".into(), kind: ResourceType::File }),
            kind: ResourceType::File,
            size: 10,
        };
        let b = AnnotatedResource {
            resource: Resource::ipfs("Q-b"),
            reference: Some(Reference { parent: parent.clone(), name: "b".into(), kind: ResourceType::Directory }),
            kind: ResourceType::Directory,
            size: 0,
        };

        let protocol = StubProtocol { stat_kind: ResourceType::Directory, stat_size: 0, ls_entries: vec![a, b] };
        let crawler = test_crawler(protocol, Arc::new(StubExtractor::default()), Config::default());
        let cancel = CancellationToken::new();
        let r = AnnotatedResource::root(parent).with_kind(ResourceType::Directory);

        crawler.crawl(&cancel, r).await.unwrap();

        let doc = crawler.indexes.directories.get(&cancel, "Q-dir-1").await.unwrap().unwrap();
        let Document::Directory(d) = doc else { panic!("expected directory document") };
        assert_eq!(d.links.len(), 2);
        assert!(d.references.is_empty());

        assert_eq!(crawler.queues.files.depth().await.unwrap(), 1);
        assert_eq!(crawler.queues.directories.depth().await.unwrap(), 1);
    }

    // Scenario 3: oversized directory.
    #[tokio::test]
    async fn oversized_directory_reports_too_large_without_writing_document() {
        let mut config = Config::default();
        config.max_dir_size = 2;

        let parent = Resource::ipfs("Q-dir-big");
        let entries: Vec<_> = (0..3)
            .map(|i| AnnotatedResource {
                resource: Resource::ipfs(format!("Q-c{i}")),
                reference: Some(Reference { parent: parent.clone(), name: format!("c{i}"), kind: ResourceType::File }),
                kind: ResourceType::File,
                size: 1,
            })
            .collect();

        let protocol = StubProtocol { stat_kind: ResourceType::Directory, stat_size: 0, ls_entries: entries };
        let crawler = test_crawler(protocol, Arc::new(StubExtractor::default()), config);
        let cancel = CancellationToken::new();
        let r = AnnotatedResource::root(parent).with_kind(ResourceType::Directory);

        let err = crawler.crawl(&cancel, r).await.unwrap_err();
        assert!(matches!(err, CrawlError::DirectoryTooLarge));
        assert_eq!(crawler.queues.files.depth().await.unwrap(), 3);
        assert!(crawler.indexes.directories.get(&cancel, "Q-dir-big").await.unwrap().is_none());
    }

    // Scenario 4: file too large.
    #[tokio::test]
    async fn file_too_large_is_invalid_without_extraction() {
        let mut config = Config::default();
        config.metadata_max_size = 10;

        let extractor = Arc::new(StubExtractor::default());
        let crawler = test_crawler(default_protocol(), Arc::clone(&extractor), config);
        let cancel = CancellationToken::new();
        let r = AnnotatedResource { resource: Resource::ipfs("Q-big"), reference: None, kind: ResourceType::File, size: 11 };

        crawler.crawl(&cancel, r).await.unwrap();

        let doc = crawler.indexes.invalid.get(&cancel, "Q-big").await.unwrap().unwrap();
        let Document::Invalid(d) = doc else { panic!("expected invalid document") };
        assert_eq!(d.error, "too large");
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    }

    // Scenario 5: hash of unknown type resolves to file, in-process.
    #[tokio::test]
    async fn hash_resolves_to_file_in_process() {
        let protocol = StubProtocol { stat_kind: ResourceType::File, stat_size: 50, ls_entries: vec![] };
        let crawler = test_crawler(protocol, Arc::new(StubExtractor::default()), Config::default());
        let cancel = CancellationToken::new();
        let r = AnnotatedResource::root(Resource::ipfs("Q-x"));

        crawler.crawl(&cancel, r).await.unwrap();

        let doc = crawler.indexes.files.get(&cancel, "Q-x").await.unwrap().unwrap();
        let Document::File(f) = doc else { panic!("expected file document") };
        assert_eq!(f.size, 50);
        assert_eq!(crawler.queues.hashes.depth().await.unwrap(), 0);
    }

    // Scenario 6: re-observation appends a reference without re-crawling.
    #[tokio::test]
    async fn reobservation_appends_reference_without_recrawl() {
        let extractor = Arc::new(StubExtractor::default());
        let crawler = test_crawler(default_protocol(), Arc::clone(&extractor), Config::default());
        let cancel = CancellationToken::new();

        let parent_a = Resource::ipfs("Q-parent-a");
        let parent_b = Resource::ipfs("Q-parent-b");

        let first = AnnotatedResource {
            resource: Resource::ipfs("Q-shared"),
            reference: Some(Reference { parent: parent_a, name: "x".into(), kind: ResourceType::File }),
            kind: ResourceType::File,
            size: 5,
        };
        crawler.crawl(&cancel, first).await.unwrap();
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);

        let second = AnnotatedResource {
            resource: Resource::ipfs("Q-shared"),
            reference: Some(Reference { parent: parent_b, name: "y".into(), kind: ResourceType::File }),
            kind: ResourceType::File,
            size: 5,
        };
        crawler.crawl(&cancel, second).await.unwrap();
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1, "second crawl must not re-extract");

        let doc = crawler.indexes.files.get(&cancel, "Q-shared").await.unwrap().unwrap();
        let Document::File(f) = doc else { panic!("expected file document") };
        assert_eq!(f.references.len(), 2);
    }
}
