//! The index adapter boundary (C3): read/write of document records keyed by
//! resource ID. Four logical indices (Files, Directories, Unsupported,
//! Invalid) are each a separate `Index` handle, bundled in `Indexes` —
//! mirroring the original's `crawler.Indexes{Files, Directories, Unsupported,
//! Invalid index.Index}`. The backend itself is an external collaborator;
//! this module defines the interface and a concurrency-safe in-memory
//! implementation used by tests and as a runnable demo.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::CrawlError;
use crate::resource::{Link, Reference};

/// Which of the four logical indices a document lives in, used to record
/// pre-crawl lookup results and tag documents for (de)serialization. A
/// document ID appears in at most one of these at any time; enforcing that
/// invariant is the crawler's job, not the adapter's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Files,
    Directories,
    Unsupported,
    Invalid,
}

pub type Metadata = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDocument {
    pub size: u64,
    pub references: Vec<Reference>,
    pub metadata: Metadata,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryDocument {
    pub size: u64,
    pub links: Vec<Link>,
    pub references: Vec<Reference>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsupportedDocument {
    pub references: Vec<Reference>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidDocument {
    pub error: String,
    pub references: Vec<Reference>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Document {
    File(FileDocument),
    Directory(DirectoryDocument),
    Unsupported(UnsupportedDocument),
    Invalid(InvalidDocument),
}

impl Document {
    pub fn references(&self) -> &[Reference] {
        match self {
            Self::File(d) => &d.references,
            Self::Directory(d) => &d.references,
            Self::Unsupported(d) => &d.references,
            Self::Invalid(d) => &d.references,
        }
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        match self {
            Self::File(d) => d.last_seen,
            Self::Directory(d) => d.last_seen,
            Self::Unsupported(d) => d.last_seen,
            Self::Invalid(d) => d.last_seen,
        }
    }
}

/// A merge-patch used to extend `references` and refresh `last-seen`
/// without re-crawling content.
#[derive(Debug, Clone)]
pub struct DocumentPatch {
    pub references: Vec<Reference>,
    pub last_seen: DateTime<Utc>,
}

/// The result of a pre-crawl lookup.
#[derive(Debug, Clone)]
pub struct ExistingItem {
    pub index: Option<IndexKind>,
    pub references: Vec<Reference>,
}

impl ExistingItem {
    pub fn not_found() -> Self {
        Self { index: None, references: Vec::new() }
    }

    /// The content is already finalized; re-crawling would be wasted work.
    pub fn should_crawl(&self) -> bool {
        self.index.is_none()
    }
}

#[async_trait]
pub trait Index: Send + Sync {
    async fn get(&self, cancel: &CancellationToken, id: &str) -> Result<Option<Document>, CrawlError>;
    async fn index(&self, cancel: &CancellationToken, id: &str, doc: Document) -> Result<(), CrawlError>;
    async fn update(&self, cancel: &CancellationToken, id: &str, patch: DocumentPatch) -> Result<(), CrawlError>;
}

/// Concurrency-safe in-memory `Index`, used by tests and as a runnable demo.
/// Operations against distinct IDs are independent, as spec'd; this
/// implementation additionally serializes operations on the same ID via
/// `DashMap`'s per-shard locking.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    docs: DashMap<String, Document>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Index for MemoryIndex {
    async fn get(&self, _cancel: &CancellationToken, id: &str) -> Result<Option<Document>, CrawlError> {
        Ok(self.docs.get(id).map(|e| e.value().clone()))
    }

    async fn index(&self, _cancel: &CancellationToken, id: &str, doc: Document) -> Result<(), CrawlError> {
        self.docs.insert(id.to_owned(), doc);
        Ok(())
    }

    async fn update(&self, _cancel: &CancellationToken, id: &str, patch: DocumentPatch) -> Result<(), CrawlError> {
        let mut entry = self
            .docs
            .get_mut(id)
            .ok_or_else(|| CrawlError::invalid(format!("update of missing document {id}")))?;

        match &mut *entry {
            Document::File(d) => {
                d.references = patch.references;
                d.last_seen = patch.last_seen;
            },
            Document::Directory(d) => {
                d.references = patch.references;
                d.last_seen = patch.last_seen;
            },
            Document::Unsupported(d) => {
                d.references = patch.references;
                d.last_seen = patch.last_seen;
            },
            Document::Invalid(d) => {
                d.references = patch.references;
                d.last_seen = patch.last_seen;
            },
        }

        Ok(())
    }
}

/// The four logical indices used during a crawl.
#[derive(Clone)]
pub struct Indexes {
    pub files: Arc<dyn Index>,
    pub directories: Arc<dyn Index>,
    pub unsupported: Arc<dyn Index>,
    pub invalid: Arc<dyn Index>,
}

impl Indexes {
    pub fn in_memory() -> Self {
        Self {
            files: Arc::new(MemoryIndex::new()),
            directories: Arc::new(MemoryIndex::new()),
            unsupported: Arc::new(MemoryIndex::new()),
            invalid: Arc::new(MemoryIndex::new()),
        }
    }

    /// Looks up `id` across all four indices in turn, returning the first
    /// hit. Used by the crawler's pre-crawl dedup.
    pub async fn find_any(&self, cancel: &CancellationToken, id: &str) -> Result<ExistingItem, CrawlError> {
        for (kind, index) in [
            (IndexKind::Files, &self.files),
            (IndexKind::Directories, &self.directories),
            (IndexKind::Unsupported, &self.unsupported),
            (IndexKind::Invalid, &self.invalid),
        ] {
            if let Some(doc) = index.get(cancel, id).await? {
                return Ok(ExistingItem { index: Some(kind), references: doc.references().to_vec() });
            }
        }

        Ok(ExistingItem::not_found())
    }

    pub fn for_kind(&self, kind: IndexKind) -> &Arc<dyn Index> {
        match kind {
            IndexKind::Files => &self.files,
            IndexKind::Directories => &self.directories,
            IndexKind::Unsupported => &self.unsupported,
            IndexKind::Invalid => &self.invalid,
        }
    }
}

/// Appends `new_ref` to `references` if no existing entry shares the same
/// `(parent, name)`. Duplicate reference insertion is idempotent.
pub fn add_reference_if_new(references: &mut Vec<Reference>, new_ref: Reference) -> bool {
    let exists = references.iter().any(|r| r.parent == new_ref.parent && r.name == new_ref.name);
    if !exists {
        references.push(new_ref);
    }
    !exists
}
