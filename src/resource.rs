//! The addressing and classification types shared by every component: what a
//! resource is, how it was discovered, and what the crawler decided it is.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tag for the overlay protocol a [`Resource`] lives on. Only one protocol is
/// in scope today, but the design leaves room for more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ipfs,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipfs => write!(f, "ipfs"),
        }
    }
}

/// A uniquely addressable item on a content-addressed protocol. Equality is
/// by `(protocol, id)`, as spec'd.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub protocol: Protocol,
    pub id: String,
}

impl Resource {
    pub fn new(protocol: Protocol, id: impl Into<String>) -> Self {
        Self { protocol, id: id.into() }
    }

    pub fn ipfs(id: impl Into<String>) -> Self {
        Self::new(Protocol::Ipfs, id)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.id)
    }
}

/// The classification a resource can receive. `Undefined` must be resolved
/// (via `Stat`) before the resource can be indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// Type not yet determined; must be resolved before indexing.
    Undefined,
    File,
    Directory,
    /// Recognized but not indexable: symlinks, metadata nodes, etc.
    Unsupported,
    /// Observed malformed.
    Invalid,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Undefined => "undefined",
            Self::File => "file",
            Self::Directory => "directory",
            Self::Unsupported => "unsupported",
            Self::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// An edge from a parent directory to a child, as observed via a directory
/// listing (or absent, for roots).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub parent: Resource,
    /// Possibly empty for roots.
    pub name: String,
    /// The type as observed via the parent listing; may be `Undefined` when
    /// unknown at link time.
    #[serde(rename = "type")]
    pub kind: ResourceType,
}

/// The unit of work carried on the queues: a resource plus its discovery
/// context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotatedResource {
    #[serde(flatten)]
    pub resource: Resource,
    pub reference: Option<Reference>,
    #[serde(rename = "type")]
    pub kind: ResourceType,
    /// Bytes, 0 if unknown.
    pub size: u64,
}

impl AnnotatedResource {
    /// A root-of-crawl resource: no reference, type unresolved.
    pub fn root(resource: Resource) -> Self {
        Self { resource, reference: None, kind: ResourceType::Undefined, size: 0 }
    }

    pub fn with_kind(mut self, kind: ResourceType) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn id(&self) -> &str {
        &self.resource.id
    }
}

/// Entry-type as stored in a `Directory` document's `links`. Distinct from
/// `ResourceType`: directories record `Unknown` rather than `Undefined`, and
/// never record `Invalid` (malformed entries are handled at dispatch time,
/// before a link is ever recorded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    File,
    Directory,
    Unknown,
    Unsupported,
}

impl TryFrom<ResourceType> for LinkType {
    type Error = crate::error::CrawlError;

    fn try_from(kind: ResourceType) -> Result<Self, Self::Error> {
        match kind {
            ResourceType::File => Ok(Self::File),
            ResourceType::Directory => Ok(Self::Directory),
            ResourceType::Undefined => Ok(Self::Unknown),
            ResourceType::Unsupported => Ok(Self::Unsupported),
            ResourceType::Invalid => Err(crate::error::CrawlError::UnexpectedType(kind)),
        }
    }
}

/// A directory-entry record embedded in a `Directory` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub hash: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: LinkType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_type_maps_undefined_to_unknown() {
        assert_eq!(LinkType::try_from(ResourceType::Undefined).unwrap(), LinkType::Unknown);
    }

    #[test]
    fn link_type_rejects_invalid() {
        assert!(LinkType::try_from(ResourceType::Invalid).is_err());
    }

    #[test]
    fn resource_equality_is_protocol_and_id() {
        let a = Resource::ipfs("Qmabc");
        let b = Resource::ipfs("Qmabc");
        assert_eq!(a, b);
    }
}
