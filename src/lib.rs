//! Core crawl pipeline for a distributed content-addressed filesystem:
//! classifies, indexes, and fans out work for resources discovered on a
//! content-addressed p2p network.
//!
//! This crate implements the crawler (C5) and worker pool (C6) together
//! with the boundary traits for the protocol client (C1), extractor (C2),
//! index adapter (C3), and queue adapter (C4), plus in-memory reference
//! implementations of the latter two for tests and demos. The CLI wrapper,
//! configuration loader, and sniffer subsystem that would sit around this
//! crate in a full deployment are out of scope.

pub mod config;
pub mod crawler;
pub mod error;
pub mod extractor;
pub mod index;
pub mod instrumentation;
pub mod protocol;
pub mod queue;
#[cfg(feature = "amqp")]
pub mod queue_amqp;
pub mod resource;
pub mod worker;

pub use config::Config;
pub use crawler::Crawler;
pub use error::{CrawlError, ErrorFamily};
pub use extractor::{Extractor, HttpExtractor};
pub use index::{Index, Indexes, MemoryIndex};
pub use protocol::{IpfsClient, ProtocolClient};
pub use queue::{MemoryQueue, Queue, Queues};
pub use resource::{AnnotatedResource, Protocol, Reference, Resource, ResourceType};
pub use worker::{CrawlHandler, QueueKind, WorkerPool};
