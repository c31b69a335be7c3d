//! The protocol boundary (C1): a content-addressed-filesystem client that
//! streams directory listings as a lazy sequence and classifies node types
//! from the wire encoding. Concurrency-safe: all operations are reentrant
//! and hold no shared mutable state.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use rand::Rng;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, trace};
use url::Url;

use crate::error::CrawlError;
use crate::resource::{AnnotatedResource, Reference, Resource, ResourceType};

const PATH_ESCAPE: &AsciiSet = &CONTROLS.add(b'/').add(b'?').add(b'#');

#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// One network round-trip; classifies the node from the protocol's type
    /// field.
    async fn stat(
        &self,
        cancel: &CancellationToken,
        resource: &Resource,
    ) -> Result<(ResourceType, u64), CrawlError>;

    /// Streams directory children one by one into `sink`. Yields children
    /// as they arrive — never buffers the full listing.
    async fn ls(
        &self,
        cancel: &CancellationToken,
        resource: &Resource,
        sink: mpsc::Sender<AnnotatedResource>,
    ) -> Result<(), CrawlError>;

    /// Produces a fetch URL for metadata extraction.
    fn gateway_url(&self, resource: &AnnotatedResource) -> Url;
}

/// The protobuf-derived node type as carried on the wire, shared by `stat`
/// and `ls` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireNodeKind {
    Raw,
    Directory,
    File,
    Metadata,
    Symlink,
    HamtShard,
    Other(i64),
}

impl From<i64> for WireNodeKind {
    fn from(value: i64) -> Self {
        match value {
            0 => Self::Raw,
            1 => Self::Directory,
            2 => Self::File,
            3 => Self::Metadata,
            4 => Self::Symlink,
            5 => Self::HamtShard,
            other => Self::Other(other),
        }
    }
}

/// Maps the wire type field to a `ResourceType`, per spec.md §4.1:
/// `{raw, file -> File; directory, HAMT-shard, metadata -> Directory;
/// anything else -> Unsupported}`.
fn classify(kind: WireNodeKind) -> ResourceType {
    match kind {
        WireNodeKind::Raw | WireNodeKind::File => ResourceType::File,
        WireNodeKind::Directory | WireNodeKind::HamtShard | WireNodeKind::Metadata => {
            ResourceType::Directory
        },
        WireNodeKind::Symlink | WireNodeKind::Other(_) => ResourceType::Unsupported,
    }
}

#[derive(Debug, Deserialize)]
struct StatWire {
    #[serde(rename = "Type")]
    kind: i64,
    #[serde(rename = "CumulativeSize")]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct LsLinkWire {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Hash")]
    hash: String,
    #[serde(rename = "Size")]
    size: u64,
    #[serde(rename = "Type")]
    kind: i64,
}

#[derive(Debug, Deserialize)]
struct LsObjectWire {
    #[serde(rename = "Links")]
    links: Vec<LsLinkWire>,
}

#[derive(Debug, Deserialize)]
struct LsOutputWire {
    #[serde(rename = "Objects")]
    objects: Vec<LsObjectWire>,
}

pub struct IpfsClient {
    http: reqwest::Client,
    gateway_url: Url,
    api_url: Url,
    max_retries: u32,
    retry_wait: Duration,
}

impl IpfsClient {
    pub fn new(gateway_url: Url, api_url: Url, max_retries: u32, retry_wait: Duration) -> Result<Self, CrawlError> {
        if !gateway_url.is_absolute() {
            return Err(CrawlError::invalid(format!("gateway URL is not absolute: {gateway_url}")));
        }
        if !api_url.is_absolute() {
            return Err(CrawlError::invalid(format!("API URL is not absolute: {api_url}")));
        }

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| CrawlError::Infrastructure(format!("failed to build http client: {e}")))?;

        Ok(Self { http, gateway_url, api_url, max_retries, retry_wait })
    }

    fn absolute_path(resource: &Resource) -> String {
        format!("/ipfs/{}", resource.id)
    }

    fn named_path(resource: &AnnotatedResource) -> String {
        if let Some(reference) = resource.reference.as_ref().filter(|r| !r.name.is_empty()) {
            format!(
                "/ipfs/{}/{}",
                reference.parent.id,
                utf8_percent_encode(&reference.name, PATH_ESCAPE)
            )
        } else {
            Self::absolute_path(&resource.resource)
        }
    }

    /// Explicit bounded retry with exponential backoff and jitter (spec.md
    /// §9 REDESIGN FLAG), in place of the original's mutable-flag-plus-sleep
    /// loop. Only `TemporaryTransport`-family errors are retried.
    async fn send_with_retry(
        &self,
        cancel: &CancellationToken,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, CrawlError> {
        let mut attempt = 0u32;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(CrawlError::Timeout { stage: "request" }),
                result = build().send() => result,
            };

            let outcome = match result {
                Ok(resp) => resp.error_for_status().map_err(CrawlError::from),
                Err(e) => Err(CrawlError::from(e)),
            };

            match outcome {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_temporary() && attempt < self.max_retries => {
                    let backoff = self.retry_wait * 2u32.pow(attempt);
                    let jitter_ms = rand::thread_rng().gen_range(0..100);
                    trace!(attempt, ?backoff, "retrying after temporary transport error");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CrawlError::Timeout { stage: "retry" }),
                        _ = tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)) => {},
                    }
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ProtocolClient for IpfsClient {
    #[instrument(skip(self, cancel), fields(cid = %resource.id))]
    async fn stat(
        &self,
        cancel: &CancellationToken,
        resource: &Resource,
    ) -> Result<(ResourceType, u64), CrawlError> {
        let path = Self::absolute_path(resource);
        let url = self
            .api_url
            .join("api/v0/object/stat")
            .expect("static path joins cleanly");

        let resp = self
            .send_with_retry(cancel, || self.http.get(url.clone()).query(&[("arg", &path)]))
            .await?;

        let body = resp.bytes().await?;
        let wire: StatWire = serde_json::from_slice(&body)?;
        Ok((classify(wire.kind.into()), wire.size))
    }

    #[instrument(skip(self, cancel, sink), fields(cid = %resource.id))]
    async fn ls(
        &self,
        cancel: &CancellationToken,
        resource: &Resource,
        sink: mpsc::Sender<AnnotatedResource>,
    ) -> Result<(), CrawlError> {
        let path = Self::absolute_path(resource);
        let url = self.api_url.join("api/v0/ls").expect("static path joins cleanly");

        let resp = self
            .send_with_retry(cancel, || {
                self.http.get(url.clone()).query(&[("arg", &path), ("stream", &"true".to_owned())])
            })
            .await?;

        let mut stream = resp.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();

        loop {
            while let Some((output, used)) = try_decode_one(&buf)? {
                buf.drain(..used);

                for object in output.objects {
                    for link in object.links {
                        let entry = AnnotatedResource {
                            resource: Resource::ipfs(link.hash.clone()),
                            reference: Some(Reference {
                                parent: resource.clone(),
                                name: link.name,
                                kind: classify(link.kind.into()),
                            }),
                            kind: classify(link.kind.into()),
                            size: link.size,
                        };

                        tokio::select! {
                            _ = cancel.cancelled() => return Err(CrawlError::Timeout { stage: "ls" }),
                            send_res = sink.send(entry) => {
                                send_res.map_err(|_| CrawlError::Infrastructure("directory entry sink closed".into()))?;
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(CrawlError::Timeout { stage: "ls" }),
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
                        Some(Err(e)) => return Err(e.into()),
                        None => break,
                    }
                }
            }
        }

        Ok(())
    }

    fn gateway_url(&self, resource: &AnnotatedResource) -> Url {
        self.gateway_url
            .join(&Self::named_path(resource))
            .expect("named_path always produces a valid relative path")
    }
}

/// Attempts to decode a single `LsOutputWire` value from the front of `buf`.
/// Returns `Ok(None)` when `buf` doesn't yet hold a complete value (more
/// bytes needed from the stream); returns `Err` for a malformed value, which
/// is distinct from running out of bytes and must not be treated as "need
/// more input".
fn try_decode_one(buf: &[u8]) -> Result<Option<(LsOutputWire, usize)>, CrawlError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut de = serde_json::Deserializer::from_slice(buf).into_iter::<LsOutputWire>();
    match de.next() {
        Some(Ok(value)) => {
            let consumed = de.byte_offset();
            Ok(Some((value, consumed)))
        },
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(CrawlError::Decode(e.to_string())),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_per_spec_table() {
        assert_eq!(classify(WireNodeKind::Raw), ResourceType::File);
        assert_eq!(classify(WireNodeKind::File), ResourceType::File);
        assert_eq!(classify(WireNodeKind::Directory), ResourceType::Directory);
        assert_eq!(classify(WireNodeKind::HamtShard), ResourceType::Directory);
        assert_eq!(classify(WireNodeKind::Metadata), ResourceType::Directory);
        assert_eq!(classify(WireNodeKind::Symlink), ResourceType::Unsupported);
        assert_eq!(classify(WireNodeKind::Other(99)), ResourceType::Unsupported);
    }

    #[test]
    fn named_path_escapes_and_uses_parent() {
        let parent = Resource::ipfs("Qmparent");
        let r = AnnotatedResource {
            resource: Resource::ipfs("Qmchild"),
            reference: Some(Reference { parent: parent.clone(), name: "a file.jpg".into(), kind: ResourceType::File }),
            kind: ResourceType::File,
            size: 10,
        };
        assert_eq!(IpfsClient::named_path(&r), "/ipfs/Qmparent/a%20file.jpg");
    }

    #[test]
    fn named_path_falls_back_to_absolute_for_empty_name() {
        let r = AnnotatedResource::root(Resource::ipfs("Qmroot"));
        assert_eq!(IpfsClient::named_path(&r), "/ipfs/Qmroot");
    }

    #[test]
    fn partial_buffer_is_not_decoded() {
        let partial = br#"{"Objects":[{"Links":[{"Name":"a","Hash":"Qm","#;
        assert!(try_decode_one(partial).unwrap().is_none());
    }

    #[test]
    fn complete_buffer_decodes_and_reports_consumed_len() {
        let complete =
            br#"{"Objects":[{"Links":[{"Name":"a","Hash":"Qma","Size":1,"Type":2}]}]}"#;
        let (out, used) = try_decode_one(complete).unwrap().unwrap();
        assert_eq!(used, complete.len());
        assert_eq!(out.objects[0].links[0].name, "a");
    }

    #[test]
    fn malformed_value_is_a_decode_error_not_a_partial_read() {
        let malformed = br#"{"Objects": "not-an-array"}"#;
        assert!(matches!(try_decode_one(malformed), Err(CrawlError::Decode(_))));
    }
}
