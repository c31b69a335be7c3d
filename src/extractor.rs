//! The extractor boundary (C2): downloads a bounded prefix of a file via the
//! protocol client's gateway URL and yields a metadata mapping. The concrete
//! set of extracted keys is data-defined; this implementation sniffs MIME
//! type from a magic-byte prefix and, for common raster formats, cheap
//! dimensions read from the same prefix, without pulling in a full
//! image-decode dependency.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::CrawlError;
use crate::resource::Resource;

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Fetches up to `max_size` bytes from `gateway_url` and writes metadata
    /// keys describing `resource` into the returned map.
    async fn extract(
        &self,
        cancel: &CancellationToken,
        resource: &Resource,
        gateway_url: url::Url,
        max_size: u64,
    ) -> Result<Map<String, Value>, CrawlError>;
}

pub struct HttpExtractor {
    http: reqwest::Client,
}

impl Default for HttpExtractor {
    fn default() -> Self {
        Self { http: reqwest::Client::new() }
    }
}

impl HttpExtractor {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn extract(
        &self,
        cancel: &CancellationToken,
        _resource: &Resource,
        gateway_url: url::Url,
        max_size: u64,
    ) -> Result<Map<String, Value>, CrawlError> {
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(CrawlError::Timeout { stage: "extract" }),
            resp = self.http.get(gateway_url).send() => resp?.error_for_status()?,
        };

        let mut body = Vec::new();
        let mut stream = resp.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(CrawlError::Timeout { stage: "extract" }),
                chunk = stream.next() => chunk,
            };

            match chunk {
                Some(chunk) => {
                    body.extend_from_slice(&chunk?);
                    if body.len() as u64 >= max_size {
                        body.truncate(max_size as usize);
                        break;
                    }
                },
                None => break,
            }
        }

        Ok(sniff(&body))
    }
}

fn sniff(prefix: &[u8]) -> Map<String, Value> {
    let mut m = Map::new();
    let mime = sniff_mime(prefix);
    m.insert("mime".into(), Value::String(mime.to_owned()));
    m.insert("size-sniffed".into(), Value::from(prefix.len() as u64));

    if let Some((w, h)) = sniff_dimensions(prefix, mime) {
        m.insert("width".into(), Value::from(w));
        m.insert("height".into(), Value::from(h));
    }

    m
}

fn sniff_mime(prefix: &[u8]) -> &'static str {
    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF];
    const GIF87: &[u8] = b"GIF87a";
    const GIF89: &[u8] = b"GIF89a";
    const PDF: &[u8] = b"%PDF-";

    if prefix.starts_with(PNG) {
        "image/png"
    } else if prefix.starts_with(JPEG) {
        "image/jpeg"
    } else if prefix.starts_with(GIF87) || prefix.starts_with(GIF89) {
        "image/gif"
    } else if prefix.starts_with(PDF) {
        "application/pdf"
    } else {
        "application/octet-stream"
    }
}

/// Reads width/height directly from the magic-byte prefix for formats whose
/// header stores dimensions inline, without a full image decode.
fn sniff_dimensions(prefix: &[u8], mime: &'static str) -> Option<(u32, u32)> {
    match mime {
        "image/png" => {
            // IHDR chunk: 8 (sig) + 4 (len) + 4 ("IHDR") + width(4) + height(4)
            if prefix.len() >= 24 {
                let w = u32::from_be_bytes(prefix[16..20].try_into().ok()?);
                let h = u32::from_be_bytes(prefix[20..24].try_into().ok()?);
                Some((w, h))
            } else {
                None
            }
        },
        "image/gif" => {
            if prefix.len() >= 10 {
                let w = u16::from_le_bytes(prefix[6..8].try_into().ok()?) as u32;
                let h = u16::from_le_bytes(prefix[8..10].try_into().ok()?) as u32;
                Some((w, h))
            } else {
                None
            }
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_png_signature_and_dimensions() {
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.extend_from_slice(&[0, 0, 0, 13]); // chunk length
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&100u32.to_be_bytes());
        bytes.extend_from_slice(&50u32.to_be_bytes());

        let m = sniff(&bytes);
        assert_eq!(m.get("mime").unwrap(), "image/png");
        assert_eq!(m.get("width").unwrap(), 100);
        assert_eq!(m.get("height").unwrap(), 50);
    }

    #[test]
    fn unknown_content_yields_octet_stream_not_error() {
        let m = sniff(b"not a known format");
        assert_eq!(m.get("mime").unwrap(), "application/octet-stream");
        assert!(m.get("width").is_none());
    }

    #[test]
    fn sniffs_jpeg() {
        let m = sniff(&[0xFF, 0xD8, 0xFF, 0xE0]);
        assert_eq!(m.get("mime").unwrap(), "image/jpeg");
    }
}
