//! Typed errors for the crawl pipeline.
//!
//! Error classification used to be done by searching error text for
//! substrings like `"proto"` or `"not a valid merkledag node"`. That's
//! fragile — replaced here with variants the caller matches on directly.

use std::fmt;

use crate::resource::ResourceType;

/// The four families from the error handling design, used by the worker
/// pool to decide ack/nack/requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFamily {
    /// Malformed CID, unrecognized node type: write Invalid, ack, never retry.
    PermanentContent,
    /// Unknown host, connection refused, reset: sleep and retry, then requeue.
    TemporaryTransport,
    /// Per-entry/per-crawl deadline exceeded: ack, leave unindexed.
    Timeout,
    /// Index or queue broker unreachable: propagate, consumption pauses.
    FatalInfrastructure,
}

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    /// Permanent-content error: the resource itself is unindexable content.
    /// Caller writes an Invalid document with `reason` and acks.
    #[error("resource invalid: {reason}")]
    Invalid { reason: String },

    /// Temporary transport failure (DNS, connect-refused, reset, temporary
    /// URL error). Eligible for bounded in-place retry, then nack-requeue.
    #[error("transport error")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// A per-entry or per-crawl deadline was exceeded.
    #[error("timed out during {stage}")]
    Timeout { stage: &'static str },

    /// The directory had more than `Config::max_dir_size` entries. Not a
    /// failure: every child was still dispatched, but the Directory document
    /// itself was not written (see spec.md §4.5.2 step 4).
    #[error("directory exceeds configured size limit")]
    DirectoryTooLarge,

    /// Index or queue broker unreachable. Fatal to the current consumption
    /// loop; propagated rather than retried per-message.
    #[error("infrastructure unavailable: {0}")]
    Infrastructure(String),

    /// A resource carried a type this code path does not know how to
    /// dispatch (defensive; should not occur for well-formed input).
    #[error("unexpected resource type: {0}")]
    UnexpectedType(ResourceType),

    /// Response body could not be decoded as the expected wire shape.
    #[error("decode error: {0}")]
    Decode(String),
}

impl CrawlError {
    /// Which of the four error families this error belongs to, for the
    /// worker pool's ack/nack decision. `DirectoryTooLarge` is handled as a
    /// distinct, successful-partial-crawl outcome by callers before this is
    /// consulted; it has no family of its own.
    pub fn family(&self) -> ErrorFamily {
        match self {
            Self::Invalid { .. } | Self::UnexpectedType(_) | Self::Decode(_) => {
                ErrorFamily::PermanentContent
            },
            Self::Transport(_) => ErrorFamily::TemporaryTransport,
            Self::Timeout { .. } => ErrorFamily::Timeout,
            Self::Infrastructure(_) => ErrorFamily::FatalInfrastructure,
            Self::DirectoryTooLarge => ErrorFamily::Timeout,
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.family() == ErrorFamily::TemporaryTransport
    }

    pub fn invalid(reason: impl fmt::Display) -> Self {
        Self::Invalid { reason: reason.to_string() }
    }
}

impl From<reqwest::Error> for CrawlError {
    /// Classifies by error *kind*, not by matching on `Display` text: a
    /// timeout is a timeout regardless of what the underlying OS error
    /// happened to say.
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout { stage: "transport" }
        } else if e.is_connect() || e.is_request() {
            Self::Transport(Box::new(e))
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(Box::new(e))
        }
    }
}

impl From<serde_json::Error> for CrawlError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_too_large_is_not_temporary() {
        assert!(!CrawlError::DirectoryTooLarge.is_temporary());
    }

    #[test]
    fn transport_is_temporary() {
        let e = CrawlError::Transport(Box::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        assert!(e.is_temporary());
    }

    #[test]
    fn families_match_spec() {
        assert_eq!(CrawlError::invalid("bad cid").family(), ErrorFamily::PermanentContent);
        assert_eq!(CrawlError::Infrastructure("down".into()).family(), ErrorFamily::FatalInfrastructure);
        assert_eq!(CrawlError::Timeout { stage: "x" }.family(), ErrorFamily::Timeout);
    }
}
