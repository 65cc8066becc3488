//! Captured request and proxied response types carried through the
//! admission queue and executor.

use std::pin::Pin;

use bytes::Bytes;
use futures_core::Stream;
use http::{HeaderMap, Method, StatusCode};

/// Boxed error type for body streams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A streaming body.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

/// Request body as captured from the client.
///
/// Small bodies are buffered and therefore replayable across retries; a
/// large body is kept as a stream handle and can be sent exactly once.
pub enum CapturedBody {
    Empty,
    Buffered(Bytes),
    Stream(Option<BodyStream>),
}

impl CapturedBody {
    /// Take the one-shot stream, if this body is a stream and still unsent.
    pub fn take_stream(&mut self) -> Option<BodyStream> {
        match self {
            Self::Stream(slot) => slot.take(),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Self::Stream(_))
    }
}

impl std::fmt::Debug for CapturedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "CapturedBody::Empty"),
            Self::Buffered(b) => write!(f, "CapturedBody::Buffered({} bytes)", b.len()),
            Self::Stream(Some(_)) => write!(f, "CapturedBody::Stream(pending)"),
            Self::Stream(None) => write!(f, "CapturedBody::Stream(consumed)"),
        }
    }
}

/// The immutable captured form of one inbound request, routed and
/// authenticated, ready for admission.
#[derive(Debug)]
pub struct CapturedRequest {
    pub method: Method,
    /// Path suffix after the matched prefix, always starting with `/`.
    pub suffix: String,
    pub query: Option<String>,
    /// Client headers as received (suppression happens at send time).
    pub headers: HeaderMap,
    pub body: CapturedBody,
    pub client_ip: String,
    /// Raw proxy-user credential; `None` when inbound auth is disabled.
    pub user: Option<String>,
}

/// The response handed back to the HTTP surface: status and sanitized
/// headers immediately, body as a stream (which carries the key lease).
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl std::fmt::Debug for ProxyResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[test]
    fn stream_body_is_single_use() {
        let inner: BodyStream = Box::pin(stream::empty());
        let mut body = CapturedBody::Stream(Some(inner));
        assert!(!body.is_replayable());
        assert!(body.take_stream().is_some());
        assert!(body.take_stream().is_none());
    }

    #[test]
    fn buffered_body_is_replayable() {
        let mut body = CapturedBody::Buffered(Bytes::from("x"));
        assert!(body.is_replayable());
        assert!(body.take_stream().is_none());
    }
}
