//! Transport collaborator: fetches one resource as a stream of byte chunks.
//!
//! - [`http`] - Production transport over `reqwest`
//!
//! The engine calls [`Transport::fetch`] once per attempt and drives the
//! returned [`ByteStream`] itself, checking for pause and cancellation between
//! chunks.

mod http;

pub use http::HttpTransport;

use crate::error::TransferError;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// Body of a successful fetch
pub struct ByteStream {
    /// Total body size if the source announced it
    pub content_length: Option<u64>,
    /// Body chunks in order
    pub chunks: BoxStream<'static, Result<Bytes, TransferError>>,
}

impl ByteStream {
    /// Wrap an arbitrary chunk stream
    pub fn new(
        content_length: Option<u64>,
        chunks: BoxStream<'static, Result<Bytes, TransferError>>,
    ) -> Self {
        Self {
            content_length,
            chunks,
        }
    }

    /// A stream yielding `bytes` as a single chunk
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            content_length: Some(bytes.len() as u64),
            chunks: futures::stream::once(futures::future::ready(Ok(bytes))).boxed(),
        }
    }

    /// A stream yielding the given chunks, with their summed length announced
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        let total = chunks.iter().map(|c| c.len() as u64).sum();
        Self {
            content_length: Some(total),
            chunks: futures::stream::iter(chunks.into_iter().map(Ok)).boxed(),
        }
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Abstraction over resource fetching, enabling testability.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Start fetching `source`; the returned body is read by the caller
    ///
    /// Implementations should give up promptly with [`TransferError::Cancelled`]
    /// once `token` is triggered.
    async fn fetch(
        &self,
        source: &str,
        token: CancellationToken,
    ) -> Result<ByteStream, TransferError>;
}
