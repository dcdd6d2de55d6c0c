//! HTTP transport built on reqwest.

use crate::config::DownloadConfig;
use crate::error::{Error, Result, TransferError};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, REFERER};
use tokio_util::sync::CancellationToken;

use super::{ByteStream, Transport};

/// Production [`Transport`] issuing one GET per fetch.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a client with the configured timeout, user agent and referer
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(referer) = &config.referer {
            let value = HeaderValue::from_str(referer).map_err(|e| Error::Config {
                message: format!("invalid referer header: {}", e),
                key: Some("referer".to_string()),
            })?;
            headers.insert(REFERER, value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config {
                message: format!("failed to build HTTP client: {}", e),
                key: None,
            })?;

        Ok(Self { client })
    }

    /// Use an existing client (shared connection pool, custom TLS, ...)
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        source: &str,
        token: CancellationToken,
    ) -> std::result::Result<ByteStream, TransferError> {
        let request = self.client.get(source).send();

        let response = tokio::select! {
            _ = token.cancelled() => return Err(TransferError::Cancelled),
            response = request => response?,
        };

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(source, status = status.as_u16(), "Source answered with error status");
            return Err(TransferError::Http {
                status: status.as_u16(),
                url: source.to_string(),
            });
        }

        let content_length = response.content_length();
        let chunks = futures::stream::try_unfold(response, |mut response| async move {
            let chunk = response.chunk().await.map_err(TransferError::from)?;
            Ok(chunk.map(|c| (c, response)))
        });

        Ok(ByteStream::new(content_length, chunks.boxed()))
    }
}
