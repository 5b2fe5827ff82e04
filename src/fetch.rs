//! Document fetching for lifecycle scripts.
//!
//! Scripts are referenced by URL in VM configs. The compiler only opens the
//! stream to check the shebang; the orchestrator fetches the full body right
//! before running it.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;

use crate::error::MulchError;

pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait ScriptFetcher: Send + Sync {
    /// Open `url` for streaming. Dropping the stream abandons the transfer.
    async fn open(&self, url: &str) -> Result<ByteStream, MulchError>;

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, MulchError> {
        let mut stream = self.open(url).await?;
        let mut body = Vec::new();
        stream
            .read_to_end(&mut body)
            .await
            .map_err(|e| MulchError::Fetch {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(body)
    }
}

/// Fetches `http(s)://` URLs with reqwest. Other schemes are refused.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, MulchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .user_agent(concat!("mulch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MulchError::Fetch {
                url: String::new(),
                message: format!("building HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ScriptFetcher for HttpFetcher {
    async fn open(&self, url: &str) -> Result<ByteStream, MulchError> {
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(MulchError::Fetch {
                url: url.to_string(),
                message: "unsupported URL scheme".into(),
            });
        }

        tracing::debug!(url, "fetching document");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| MulchError::Fetch {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }
}
