//! HTTP implementation of the fetch capability.
//!
//! Talks to an external content service with Range requests so an
//! interrupted transfer resumes from its byte offset instead of byte zero.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::fetch_source::{FetchChunk, FetchSource, FetchStream};
use crate::job_store::{FetchErrorKind, FetchFailure};

/// Fetch source backed by an HTTP content service.
///
/// Absolute `http(s)://` resource identifiers are fetched directly;
/// anything else is resolved against the configured base URL's `/content/`
/// endpoint.
#[derive(Clone)]
pub struct HttpFetchSource {
    client: Client,
    base_url: Option<String>,
}

impl HttpFetchSource {
    /// # Arguments
    /// * `base_url` - Base URL of the content service (e.g., "http://localhost:8080")
    /// * `timeout_secs` - Per-request timeout in seconds
    pub fn new(base_url: Option<String>, timeout_secs: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(timeout_secs))
            // No overall timeout: transfers are long-lived; stalls surface
            // through the read path and the claim heartbeat.
            .build()?;

        Ok(Self { client, base_url })
    }

    fn resolve_url(&self, resource: &str) -> Result<String, FetchFailure> {
        if resource.starts_with("http://") || resource.starts_with("https://") {
            return Ok(resource.to_string());
        }
        match &self.base_url {
            Some(base) => Ok(format!(
                "{}/content/{}",
                base.trim_end_matches('/'),
                resource
            )),
            None => Err(FetchFailure::new(
                FetchErrorKind::InvalidResource,
                format!("non-URL resource {:?} and no source base URL configured", resource),
            )),
        }
    }
}

/// Map an HTTP status to a failure kind: client errors are the resource's
/// fault (no retry), server errors and throttling are transient.
fn classify_status(status: StatusCode) -> FetchErrorKind {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => FetchErrorKind::Gone,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => FetchErrorKind::Timeout,
        s if s.is_client_error() => FetchErrorKind::InvalidResource,
        _ => FetchErrorKind::Connection,
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> FetchErrorKind {
    if e.is_timeout() {
        FetchErrorKind::Timeout
    } else if e.is_connect() {
        FetchErrorKind::Connection
    } else {
        FetchErrorKind::Unknown
    }
}

#[async_trait]
impl FetchSource for HttpFetchSource {
    async fn fetch(&self, resource: &str, resume_cursor: u64) -> Result<FetchStream, FetchFailure> {
        let url = self.resolve_url(resource)?;

        let mut request = self.client.get(&url);
        if resume_cursor > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", resume_cursor));
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchFailure::new(classify_reqwest_error(&e), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure::new(
                classify_status(status),
                format!("source returned {} for {}", status, url),
            ));
        }

        if resume_cursor > 0 && status != StatusCode::PARTIAL_CONTENT {
            // Appending a from-zero body after a partial spool would corrupt
            // the artifact; back off and let the retry path sort it out.
            return Err(FetchFailure::new(
                FetchErrorKind::Io,
                format!("source ignored range request (status {})", status),
            ));
        }

        debug!(
            "Fetching {} from offset {} (status {})",
            url, resume_cursor, status
        );

        let mut cursor = resume_cursor;
        let stream = response.bytes_stream().map(move |chunk| match chunk {
            Ok(bytes) => {
                cursor += bytes.len() as u64;
                Ok(FetchChunk {
                    bytes: bytes.to_vec(),
                    cursor,
                })
            }
            Err(e) => Err(FetchFailure::new(
                classify_reqwest_error(&e),
                format!("stream error: {}", e),
            )),
        });

        Ok(stream.boxed())
    }
}
