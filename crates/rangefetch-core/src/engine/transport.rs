//! HTTP transport used by the engine
//!
//! The engine only needs two operations from HTTP: a metadata probe and a
//! ranged GET that yields a byte stream. [`HttpTransport`] is the seam;
//! [`ReqwestTransport`] is the production implementation.

use crate::engine::retry::parse_retry_after;
use crate::error::FetchError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use rangefetch_types::ProbeInfo;
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Response body as a stream of byte chunks
pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// A successful response to a ranged GET
pub struct RangeResponse {
    /// `true` for `206 Partial Content`
    pub partial: bool,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Fetch size, range support and validators for `url`
    async fn probe(&self, url: &str) -> Result<ProbeInfo, FetchError>;

    /// GET bytes `start..=end` (`end = None` for open-ended)
    async fn get_range(
        &self,
        url: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<RangeResponse, FetchError>;
}

/// [`HttpTransport`] backed by a shared `reqwest` client
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(concat!("rangefetch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Ask for the first byte when HEAD is unusable or lacks a length
    async fn probe_with_range_get(&self, url: &str, info: &mut ProbeInfo) -> Result<(), FetchError> {
        let response = self
            .client
            .get(url)
            .header(header::RANGE, "bytes=0-0")
            .send()
            .await?;
        let status = response.status();
        debug!("Range probe status for {}: {}", url, status);

        if status == StatusCode::PARTIAL_CONTENT {
            info.supports_range = true;
            if let Some(total) = response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
            {
                info!("Got size from Content-Range: {} bytes", total);
                info.size = Some(total);
            }
        } else if status.is_success() {
            info.supports_range = false;
            if info.size.is_none() {
                info.size = content_length(response.headers());
            }
        } else {
            return Err(status_error(status, url, response.headers()));
        }

        fill_validators(response.headers(), info);
        Ok(())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn probe(&self, url: &str) -> Result<ProbeInfo, FetchError> {
        info!("Probing URL: {}", url);
        let response = self.client.head(url).send().await?;
        let status = response.status();

        let mut info = ProbeInfo {
            url: url.to_string(),
            final_url: None,
            filename: filename_from_url(response.url()),
            size: None,
            content_type: None,
            supports_range: false,
            etag: None,
            last_modified: None,
        };

        let final_url = response.url().to_string();
        if final_url != url {
            info.final_url = Some(final_url);
        }

        if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
            warn!("HEAD not supported by {}, probing with a ranged GET", url);
            let target = info.final_url.clone().unwrap_or_else(|| url.to_string());
            self.probe_with_range_get(&target, &mut info).await?;
            return Ok(info);
        }
        if !status.is_success() {
            return Err(status_error(status, url, response.headers()));
        }

        let headers = response.headers();
        info.size = content_length(headers);
        info.supports_range = headers
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        info.content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        if let Some(name) = headers
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_disposition)
        {
            info.filename = name;
        }
        fill_validators(headers, &mut info);

        // Some CDNs omit Content-Length on HEAD
        if info.size.is_none() {
            info!("HEAD didn't return Content-Length, trying partial GET on {}", url);
            let target = info.final_url.clone().unwrap_or_else(|| url.to_string());
            if let Err(e) = self.probe_with_range_get(&target, &mut info).await {
                warn!("Partial GET probe failed: {} - continuing without size info", e);
            }
        }

        Ok(info)
    }

    async fn get_range(
        &self,
        url: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<RangeResponse, FetchError> {
        let request = match end {
            Some(end) => self
                .client
                .get(url)
                .header(header::RANGE, format!("bytes={}-{}", start, end)),
            None if start > 0 => self
                .client
                .get(url)
                .header(header::RANGE, format!("bytes={}-", start)),
            None => self.client.get(url),
        };

        let response = request.send().await?;
        let status = response.status();

        let partial = status == StatusCode::PARTIAL_CONTENT;
        if !partial {
            if !status.is_success() {
                return Err(status_error(status, url, response.headers()));
            }
            if start > 0 {
                return Err(FetchError::RangeNotHonored { start });
            }
        }

        let content_length = content_length(response.headers());
        let body = response
            .bytes_stream()
            .map(|item| item.map_err(FetchError::from))
            .boxed();

        Ok(RangeResponse {
            partial,
            content_length,
            body,
        })
    }
}

fn status_error(status: StatusCode, url: &str, headers: &HeaderMap) -> FetchError {
    FetchError::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
        retry_after: headers
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after),
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

fn fill_validators(headers: &HeaderMap, info: &mut ProbeInfo) {
    if info.etag.is_none() {
        info.etag = headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
    }
    if info.last_modified.is_none() {
        info.last_modified = headers
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
    }
}

/// Total length from a `Content-Range: bytes 0-0/12345` value
pub(crate) fn parse_content_range_total(value: &str) -> Option<u64> {
    let total = value.rsplit('/').next()?;
    if total == "*" {
        return None;
    }
    total.trim().parse().ok()
}

fn filename_from_disposition(value: &str) -> Option<String> {
    let name = value
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))?
        .trim_matches('"');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn filename_from_url(url: &reqwest::Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("download")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_filename_from_disposition() {
        assert_eq!(
            filename_from_disposition(r#"attachment; filename="client.zip""#),
            Some("client.zip".to_string())
        );
        assert_eq!(filename_from_disposition("inline"), None);
    }

    #[test]
    fn test_filename_from_url() {
        let url = reqwest::Url::parse("https://cdn.example.com/assets/pack.bin").unwrap();
        assert_eq!(filename_from_url(&url), "pack.bin");
        let url = reqwest::Url::parse("https://cdn.example.com/").unwrap();
        assert_eq!(filename_from_url(&url), "download");
    }
}
