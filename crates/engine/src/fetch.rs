//! HTTP fetching behind an injectable trait.

use crate::error::{LoadError, LoadResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::BTreeMap;

/// Progress callback: bytes received so far and the advertised total.
pub type ProgressFn<'a> = dyn Fn(u64, Option<u64>) + Send + Sync + 'a;

/// A completed HTTP response.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx status into an error.
    pub fn error_for_status(self) -> LoadResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(LoadError::Http {
                status: self.status,
            })
        }
    }
}

/// Fetches URLs for the loader.
///
/// Any HTTP status is a successful fetch; the caller interprets it.
/// Transport failures are `LoadError::Network`. A successful response whose
/// body outgrows `max_bytes` is abandoned as soon as that is known and
/// reported as [`body_too_large`].
#[async_trait]
pub trait HttpFetcher: Send + Sync + 'static {
    async fn fetch(
        &self,
        url: &str,
        headers: &[(String, String)],
        max_bytes: Option<u64>,
        progress: Option<&ProgressFn<'_>>,
    ) -> LoadResult<FetchResponse>;
}

/// The error for a response body over its size cap. `received` is the
/// advertised length or the bytes read before giving up.
pub fn body_too_large(url: &str, max_bytes: u64, received: u64) -> LoadError {
    LoadError::SizeMismatch {
        key: url.to_string(),
        expected: max_bytes,
        actual: received,
    }
}

/// `reqwest`-backed fetcher.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new() -> LoadResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("updraft/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(network_error)?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(
        &self,
        url: &str,
        headers: &[(String, String)],
        max_bytes: Option<u64>,
        progress: Option<&ProgressFn<'_>>,
    ) -> LoadResult<FetchResponse> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(network_error)?;
        let status = response.status().as_u16();
        let total = response.content_length();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        // Error bodies are the caller's to interpret, whatever their size.
        let max_bytes = max_bytes.filter(|_| response.status().is_success());
        if let Some(max) = max_bytes {
            if let Some(total) = total.filter(|t| *t > max) {
                return Err(body_too_large(url, max, total));
            }
        }

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(network_error)?;
            let received = (body.len() + chunk.len()) as u64;
            if let Some(max) = max_bytes.filter(|max| received > *max) {
                return Err(body_too_large(url, max, received));
            }
            body.extend_from_slice(&chunk);
            if let Some(progress) = progress {
                progress(body.len() as u64, total);
            }
        }

        Ok(FetchResponse {
            status,
            headers,
            body: body.freeze(),
        })
    }
}

fn network_error(e: reqwest::Error) -> LoadError {
    LoadError::Network(e.to_string())
}
