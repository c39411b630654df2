//! In-memory HTTP fetcher.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use updraft_core::Manifest;
use updraft_engine::{
    FetchResponse, HttpFetcher, LoadError, LoadResult, ProgressFn, body_too_large,
};

use super::fixtures::{TestAsset, manifest_body};

#[derive(Clone, Debug)]
enum Reply {
    Response(FetchResponse),
    /// Never completes.
    Hang,
}

#[derive(Default)]
struct State {
    routes: HashMap<String, Reply>,
    /// Pending transport failures per URL, consumed before the route.
    failures: HashMap<String, usize>,
    /// Requests to these URLs wait for a notification before answering.
    gates: HashMap<String, Arc<Notify>>,
    requests: Vec<(String, BTreeMap<String, String>)>,
}

/// Serves canned responses and records every request.
/// Unknown URLs answer 404.
#[derive(Default)]
pub struct MockFetcher {
    state: Mutex<State>,
}

#[allow(dead_code)]
impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, status: u16, headers: &[(&str, &str)], body: impl Into<Bytes>) {
        let response = FetchResponse {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
            body: body.into(),
        };
        self.state
            .lock()
            .unwrap()
            .routes
            .insert(url.to_string(), Reply::Response(response));
    }

    /// Serve `manifest` at `url` with extra response headers.
    pub fn serve_manifest(&self, url: &str, manifest: &Manifest, headers: &[(&str, &str)]) {
        self.respond(url, 200, headers, manifest_body(manifest));
    }

    pub fn serve_assets(&self, assets: &[TestAsset]) {
        for asset in assets {
            self.respond(&asset.url(), 200, &[], asset.content.clone());
        }
    }

    pub fn hang(&self, url: &str) {
        self.state
            .lock()
            .unwrap()
            .routes
            .insert(url.to_string(), Reply::Hang);
    }

    /// Hold requests for `url` until the returned gate is notified.
    pub fn gate(&self, url: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state
            .lock()
            .unwrap()
            .gates
            .insert(url.to_string(), gate.clone());
        gate
    }

    /// Fail the next `times` requests for `url` with a transport error.
    pub fn fail_times(&self, url: &str, times: usize) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(url.to_string(), times);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|(u, _)| u == url)
            .count()
    }

    /// Headers of every request made to `url`, oldest first.
    pub fn request_headers(&self, url: &str) -> Vec<BTreeMap<String, String>> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, h)| h.clone())
            .collect()
    }
}

#[async_trait]
impl HttpFetcher for MockFetcher {
    async fn fetch(
        &self,
        url: &str,
        headers: &[(String, String)],
        max_bytes: Option<u64>,
        progress: Option<&ProgressFn<'_>>,
    ) -> LoadResult<FetchResponse> {
        let (reply, gate) = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            state
                .requests
                .push((url.to_string(), headers.iter().cloned().collect()));
            match state.failures.get_mut(url) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    return Err(LoadError::Network("connection reset".to_string()));
                }
                _ => (state.routes.get(url).cloned(), state.gates.get(url).cloned()),
            }
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        match reply {
            Some(Reply::Response(response)) => {
                let len = response.body.len() as u64;
                if let Some(max) = max_bytes.filter(|max| response.is_success() && len > *max) {
                    return Err(body_too_large(url, max, len));
                }
                if let Some(progress) = progress {
                    progress(len, Some(len));
                }
                Ok(response)
            }
            Some(Reply::Hang) => futures::future::pending().await,
            None => Ok(FetchResponse {
                status: 404,
                headers: BTreeMap::new(),
                body: Bytes::new(),
            }),
        }
    }
}
