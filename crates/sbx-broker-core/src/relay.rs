//! Ingress relay.
//!
//! Callers only ever see `<ingress_prefix>/<run_id>`. Requests arriving
//! there are forwarded by this relay to the sandbox's workload port through
//! the backend's authenticated proxy, so the sandbox's own credentialed
//! address never leaves the broker.

use std::time::Duration;

use provision_backend::BackendError;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONNECTION};
use reqwest::{Method, StatusCode, Url};
use tracing::debug;

use crate::domain::{RunId, RunStatus};
use crate::orchestrator::Broker;

/// Headers that describe one hop and must not be forwarded.
pub const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("run {run_id} is not ready (status: {status})")]
    NotReady { run_id: RunId, status: RunStatus },

    #[error("run {0} has no service credentials")]
    MissingCredentials(RunId),

    #[error("invalid relay target: {0}")]
    InvalidTarget(String),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Copy `headers` without hop-by-hop headers, including any named by
/// `Connection`.
pub fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name_str = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_str) || named.iter().any(|n| n == name_str) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// `<base>/proxy/<port><path>`
///
/// Refuses any path that could leave the workload port once normalised:
/// dot segments (literal or percent-encoded), backslashes, encoded
/// separators and control characters.
pub fn target_url(base: &str, port: u16, path: &str) -> Result<Url, RelayError> {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    if escapes_prefix(&path) {
        return Err(RelayError::InvalidTarget(format!(
            "path escapes the workload port: {}",
            path
        )));
    }

    let base = base.trim_end_matches('/');
    let root = Url::parse(base).map_err(|e| RelayError::InvalidTarget(format!("{}: {}", base, e)))?;
    let prefix = format!("{}/proxy/{}/", root.path().trim_end_matches('/'), port);

    let raw = format!("{}/proxy/{}{}", base, port, path);
    let url = Url::parse(&raw).map_err(|e| RelayError::InvalidTarget(format!("{}: {}", raw, e)))?;
    if !url.path().starts_with(&prefix) {
        return Err(RelayError::InvalidTarget(format!(
            "{} resolves outside {}",
            raw, prefix
        )));
    }
    Ok(url)
}

fn escapes_prefix(path: &str) -> bool {
    if path.chars().any(|c| c.is_ascii_control() || c == '\\') {
        return true;
    }
    let path_only = path.split(['?', '#']).next().unwrap_or("");
    let lower = path_only.to_ascii_lowercase();
    if lower.contains("%2f") || lower.contains("%5c") {
        return true;
    }
    lower.split('/').any(|segment| {
        let decoded = segment.replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

pub struct IngressRelay {
    broker: Broker,
    client: reqwest::Client,
}

impl IngressRelay {
    pub fn new(broker: Broker, timeout: Duration) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sbx-broker/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(IngressRelay { broker, client })
    }

    /// Forward one request to a ready run's workload.
    ///
    /// The caller's `Authorization` is dropped and replaced with the run's
    /// service token.
    pub async fn forward(
        &self,
        run_id: &RunId,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Vec<u8>,
    ) -> Result<RelayResponse, RelayError> {
        let inner = self.broker.inner();
        let run = inner
            .registry
            .get(run_id)
            .ok_or(RelayError::RunNotFound(*run_id))?;
        if run.status != RunStatus::Ready {
            return Err(RelayError::NotReady {
                run_id: *run_id,
                status: run.status,
            });
        }
        let handle = run.handle.ok_or(RelayError::NotReady {
            run_id: *run_id,
            status: run.status,
        })?;
        let bearer = handle
            .service_token
            .as_deref()
            .and_then(|token| HeaderValue::from_str(&format!("Bearer {}", token)).ok())
            .ok_or(RelayError::MissingCredentials(*run_id))?;

        let base = inner.remote(inner.backend.address(&handle)).await?;
        let url = target_url(&base, inner.config.workload_port, path)?;

        let mut outgoing = filter_headers(headers);
        outgoing.remove(AUTHORIZATION);
        outgoing.insert(AUTHORIZATION, bearer);

        debug!(run_id = %run_id, method = %method, path = %path, "relaying request");
        let mut request = self.client.request(method, url).headers(outgoing);
        if !body.is_empty() {
            request = request.body(body);
        }
        let response = request.send().await?;

        let status = response.status();
        let headers = filter_headers(response.headers());
        let body = response.bytes().await?.to_vec();
        Ok(RelayResponse {
            status,
            headers,
            body,
        })
    }
}
