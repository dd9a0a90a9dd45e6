//! HTTP adapters: endpoint probe, record transport and operation handler.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

use edgesync_common::{Error, RecordId, Result};

use crate::connectivity::Probe;
use crate::handler::OperationHandler;
use crate::queue::QueuedOperation;
use crate::transfer::RecordTransport;
use crate::version::SyncRecord;

const USER_AGENT: &str = concat!("edgesync/", env!("CARGO_PKG_VERSION"));

fn build_client(timeout: Option<Duration>) -> Result<Client> {
    let mut builder = Client::builder().user_agent(USER_AGENT);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))
}

fn parse_base(base: &str) -> Result<Url> {
    let url = Url::parse(base)
        .map_err(|e| Error::Config(format!("Invalid base URL '{}': {}", base, e)))?;
    if url.cannot_be_a_base() {
        return Err(Error::Config(format!("'{}' cannot be used as a base URL", base)));
    }
    Ok(url)
}

/// Append path segments to `base`, percent-encoding each one.
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| Error::Config(format!("'{}' cannot be used as a base URL", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn error_for_status(response: reqwest::Response, what: &str) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Error::Network(format!("{} failed: {} - {}", what, status, body))
}

/// Probe that issues a GET against the endpoint.
///
/// Any answer below 500 counts as reachable: the network path works even
/// if the server rejects the request.
pub struct HttpProbe {
    http: Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: build_client(None)?,
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, endpoint: &str) -> Result<()> {
        let response = self
            .http
            .get(endpoint)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Probe of {} failed: {}", endpoint, e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::Network(format!("{} answered {}", endpoint, status)));
        }
        debug!("Probe of {} answered {}", endpoint, status);
        Ok(())
    }
}

/// Record transport against a REST store.
///
/// Records live at `<base>/records/<data_kind>/<record_id>`; `PUT` writes
/// the edge copy, `GET` reads the cloud copy (404 means absent).
pub struct HttpTransport {
    http: Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_client(Some(timeout))?,
            base: parse_base(base)?,
        })
    }

    fn record_url(&self, data_kind: &str, record_id: &RecordId) -> Result<Url> {
        endpoint(&self.base, &["records", data_kind, record_id.as_str()])
    }
}

#[async_trait]
impl RecordTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn push(&self, record: &SyncRecord) -> Result<()> {
        let url = self.record_url(&record.data_kind, &record.record_id)?;
        let response = self
            .http
            .put(url)
            .json(record)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to push {}: {}", record.record_id, e)))?;

        if !response.status().is_success() {
            return Err(error_for_status(response, "Push").await);
        }
        Ok(())
    }

    async fn fetch(&self, data_kind: &str, record_id: &RecordId) -> Result<Option<SyncRecord>> {
        let url = self.record_url(data_kind, record_id)?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to fetch {}: {}", record_id, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(error_for_status(response, "Fetch").await);
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| Error::Network(format!("Failed to parse record {}: {}", record_id, e)))
    }
}

/// Handler that POSTs the whole operation to `<base>/operations/<kind>`.
///
/// Any non-2xx answer is a retryable failure.
pub struct HttpHandler {
    http: Client,
    base: Url,
}

impl HttpHandler {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_client(Some(timeout))?,
            base: parse_base(base)?,
        })
    }

    pub fn url_for(&self, op: &QueuedOperation) -> Result<Url> {
        endpoint(&self.base, &["operations", op.kind.as_str()])
    }
}

#[async_trait]
impl OperationHandler for HttpHandler {
    async fn handle(&self, op: &QueuedOperation) -> Result<()> {
        let url = self.url_for(op)?;
        let response = self
            .http
            .post(url)
            .json(op)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to deliver {}: {}", op.id, e)))?;

        if !response.status().is_success() {
            return Err(error_for_status(response, "Delivery").await);
        }
        debug!("Delivered {} operation {}", op.kind, op.id);
        Ok(())
    }
}
