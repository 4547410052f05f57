//! Docker Engine API client.
//!
//! Talks to the engine over its Unix socket and implements the inventory and
//! lifecycle-event interfaces the registrar consumes.
//!
//! Reference: https://docs.docker.com/engine/api/v1.43/

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use hyper::body::HttpBody;
use hyper::{Body, Client, Method, Request, Response, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use subproxy_reconcile::WorkloadUnit;
use tracing::{debug, warn};

use crate::inventory::{
    EventFilter, EventStream, InventoryError, WorkloadEvent, WorkloadEvents, WorkloadInventory,
};

/// Engine socket used when `DOCKER_HOST` is not set.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Resolve the engine socket path from a `DOCKER_HOST` style value.
///
/// Accepts `unix:///path` or a bare absolute path. Other transports are not
/// supported.
pub fn socket_path_from_host(docker_host: Option<&str>) -> Result<String, InventoryError> {
    let Some(host) = docker_host.map(str::trim).filter(|h| !h.is_empty()) else {
        return Ok(DEFAULT_DOCKER_SOCKET.to_string());
    };

    if let Some(path) = host.strip_prefix("unix://") {
        if path.starts_with('/') {
            return Ok(path.to_string());
        }
    } else if host.starts_with('/') {
        return Ok(host.to_string());
    }

    Err(InventoryError::Unreachable(format!(
        "unsupported docker host {host:?} (expected unix:///path)"
    )))
}

#[derive(Debug, Deserialize)]
struct ContainerSummary {
    #[serde(rename = "Id")]
    id: String,

    #[serde(rename = "Names", default)]
    names: Vec<String>,

    #[serde(rename = "Labels", default)]
    labels: Option<BTreeMap<String, String>>,
}

impl From<ContainerSummary> for WorkloadUnit {
    fn from(summary: ContainerSummary) -> Self {
        Self {
            id: summary.id,
            names: summary.names,
            labels: summary.labels.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventMessage {
    #[serde(rename = "Type", default)]
    kind: String,

    #[serde(rename = "Action", default)]
    action: String,

    #[serde(rename = "Actor", default)]
    actor: EventActor,
}

#[derive(Debug, Default, Deserialize)]
struct EventActor {
    #[serde(rename = "ID", default)]
    id: String,

    #[serde(rename = "Attributes", default)]
    attributes: Option<BTreeMap<String, String>>,
}

impl From<EventMessage> for WorkloadEvent {
    fn from(message: EventMessage) -> Self {
        Self {
            kind: message.kind,
            action: message.action,
            actor_id: message.actor.id,
            attributes: message.actor.attributes.unwrap_or_default(),
        }
    }
}

/// Docker Engine client for Unix socket communication.
pub struct DockerClient {
    socket_path: String,
    client: Client<UnixConnector>,
    timeout: Duration,
}

impl DockerClient {
    /// Create a client for the given socket; `timeout` bounds each listing
    /// request and the wait for event-stream headers.
    pub fn new<P: AsRef<Path>>(socket_path: P, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_string_lossy().to_string(),
            client: Client::unix(),
            timeout,
        }
    }

    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    /// Build `path?filters=<json>` with the filter map URL-encoded.
    fn path_with_filters<F: Serialize>(path: &str, filters: &F) -> Result<String, InventoryError> {
        let filters =
            serde_json::to_string(filters).map_err(|e| InventoryError::Decode(e.to_string()))?;
        let mut url = reqwest::Url::parse("http://docker")
            .map_err(|e| InventoryError::Decode(e.to_string()))?;
        url.set_path(path);
        url.query_pairs_mut().append_pair("filters", &filters);

        Ok(format!("{}?{}", url.path(), url.query().unwrap_or_default()))
    }

    /// Perform a GET request and return the response once headers arrive.
    async fn get(&self, path_and_query: &str) -> Result<Response<Body>, InventoryError> {
        let uri = Uri::new(&self.socket_path, path_and_query);

        debug!(path = path_and_query, "GET request to Docker API");

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("Accept", "application/json")
            .body(Body::empty())
            .map_err(|e| InventoryError::Decode(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| InventoryError::Timeout(self.timeout))?
            .map_err(|e| InventoryError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = read_body(response.into_body(), self.timeout)
            .await
            .map(|body| String::from_utf8_lossy(&body).trim().to_string())
            .unwrap_or_default();
        Err(api_error(status, message))
    }
}

fn api_error(status: StatusCode, message: String) -> InventoryError {
    InventoryError::Api {
        status: status.as_u16(),
        message,
    }
}

async fn read_body(body: Body, timeout: Duration) -> Result<Bytes, InventoryError> {
    tokio::time::timeout(timeout, hyper::body::to_bytes(body))
        .await
        .map_err(|_| InventoryError::Timeout(timeout))?
        .map_err(|e| InventoryError::Unreachable(e.to_string()))
}

#[async_trait]
impl WorkloadInventory for DockerClient {
    async fn list_units(&self, label: &str) -> Result<Vec<WorkloadUnit>, InventoryError> {
        let filters = BTreeMap::from([("label", vec![label])]);
        let path = Self::path_with_filters("/containers/json", &filters)?;

        let response = self.get(&path).await?;
        let body = read_body(response.into_body(), self.timeout).await?;
        let containers: Vec<ContainerSummary> =
            serde_json::from_slice(&body).map_err(|e| InventoryError::Decode(e.to_string()))?;

        debug!(count = containers.len(), label, "Listed containers");
        Ok(containers.into_iter().map(WorkloadUnit::from).collect())
    }
}

#[async_trait]
impl WorkloadEvents for DockerClient {
    async fn subscribe(&self, filter: &EventFilter) -> Result<EventStream, InventoryError> {
        let path = Self::path_with_filters("/events", filter)?;
        let response = self.get(&path).await?;

        debug!(socket = %self.socket_path, ?filter, "Subscribed to Docker events");
        Ok(Box::pin(line_events(response.into_body())))
    }
}

struct LineReader<B> {
    body: B,
    buf: Vec<u8>,
    finished: bool,
}

/// Decode a line-delimited JSON body into events.
///
/// Malformed lines are logged and skipped; a transport error is yielded once
/// and ends the stream.
pub fn line_events<B>(body: B) -> impl futures_core::Stream<Item = Result<WorkloadEvent, InventoryError>>
where
    B: HttpBody<Data = Bytes> + Unpin + Send + 'static,
    B::Error: Display,
{
    let reader = LineReader {
        body,
        buf: Vec::new(),
        finished: false,
    };

    stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(pos) = reader.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = reader.buf.drain(..=pos).collect();
                if let Some(event) = parse_event_line(&line) {
                    return Some((Ok(event), reader));
                }
                continue;
            }

            if reader.finished {
                let rest = std::mem::take(&mut reader.buf);
                return parse_event_line(&rest).map(|event| (Ok(event), reader));
            }

            match reader.body.data().await {
                Some(Ok(chunk)) => reader.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    reader.finished = true;
                    reader.buf.clear();
                    return Some((Err(InventoryError::Stream(e.to_string())), reader));
                }
                None => reader.finished = true,
            }
        }
    })
}

fn parse_event_line(line: &[u8]) -> Option<WorkloadEvent> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }

    match serde_json::from_slice::<EventMessage>(line) {
        Ok(message) => Some(message.into()),
        Err(e) => {
            warn!(error = %e, "Skipping malformed event line");
            None
        }
    }
}
