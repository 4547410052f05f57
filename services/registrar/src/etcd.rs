//! etcd v2 keys API client.
//!
//! Requests go to the first healthy endpoint in the configured list. On a
//! transport error or timeout the next endpoint is tried; the endpoint that
//! last answered is tried first on the next request.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, Url};
use serde::Deserialize;
use subproxy_reconcile::StoreNode;
use tracing::{debug, warn};

use crate::store::{KeyValueStore, StoreError};

/// etcd error code for a missing key.
const KEY_NOT_FOUND: i64 = 100;

#[derive(Debug, Deserialize)]
struct NodeResponse {
    node: StoreNode,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "errorCode")]
    error_code: i64,

    #[serde(default)]
    message: String,

    #[serde(default)]
    cause: Option<String>,
}

/// etcd v2 client with endpoint failover.
pub struct EtcdClient {
    client: reqwest::Client,
    endpoints: Vec<Url>,
    preferred: AtomicUsize,
    timeout: Duration,
}

impl EtcdClient {
    /// Create a client; `timeout` bounds every request.
    pub fn new(endpoints: Vec<Url>, timeout: Duration) -> Result<Self, StoreError> {
        if endpoints.is_empty() {
            return Err(StoreError::Transport {
                endpoint: String::new(),
                message: "no store endpoints configured".to_string(),
            });
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("subproxy-registrar/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| StoreError::Transport {
                endpoint: endpoints[0].to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            endpoints,
            preferred: AtomicUsize::new(0),
            timeout,
        })
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    fn keys_url(endpoint: &Url, key: &str) -> String {
        let base = endpoint.as_str().trim_end_matches('/');
        let key = key.trim_start_matches('/');
        format!("{base}/v2/keys/{key}")
    }

    /// Send a request built per endpoint, failing over on transport errors.
    async fn send<F>(&self, key: &str, build: F) -> Result<Response, StoreError>
    where
        F: Fn(&reqwest::Client, String) -> RequestBuilder,
    {
        let start = self.preferred.load(Ordering::Relaxed);
        let mut last_error = None;

        for offset in 0..self.endpoints.len() {
            let index = (start + offset) % self.endpoints.len();
            let endpoint = &self.endpoints[index];
            let url = Self::keys_url(endpoint, key);

            match build(&self.client, url).send().await {
                Ok(response) => {
                    if index != start {
                        debug!(endpoint = %endpoint, "Switched store endpoint");
                        self.preferred.store(index, Ordering::Relaxed);
                    }
                    return Ok(response);
                }
                Err(e) => {
                    let error = if e.is_timeout() {
                        StoreError::Timeout {
                            endpoint: endpoint.to_string(),
                            timeout: self.timeout,
                        }
                    } else {
                        StoreError::Transport {
                            endpoint: endpoint.to_string(),
                            message: e.to_string(),
                        }
                    };
                    warn!(endpoint = %endpoint, key, error = %error, "Store endpoint failed");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| StoreError::Transport {
            endpoint: String::new(),
            message: "no store endpoints configured".to_string(),
        }))
    }

    /// Map a non-success response to a store error.
    async fn check(response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(err) if err.error_code == KEY_NOT_FOUND => {
                Err(StoreError::NotFound(err.cause.unwrap_or(err.message)))
            }
            Ok(err) => Err(StoreError::Api {
                status: status.as_u16(),
                code: err.error_code,
                message: err.message,
            }),
            Err(_) => Err(StoreError::Api {
                status: status.as_u16(),
                code: 0,
                message: body,
            }),
        }
    }

    async fn read_node(response: Response) -> Result<StoreNode, StoreError> {
        let body: NodeResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(body.node)
    }
}

#[async_trait]
impl KeyValueStore for EtcdClient {
    async fn get(&self, key: &str) -> Result<StoreNode, StoreError> {
        let response = self.send(key, |client, url| client.get(url)).await?;
        Self::read_node(Self::check(response).await?).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        debug!(key, "Setting key");
        let response = self
            .send(key, |client, url| client.put(url).form(&[("value", value)]))
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), StoreError> {
        debug!(key, recursive, "Deleting key");
        let response = self
            .send(key, |client, url| {
                let request = client.delete(url);
                if recursive {
                    request.query(&[("recursive", "true")])
                } else {
                    request
                }
            })
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn list_children(&self, key: &str) -> Result<Vec<StoreNode>, StoreError> {
        let response = self
            .send(key, |client, url| {
                client
                    .get(url)
                    .query(&[("recursive", "true"), ("sorted", "true")])
            })
            .await?;

        match Self::check(response).await {
            Ok(response) => Ok(Self::read_node(response).await?.nodes),
            Err(StoreError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}
