//! HTTP worker proxy
//!
//! Talks to a worker process started with `mapred worker`. Task calls are
//! single attempts: a failed call is reported straight back to the phase
//! controller, which decides whether the worker is dead.

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use super::{
    MapTaskRequest, MapTaskResponse, ReduceTaskRequest, ReduceTaskResponse, WorkerError,
    WorkerProxy,
};

// ============================================================================
// Proxy Configuration
// ============================================================================

/// Configuration for one HTTP worker proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Worker address as configured (`host:port` or a full URL)
    pub address: String,

    /// Connect timeout for every request
    pub connect_timeout: Duration,

    /// Deadline for task calls; `None` waits indefinitely
    pub call_timeout: Option<Duration>,
}

impl ProxyConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(5),
            call_timeout: None,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Base URL derived from the address
    pub fn base_url(&self) -> String {
        let trimmed = self.address.trim_end_matches('/');
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        }
    }
}

// ============================================================================
// HTTP Worker Proxy
// ============================================================================

/// [`WorkerProxy`] over the worker's JSON API
pub struct HttpWorkerProxy {
    config: ProxyConfig,
    base_url: String,
    http_client: Client,
}

impl HttpWorkerProxy {
    pub fn new(config: ProxyConfig) -> Result<Self, WorkerError> {
        let mut builder = Client::builder().connect_timeout(config.connect_timeout);
        if let Some(timeout) = config.call_timeout {
            builder = builder.timeout(timeout);
        }
        let http_client = builder
            .build()
            .map_err(|e| WorkerError::Init(e.to_string()))?;

        Ok(Self {
            base_url: config.base_url(),
            config,
            http_client,
        })
    }

    async fn post_json<T: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R, WorkerError> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| WorkerError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(WorkerError::Http {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| WorkerError::Transport(format!("invalid response body: {e}")))
    }
}

#[async_trait]
impl WorkerProxy for HttpWorkerProxy {
    fn address(&self) -> &str {
        &self.config.address
    }

    async fn execute_map(&self, request: MapTaskRequest) -> Result<MapTaskResponse, WorkerError> {
        tracing::debug!(worker = %self.config.address, task_id = request.task_id, "POST /api/map");
        self.post_json("/api/map", &request).await
    }

    async fn execute_reduce(
        &self,
        request: ReduceTaskRequest,
    ) -> Result<ReduceTaskResponse, WorkerError> {
        tracing::debug!(worker = %self.config.address, task_id = request.task_id, "POST /api/reduce");
        self.post_json("/api/reduce", &request).await
    }

    async fn probe(&self, deadline: Duration) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.http_client.get(&url).timeout(deadline).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(worker = %self.config.address, error = %e, "Probe failed");
                false
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn proxy_for(server: &MockServer) -> HttpWorkerProxy {
        HttpWorkerProxy::new(ProxyConfig::new(server.uri())).unwrap()
    }

    fn reduce_request() -> ReduceTaskRequest {
        ReduceTaskRequest {
            task: "wordcount".into(),
            task_id: 2,
            input_dirs: vec![PathBuf::from("intermediate/job/0/abc")],
            output_dir: PathBuf::from("out"),
        }
    }

    #[test]
    fn test_base_url() {
        assert_eq!(ProxyConfig::new("localhost:50051").base_url(), "http://localhost:50051");
        assert_eq!(ProxyConfig::new("http://10.0.0.1:80/").base_url(), "http://10.0.0.1:80");
    }

    #[test]
    fn test_proxy_config_builders() {
        let config = ProxyConfig::new("w:1")
            .with_call_timeout(Some(Duration::from_secs(30)))
            .with_connect_timeout(Duration::from_secs(1));
        assert_eq!(config.call_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_execute_map_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/map"))
            .and(body_partial_json(serde_json::json!({"task_id": 7, "n_output": 3})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "output_files": ["d/mapper_7_reducer_0.txt"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let proxy = proxy_for(&server);
        let response = proxy
            .execute_map(MapTaskRequest {
                task: "wordcount".into(),
                task_id: 7,
                pieces: vec![],
                n_output: 3,
                output_dir: PathBuf::from("d"),
            })
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.output_files.len(), 1);
    }

    #[tokio::test]
    async fn test_application_failure_is_passed_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/reduce"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false,
                "error": "missing input dir"
            })))
            .mount(&server)
            .await;

        let response = proxy_for(&server)
            .execute_reduce(reduce_request())
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("missing input dir"));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/reduce"))
            .respond_with(ResponseTemplate::new(503).set_body_string("draining"))
            .mount(&server)
            .await;

        let err = proxy_for(&server)
            .execute_reduce(reduce_request())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WorkerError::Http {
                status: 503,
                message: "draining".into()
            }
        );
    }

    #[tokio::test]
    async fn test_transport_failure() {
        // Nothing listens on this port once the server is dropped
        let uri = {
            let server = MockServer::start().await;
            server.uri()
        };
        let proxy = HttpWorkerProxy::new(ProxyConfig::new(uri)).unwrap();

        let err = proxy.execute_reduce(reduce_request()).await.unwrap_err();
        assert!(matches!(err, WorkerError::Transport(_)));
    }

    #[tokio::test]
    async fn test_probe_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        assert!(proxy_for(&server).probe(Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_probe_respects_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        assert!(!proxy_for(&server).probe(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_call_timeout_becomes_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/reduce"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"success": true}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let proxy = HttpWorkerProxy::new(
            ProxyConfig::new(server.uri()).with_call_timeout(Some(Duration::from_millis(100))),
        )
        .unwrap();
        let err = proxy.execute_reduce(reduce_request()).await.unwrap_err();
        assert!(matches!(err, WorkerError::Transport(_)));
    }
}
