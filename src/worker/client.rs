use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use super::error::WorkerError;
use super::types::JobRequest;
use super::WorkerControl;
use crate::state_machine::WorkerAddr;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpWorkerClient {
    client: Client,
}

impl HttpWorkerClient {
    /// Every request, connection included, is cut off after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, WorkerError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| WorkerError::Client(e.to_string()))?;
        Ok(Self { client })
    }

    async fn post(&self, addr: &WorkerAddr, path: &str, job_id: &str) -> Result<u16, WorkerError> {
        let url = format!("{}{path}", addr.base_url());
        let response = self
            .client
            .post(&url)
            .json(&JobRequest::new(job_id))
            .send()
            .await?;
        let status = response.status().as_u16();
        debug!(worker = %addr, job_id, path, status, "worker replied");
        Ok(status)
    }
}

impl WorkerControl for HttpWorkerClient {
    async fn run(&self, addr: &WorkerAddr, job_id: &str) -> Result<u16, WorkerError> {
        self.post(addr, "/run", job_id).await
    }

    async fn cancel(&self, addr: &WorkerAddr, job_id: &str) -> Result<u16, WorkerError> {
        self.post(addr, "/cancel", job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn addr_of(server: &MockServer) -> WorkerAddr {
        let socket = server.address();
        WorkerAddr::new(socket.ip().to_string(), socket.port())
    }

    #[tokio::test]
    async fn run_posts_job_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/run"))
            .and(body_json(serde_json::json!({ "job_id": "j1" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpWorkerClient::new(Duration::from_secs(2)).unwrap();
        let status = client.run(&addr_of(&server), "j1").await.unwrap();
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn cancel_reports_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cancel"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpWorkerClient::new(Duration::from_secs(2)).unwrap();
        let status = client.cancel(&addr_of(&server), "j1").await.unwrap();
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn slow_worker_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = HttpWorkerClient::new(Duration::from_millis(200)).unwrap();
        let err = client.run(&addr_of(&server), "j1").await.unwrap_err();
        assert!(matches!(err, WorkerError::Transport(_)));
    }

    #[tokio::test]
    async fn unreachable_worker_is_transport_error() {
        let client = HttpWorkerClient::new(Duration::from_millis(500)).unwrap();
        let err = client
            .cancel(&WorkerAddr::new("127.0.0.1", 1), "j1")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Transport(_)));
    }
}
