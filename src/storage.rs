//! Object-storage cleanup for archived jobs.
//!
//! Every job owns two containers, `<id>_input` and `<id>_output`. Once the job
//! is archived their files are deleted, then the containers themselves.
//! Failures are logged and never block archival.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("HTTP client error: {0}")]
    Client(String),

    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("authentication rejected (status {0})")]
    Unauthorized(u16),

    #[error("auth reply is missing header {0}")]
    MissingHeader(&'static str),

    #[error("storage error (status {status}) on {target}")]
    Status { status: u16, target: String },
}

pub trait ObjectStorage: Send + Sync {
    fn delete_file(
        &self,
        container: &str,
        file: &str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn delete_container(
        &self,
        container: &str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// Delete `files` from `container`, then the container. Returns how many of
/// the deletions, container included, failed.
pub async fn purge_container(
    storage: &impl ObjectStorage,
    container: &str,
    files: &[String],
) -> usize {
    let mut failures = 0;
    for file in files {
        match storage.delete_file(container, file).await {
            Ok(()) => debug!(container, file, "file deleted"),
            Err(e) => {
                warn!(container, file, error = %e, "failed to delete file");
                failures += 1;
            }
        }
    }
    match storage.delete_container(container).await {
        Ok(()) => info!(container, "container purged"),
        Err(e) => {
            warn!(container, error = %e, "failed to delete container");
            failures += 1;
        }
    }
    failures
}

#[derive(Debug, Clone)]
struct Session {
    storage_url: String,
    token: String,
}

/// Swift-style object storage reached through the v1.0 auth endpoint.
pub struct SwiftClient {
    client: Client,
    config: StorageConfig,
    session: Mutex<Option<Session>>,
}

impl SwiftClient {
    pub fn new(config: StorageConfig, timeout: Duration) -> Result<Self, StorageError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::Client(e.to_string()))?;
        Ok(Self {
            client,
            config,
            session: Mutex::new(None),
        })
    }

    async fn authenticate(&self) -> Result<Session, StorageError> {
        let url = format!("{}/auth/v1.0", self.config.url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .header("X-Auth-User", &self.config.username)
            .header("X-Auth-Key", &self.config.password)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Unauthorized(status.as_u16()));
        }

        let header = |name: &'static str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or(StorageError::MissingHeader(name))
        };
        Ok(Session {
            storage_url: header("X-Storage-Url")?,
            token: header("X-Auth-Token")?,
        })
    }

    async fn session(&self) -> Result<Session, StorageError> {
        let mut cached = self.session.lock().await;
        if let Some(session) = cached.as_ref() {
            return Ok(session.clone());
        }
        let session = self.authenticate().await?;
        *cached = Some(session.clone());
        Ok(session)
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let session = self.session().await?;
        let url = format!("{}/{path}", session.storage_url.trim_end_matches('/'));
        let response = self
            .client
            .delete(&url)
            .header("X-Auth-Token", &session.token)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            StatusCode::UNAUTHORIZED => {
                // Token expired: the next call authenticates again.
                *self.session.lock().await = None;
                Err(StorageError::Unauthorized(StatusCode::UNAUTHORIZED.as_u16()))
            }
            s => Err(StorageError::Status {
                status: s.as_u16(),
                target: path.to_string(),
            }),
        }
    }
}

impl ObjectStorage for SwiftClient {
    async fn delete_file(&self, container: &str, file: &str) -> Result<(), StorageError> {
        self.delete(&format!("{container}/{file}")).await
    }

    async fn delete_container(&self, container: &str) -> Result<(), StorageError> {
        self.delete(container).await
    }
}
