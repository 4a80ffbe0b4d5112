use thiserror::Error;

/// Failure to reach a worker. Never rolls back a committed transition.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("HTTP client error: {0}")]
    Client(String),

    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),
}
