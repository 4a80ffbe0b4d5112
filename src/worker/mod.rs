//! Client side of the worker control protocol.
//!
//! Workers expose `POST /run` and `POST /cancel`, both taking `{job_id}`.
//! Only transport success is observed; the scheduler never waits for a
//! business-level acknowledgement.

pub mod client;
pub mod error;
pub mod types;

use std::future::Future;

pub use client::HttpWorkerClient;
pub use error::WorkerError;
pub use types::JobRequest;

use crate::state_machine::WorkerAddr;

pub trait WorkerControl: Send + Sync {
    /// Ask the worker at `addr` to start `job_id`. Returns the HTTP status.
    fn run(
        &self,
        addr: &WorkerAddr,
        job_id: &str,
    ) -> impl Future<Output = Result<u16, WorkerError>> + Send;

    /// Ask the worker at `addr` to stop `job_id`. Returns the HTTP status.
    fn cancel(
        &self,
        addr: &WorkerAddr,
        job_id: &str,
    ) -> impl Future<Output = Result<u16, WorkerError>> + Send;
}
