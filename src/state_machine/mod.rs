mod job;
mod node;
mod state;

pub use job::{Job, JobStatus, JobType, ReservationStrategy, StatusHistory};
pub use node::{ClusterMember, WorkerAddr, WorkerNode, WorkerStatus};
pub use state::{DispatchDecision, ExecutorFailurePolicy, MAX_ERROR_HISTORY, StateMachine, Transition};
