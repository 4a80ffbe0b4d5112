pub mod cli;
pub mod config;
pub mod error;
pub mod monitor;
pub mod notify;
pub mod reservation;
pub mod runtime;
pub mod scheduler;
pub mod state_machine;
pub mod storage;
pub mod store;
pub mod worker;
