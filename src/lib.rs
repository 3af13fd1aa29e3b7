//! Jobstore: crash-resilient background job scheduling on an embedded store.

pub mod config;
pub mod error;
pub mod jobs;
pub mod store;
pub mod sweeper;
