//! Background jobs: the record model and its lifecycle rules.

pub mod model;

pub use model::{
    HistoryCleanup, Job, JobConfig, JobStatus, JobStatusUpdate, NewJob, PayloadMode,
    PRIORITY_METADATA_KEY,
};
