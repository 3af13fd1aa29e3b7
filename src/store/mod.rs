//! Persistence layer: pool, recovery and the job repository on embedded libSQL.

pub mod job_repository;
pub mod pool;
pub mod recovery;
pub mod schema;

pub use job_repository::BackgroundJobRepository;
pub use pool::{AccessMode, ConnectionPool};
pub use recovery::{
    PermissionManager, RecoveryLadder, RecoveryManager, RecoveryStrategy, StepOutcome,
};
