//! `remote` crate: runs workflows on an external orchestrator.
//!
//! [`DelegatedExecutor`] turns a [`engine::Workflow`] into an Airflow DAG
//! file, submits and triggers it through a [`RemotePlatform`], polls the run
//! on an injected [`Clock`] and maps the per-task outputs back into an
//! [`engine::ExecutionResult`].

pub mod airflow;
pub mod clock;
pub mod delegated;
pub mod error;
pub mod platform;

pub use airflow::{AirflowClient, AirflowConfig};
pub use clock::{Clock, ManualClock, TokioClock};
pub use delegated::{DelegatedConfig, DelegatedExecutor, PollPhase, MIN_POLL_INTERVAL};
pub use error::RemoteError;
pub use platform::{decode_output, Artifact, RemotePlatform, RemoteRunStatus};
