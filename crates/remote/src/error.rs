//! Errors talking to a remote orchestrator.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport-level failure (connect, TLS, timeout, body decode).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The orchestrator answered with a non-success status.
    #[error("{url} returned {status}: {body}")]
    Status { url: String, status: u16, body: String },

    /// Writing the artifact to the orchestrator's DAG folder failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The orchestrator never picked up the submitted artifact.
    #[error("DAG '{dag_id}' was not parsed within {waited:?}")]
    NotParsed { dag_id: String, waited: Duration },

    /// The configured base URL cannot address the REST API.
    #[error("invalid Airflow base URL: {0}")]
    InvalidUrl(String),

    /// A response did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),
}
