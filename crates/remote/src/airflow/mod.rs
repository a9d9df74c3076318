//! Apache Airflow as the remote orchestrator.

pub mod artifact;
pub mod client;

pub use artifact::generate;
pub use client::{AirflowClient, AirflowConfig};
