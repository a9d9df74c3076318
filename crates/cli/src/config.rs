//! Optional TOML configuration file.
//!
//! ```toml
//! [executor]
//! max_workers = 8
//! max_retries = 2
//! retry_base_delay_ms = 250
//!
//! [airflow]
//! base_url = "http://airflow:8080"
//! dags_folder = "/opt/airflow/dags"
//!
//! [delegated]
//! poll_interval_secs = 5
//! timeout_secs = 600   # 0 waits forever
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use engine::ExecutorConfig;
use remote::{AirflowConfig, DelegatedConfig};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub executor: ExecutorSection,
    pub airflow: AirflowConfig,
    pub delegated: DelegatedSection,
}

/// Overrides for [`ExecutorConfig`]; unset keys keep its defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub max_workers: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DelegatedSection {
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for DelegatedSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            timeout_secs: 300,
        }
    }
}

impl Settings {
    /// Read `path`, or fall back to defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn executor(&self) -> ExecutorConfig {
        let mut config = ExecutorConfig::default();
        if let Some(n) = self.executor.max_workers {
            config.max_workers = n.max(1);
        }
        if let Some(n) = self.executor.max_retries {
            config.max_retries = n;
        }
        if let Some(ms) = self.executor.retry_base_delay_ms {
            config.retry_base_delay = Duration::from_millis(ms);
        }
        config
    }

    pub fn delegated(&self) -> DelegatedConfig {
        DelegatedConfig {
            poll_interval: Duration::from_secs(self.delegated.poll_interval_secs),
            timeout: match self.delegated.timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            run_conf: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_means_defaults() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.executor().max_retries, ExecutorConfig::default().max_retries);
        assert_eq!(settings.airflow, AirflowConfig::default());
        assert_eq!(settings.delegated().timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn sections_override_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [executor]
            max_workers = 2
            retry_base_delay_ms = 10

            [airflow]
            base_url = "http://airflow:8080"
            dags_folder = "/opt/airflow/dags"

            [delegated]
            timeout_secs = 0
            "#,
        )
        .unwrap();

        let executor = settings.executor();
        assert_eq!(executor.max_workers, 2);
        assert_eq!(executor.max_retries, 3);
        assert_eq!(executor.retry_base_delay, Duration::from_millis(10));

        assert_eq!(settings.airflow.base_url, "http://airflow:8080");
        assert_eq!(settings.airflow.username, "admin");
        assert_eq!(settings.airflow.dags_folder, Path::new("/opt/airflow/dags"));

        let delegated = settings.delegated();
        assert_eq!(delegated.poll_interval, Duration::from_secs(2));
        assert_eq!(delegated.timeout, None);
    }

    #[test]
    fn unknown_section_is_rejected() {
        assert!(toml::from_str::<Settings>("[database]\nurl = \"x\"").is_err());
    }

    #[test]
    fn unreadable_file_names_the_path() {
        let err = Settings::load(Some(Path::new("/nonexistent/flowgraph.toml"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/flowgraph.toml"));
    }
}
