//! Airflow REST v1 client.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::platform::{decode_output, Artifact, RemotePlatform, RemoteRunStatus};
use crate::RemoteError;

/// Connection settings for an Airflow deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AirflowConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Directory Airflow's scheduler scans for DAG files.
    pub dags_folder: PathBuf,
    /// How long to wait for a written DAG to become active, in seconds.
    pub parse_timeout_secs: u64,
    /// Delay between DAG parse checks, in seconds.
    pub parse_poll_secs: u64,
    /// Per-request HTTP timeout, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for AirflowConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            username: "admin".into(),
            password: "admin".into(),
            dags_folder: PathBuf::from("dags"),
            parse_timeout_secs: 45,
            parse_poll_secs: 3,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Deserialize)]
struct DagInfo {
    #[serde(default)]
    is_active: Option<bool>,
    #[serde(default)]
    is_paused: Option<bool>,
}

#[derive(Deserialize)]
struct DagRun {
    dag_run_id: String,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Deserialize)]
struct XcomEntry {
    value: Value,
}

/// [`RemotePlatform`] backed by Airflow's stable REST API.
pub struct AirflowClient {
    client: reqwest::Client,
    config: AirflowConfig,
    base_url: Url,
}

impl AirflowClient {
    /// # Errors
    /// [`RemoteError::InvalidUrl`] if `base_url` is not an absolute http(s)
    /// URL that can carry a path.
    pub fn new(config: AirflowConfig) -> Result<Self, RemoteError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| RemoteError::InvalidUrl(format!("{}: {e}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteError::InvalidUrl(config.base_url.clone()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    pub fn config(&self) -> &AirflowConfig {
        &self.config
    }

    /// `<base>/api/v1/<segments..>`, each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Checked in `new`.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(["api", "v1"]).extend(segments);
        }
        url
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response, RemoteError> {
        let response = request
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;
        Ok(response)
    }

    async fn expect_success(response: Response) -> Result<Response, RemoteError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Status { url, status, body })
    }

    /// Wait until Airflow has parsed `dag_id` and it is active, unpausing it
    /// if necessary.
    #[instrument(skip(self))]
    async fn wait_for_parse(&self, dag_id: &str) -> Result<(), RemoteError> {
        let url = self.url(&["dags", dag_id]);
        let limit = Duration::from_secs(self.config.parse_timeout_secs);
        let interval = Duration::from_secs(self.config.parse_poll_secs);
        let started = tokio::time::Instant::now();

        loop {
            let waited = started.elapsed();
            if waited >= limit {
                return Err(RemoteError::NotParsed {
                    dag_id: dag_id.to_owned(),
                    waited,
                });
            }

            match self.send(self.client.get(url.clone())).await {
                Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                    debug!("DAG not parsed yet");
                }
                Ok(response) => {
                    let info: DagInfo = Self::expect_success(response).await?.json().await?;
                    if info.is_active.unwrap_or(true) {
                        if info.is_paused.unwrap_or(false) {
                            let unpause = self.client.patch(url.clone()).json(&json!({ "is_paused": false }));
                            Self::expect_success(self.send(unpause).await?).await?;
                            info!("DAG unpaused");
                        }
                        info!(?waited, "DAG parsed");
                        return Ok(());
                    }
                    debug!("DAG parsed but not active yet");
                }
                Err(err) => debug!(error = %err, "DAG lookup failed, retrying"),
            }

            tokio::time::sleep(interval).await;
        }
    }
}

#[async_trait]
impl RemotePlatform for AirflowClient {
    #[instrument(skip_all, fields(dag_id = %artifact.dag_id))]
    async fn submit_artifact(&self, artifact: &Artifact) -> Result<(), RemoteError> {
        tokio::fs::create_dir_all(&self.config.dags_folder).await?;
        let path = self.config.dags_folder.join(&artifact.file_name);
        tokio::fs::write(&path, &artifact.source).await?;
        info!(path = %path.display(), "DAG file written");

        self.wait_for_parse(&artifact.dag_id).await
    }

    async fn trigger_run(&self, dag_id: &str, conf: &Value) -> Result<String, RemoteError> {
        let url = self.url(&["dags", dag_id, "dagRuns"]);
        let request = self.client.post(url).json(&json!({ "conf": conf }));
        let run: DagRun = Self::expect_success(self.send(request).await?).await?.json().await?;
        info!(dag_id, run_id = %run.dag_run_id, "DAG run triggered");
        Ok(run.dag_run_id)
    }

    async fn run_status(&self, dag_id: &str, run_id: &str) -> Result<RemoteRunStatus, RemoteError> {
        let url = self.url(&["dags", dag_id, "dagRuns", run_id]);
        let run: DagRun = Self::expect_success(self.send(self.client.get(url)).await?)
            .await?
            .json()
            .await?;
        let state = run
            .state
            .ok_or_else(|| RemoteError::Decode(format!("DAG run '{run_id}' has no state")))?;
        Ok(RemoteRunStatus::from_airflow_state(&state))
    }

    async fn task_output(
        &self,
        dag_id: &str,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<Value>, RemoteError> {
        let url = self.url(&[
            "dags",
            dag_id,
            "dagRuns",
            run_id,
            "taskInstances",
            step_id,
            "xcomEntries",
            "return_value",
        ]);
        let response = self.send(self.client.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let entry: XcomEntry = Self::expect_success(response).await?.json().await?;
        Ok(Some(decode_output(entry.value)))
    }
}
