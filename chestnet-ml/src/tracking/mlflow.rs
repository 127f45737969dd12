//! MLflow tracking server client (REST API 2.0).

use super::{LogBatch, ModelVersion, RunInfo, RunStatus, RunTag, TrackingBackend, now_millis};
use crate::error::MlError;
use async_trait::async_trait;
use reqwest::{RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const RESOURCE_DOES_NOT_EXIST: &str = "RESOURCE_DOES_NOT_EXIST";
const RESOURCE_ALREADY_EXISTS: &str = "RESOURCE_ALREADY_EXISTS";
const PROXIED_ARTIFACT_SCHEME: &str = "mlflow-artifacts:";

/// HTTP client for an MLflow tracking server.
pub struct MlflowClient {
    base_url: String,
    http: reqwest::Client,
}

/// Error body returned by the MLflow REST API.
#[derive(Debug, Clone, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug)]
enum CallError {
    Api { status: u16, error: ApiError },
    Transport(MlError),
}

impl CallError {
    fn is_code(&self, code: &str) -> bool {
        matches!(self, CallError::Api { error, .. } if error.error_code == code)
    }
}

impl From<CallError> for MlError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Api { status, error } => MlError::tracking(format!(
                "MLflow returned {status} {}: {}",
                error.error_code, error.message
            )),
            CallError::Transport(e) => e,
        }
    }
}

impl From<reqwest::Error> for CallError {
    fn from(err: reqwest::Error) -> Self {
        CallError::Transport(err.into())
    }
}

#[derive(Deserialize)]
struct Empty {}

#[derive(Deserialize)]
struct ExperimentResponse {
    experiment: ExperimentInfo,
}

#[derive(Deserialize)]
struct ExperimentInfo {
    experiment_id: String,
}

#[derive(Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Deserialize)]
struct RunResponse {
    run: RunBody,
}

#[derive(Deserialize)]
struct RunBody {
    info: RunInfo,
}

#[derive(Deserialize)]
struct UpdateRunResponse {
    run_info: RunInfo,
}

#[derive(Deserialize)]
struct ModelVersionResponse {
    model_version: ModelVersion,
}

#[derive(Serialize)]
struct CreateRunRequest<'a> {
    experiment_id: &'a str,
    run_name: &'a str,
    start_time: i64,
    tags: &'a [RunTag],
}

#[derive(Serialize)]
struct UpdateRunRequest<'a> {
    run_id: &'a str,
    status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_time: Option<i64>,
}

#[derive(Serialize)]
struct LogBatchRequest<'a> {
    run_id: &'a str,
    #[serde(flatten)]
    batch: &'a LogBatch,
}

impl MlflowClient {
    pub fn new(tracking_uri: &str, timeout: Duration) -> Result<Self, MlError> {
        let base_url = tracking_uri.trim_end_matches('/').to_string();
        Url::parse(&base_url)
            .map_err(|e| MlError::config(format!("invalid tracking URI {tracking_uri}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MlError::tracking(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow/{}", self.base_url, path)
    }

    async fn call<R: DeserializeOwned>(&self, request: RequestBuilder) -> Result<R, CallError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            let error = serde_json::from_slice::<ApiError>(&body).unwrap_or_else(|_| ApiError {
                error_code: status.canonical_reason().unwrap_or("UNKNOWN").to_string(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
            return Err(CallError::Api {
                status: status.as_u16(),
                error,
            });
        }
        let body: &[u8] = if body.is_empty() { b"{}" } else { &body };
        serde_json::from_slice(body).map_err(|e| {
            CallError::Transport(MlError::tracking(format!(
                "unexpected MLflow response: {e}"
            )))
        })
    }

    async fn get<R: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<R, CallError> {
        let url = Url::parse_with_params(&self.api(path), params).map_err(|e| {
            CallError::Transport(MlError::config(format!("invalid MLflow URL: {e}")))
        })?;
        debug!(%url, "MLflow GET");
        self.call(self.http.get(url)).await
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, CallError> {
        debug!(path, "MLflow POST");
        self.call(self.http.post(self.api(path)).json(body)).await
    }

    /// Artifact-proxy URL for `artifact_path` under a run's `mlflow-artifacts:` root.
    fn artifact_url(&self, artifact_uri: &str, artifact_path: &str) -> Result<String, MlError> {
        let rest = artifact_uri
            .strip_prefix(PROXIED_ARTIFACT_SCHEME)
            .ok_or_else(|| {
                MlError::tracking(format!(
                    "artifact store {artifact_uri} is not served by the tracking server; \
                     start it with --serve-artifacts"
                ))
            })?;
        // `mlflow-artifacts://host:port/path` carries an authority before the path.
        let rest = match rest.strip_prefix("//") {
            Some(with_host) => with_host.split_once('/').map_or("", |(_, path)| path),
            None => rest,
        };
        let root = rest.trim_matches('/');
        Ok(format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{}/{}",
            self.base_url,
            root,
            artifact_path.trim_start_matches('/')
        ))
    }
}

#[async_trait]
impl TrackingBackend for MlflowClient {
    fn name(&self) -> &str {
        "mlflow"
    }

    async fn get_or_create_experiment(&self, name: &str) -> Result<String, MlError> {
        match self
            .get::<ExperimentResponse>("experiments/get-by-name", &[("experiment_name", name)])
            .await
        {
            Ok(resp) => Ok(resp.experiment.experiment_id),
            Err(e) if e.is_code(RESOURCE_DOES_NOT_EXIST) => {
                let created: CreateExperimentResponse = self
                    .post("experiments/create", &serde_json::json!({ "name": name }))
                    .await?;
                debug!(experiment = name, id = %created.experiment_id, "Created MLflow experiment");
                Ok(created.experiment_id)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        tags: &[RunTag],
    ) -> Result<RunInfo, MlError> {
        let request = CreateRunRequest {
            experiment_id,
            run_name,
            start_time: now_millis(),
            tags,
        };
        let resp: RunResponse = self.post("runs/create", &request).await?;
        Ok(resp.run.info)
    }

    async fn get_run(&self, run_id: &str) -> Result<RunInfo, MlError> {
        let resp: RunResponse = self.get("runs/get", &[("run_id", run_id)]).await?;
        Ok(resp.run.info)
    }

    async fn update_run(&self, run_id: &str, status: RunStatus) -> Result<RunInfo, MlError> {
        let request = UpdateRunRequest {
            run_id,
            status,
            end_time: status.is_terminal().then(now_millis),
        };
        let resp: UpdateRunResponse = self.post("runs/update", &request).await?;
        Ok(resp.run_info)
    }

    async fn log_batch(&self, run_id: &str, batch: &LogBatch) -> Result<(), MlError> {
        if batch.is_empty() {
            return Ok(());
        }
        let _: Empty = self
            .post("runs/log-batch", &LogBatchRequest { run_id, batch })
            .await?;
        Ok(())
    }

    async fn log_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        contents: &[u8],
    ) -> Result<(), MlError> {
        super::validate_artifact_path(artifact_path)?;
        let run = self.get_run(run_id).await?;
        let url = self.artifact_url(&run.artifact_uri, artifact_path)?;
        debug!(%url, bytes = contents.len(), "MLflow artifact upload");
        let _: Empty = self
            .call(self.http.put(url).body(contents.to_vec()))
            .await?;
        Ok(())
    }

    async fn register_model(
        &self,
        name: &str,
        run_id: &str,
        source: &str,
    ) -> Result<ModelVersion, MlError> {
        match self
            .post::<_, Empty>("registered-models/create", &serde_json::json!({ "name": name }))
            .await
        {
            Ok(_) => debug!(model = name, "Created registered model"),
            Err(e) if e.is_code(RESOURCE_ALREADY_EXISTS) => {}
            Err(e) => return Err(e.into()),
        }
        let resp: ModelVersionResponse = self
            .post(
                "model-versions/create",
                &serde_json::json!({ "name": name, "source": source, "run_id": run_id }),
            )
            .await?;
        Ok(resp.model_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> MlflowClient {
        MlflowClient::new("http://localhost:5000/", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_base_url_trims_trailing_slash() {
        assert_eq!(client().base_url(), "http://localhost:5000");
        assert_eq!(
            client().api("runs/create"),
            "http://localhost:5000/api/2.0/mlflow/runs/create"
        );
    }

    #[test]
    fn test_artifact_url_from_proxied_uri() {
        let url = client()
            .artifact_url("mlflow-artifacts:/3/abc123/artifacts", "model/MLmodel")
            .unwrap();
        assert_eq!(
            url,
            "http://localhost:5000/api/2.0/mlflow-artifacts/artifacts/3/abc123/artifacts/model/MLmodel"
        );
    }

    #[test]
    fn test_artifact_url_with_authority() {
        let url = client()
            .artifact_url("mlflow-artifacts://tracking:5000/3/abc/artifacts", "m.json")
            .unwrap();
        assert!(url.ends_with("/mlflow-artifacts/artifacts/3/abc/artifacts/m.json"));
    }

    #[test]
    fn test_artifact_url_rejects_direct_store() {
        let err = client()
            .artifact_url("s3://bucket/3/abc/artifacts", "m.json")
            .unwrap_err();
        assert!(err.is_tracking());
    }

    #[test]
    fn test_log_batch_request_shape() {
        let batch = LogBatch::metrics(vec![crate::tracking::Metric {
            key: "test_accuracy".into(),
            value: 0.9,
            timestamp: 1,
            step: 0,
        }]);
        let json = serde_json::to_value(LogBatchRequest {
            run_id: "r1",
            batch: &batch,
        })
        .unwrap();
        assert_eq!(json["run_id"], "r1");
        assert_eq!(json["metrics"][0]["key"], "test_accuracy");
        assert!(json["params"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_uri_is_config_error() {
        assert!(matches!(
            MlflowClient::new("http://", Duration::from_secs(1)),
            Err(MlError::Config(_))
        ));
    }
}
