//! Training runner — one tracked fit/test/log-model run.

use super::accumulator::TestMetricsCallback;
use super::callbacks::EarlyStoppingCallback;
use super::metrics::TrainingMetrics;
use super::trainer::{TestResults, Trainer};
use crate::config::ChestnetConfig;
use crate::data::DataModule;
use crate::error::MlError;
use crate::model::ClassifierModel;
use crate::tracking::{
    ModelVersion, RunBinding, RunInfo, RunLogger, RunStatus, TrackingSession,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// What a finished run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub experiment_id: String,
    pub status: RunStatus,
    pub artifact_uri: String,
    pub training: TrainingMetrics,
    pub test: TestResults,
    pub model_version: Option<ModelVersion>,
}

/// Owns the tracking run around a training job.
///
/// Exactly one run is started per [`run`](Self::run); it stays active through
/// fit, test and model logging, and is ended `FINISHED` or `FAILED`.
pub struct TrainingRunner {
    config: Arc<ChestnetConfig>,
    session: Arc<TrackingSession>,
}

impl TrainingRunner {
    pub fn new(config: Arc<ChestnetConfig>, session: Arc<TrackingSession>) -> Self {
        Self { config, session }
    }

    pub fn session(&self) -> &Arc<TrackingSession> {
        &self.session
    }

    pub async fn run(
        &self,
        model: &mut dyn ClassifierModel,
        data: &dyn DataModule,
    ) -> Result<RunSummary, MlError> {
        let tracking = &self.config.tracking;
        let mut tags = tracking.tags.clone();
        tags.insert("model_type".into(), model.name().to_string());

        let run = self
            .session
            .start_run(&tracking.experiment_name, &tracking.run_name, &tags)
            .await?;

        let result = match self.execute(&run, model, data).await {
            Ok(summary) => self.finish(summary).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            error!(run_id = %run.run_id, error = %e, "Run failed");
            self.mark_failed(&run).await;
        }
        result
    }

    async fn finish(&self, mut summary: RunSummary) -> Result<RunSummary, MlError> {
        let ended = self.session.end_run(RunStatus::Finished).await?;
        summary.status = ended.status;
        info!(
            run_id = %summary.run_id,
            test_loss = summary.test.test_loss,
            epochs = summary.training.epochs_completed,
            "Run finished"
        );
        Ok(summary)
    }

    /// Best-effort `FAILED` status. The slot may already be empty if ending
    /// the run as `FINISHED` was what failed.
    async fn mark_failed(&self, run: &RunInfo) {
        let result = if self.session.active_run().is_some() {
            self.session.end_run(RunStatus::Failed).await
        } else {
            self.session
                .backend()
                .update_run(&run.run_id, RunStatus::Failed)
                .await
        };
        if let Err(end_err) = result {
            warn!(run_id = %run.run_id, error = %end_err, "Could not mark run as failed");
        }
    }

    async fn execute(
        &self,
        run: &RunInfo,
        model: &mut dyn ClassifierModel,
        data: &dyn DataModule,
    ) -> Result<RunSummary, MlError> {
        let binding = RunBinding::new(self.session.clone(), &run.run_id);
        let logger = RunLogger::new(&binding);

        let mut params = self.config.hyperparams();
        params.extend(model.hyperparams());
        logger.log_hyperparams(&params).await?;

        let training_config = &self.config.training;
        let mut trainer = Trainer::new(training_config).with_logger(logger);
        trainer.add_callback(Box::new(EarlyStoppingCallback::new(
            training_config.patience,
            training_config.min_delta,
        )));
        trainer.add_observer(Box::new(TestMetricsCallback::new(binding)));

        let training = trainer.fit(model, data).await?;
        let test = trainer.test(model, data).await?;
        info!(
            test_loss = test.test_loss,
            num_samples = test.num_samples,
            "Test results"
        );

        let model_version = if self.config.tracking.log_model {
            Some(self.log_model(run, model).await?)
        } else {
            None
        };

        Ok(RunSummary {
            run_id: run.run_id.clone(),
            experiment_id: run.experiment_id.clone(),
            status: run.status,
            artifact_uri: run.artifact_uri.clone(),
            training,
            test,
            model_version,
        })
    }

    /// Upload the exported model into the active run and register a version.
    async fn log_model(
        &self,
        run: &RunInfo,
        model: &dyn ClassifierModel,
    ) -> Result<ModelVersion, MlError> {
        let artifact = model.export()?;
        for file in &artifact.files {
            self.session.log_artifact(&file.path, &file.contents).await?;
        }
        let source = format!(
            "{}/{}",
            run.artifact_uri.trim_end_matches('/'),
            artifact.artifact_path
        );
        let version = self
            .session
            .backend()
            .register_model(&self.config.tracking.registered_model_name, &run.run_id, &source)
            .await?;
        info!(
            name = %version.name,
            version = %version.version,
            source = %version.source,
            "Registered model version"
        );
        Ok(version)
    }
}
