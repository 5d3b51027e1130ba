use log::{debug, error, info, warn};
use shared::{BatchResponse, DetectionItem, ErrorBody, ErrorKind, JobId, JobState};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio_util::sync::CancellationToken;

use super::backend::BackendError;
use super::registry::{ActiveModel, ModelRegistry};
use crate::storage::{ArtifactError, ArtifactStore, JobDirectory, UploadWorkspace, WorkspaceError};

pub const NO_DETECTIONS_MESSAGE: &str = "no boxes";

/// Extra time a detector gets to stop its work after the deadline before the
/// runner stops waiting for it.
const KILL_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("no model is active")]
    NoActiveModel,
    #[error("input not found: {0}")]
    InputNotFound(String),
    #[error("inference failed for {input}: {reason}")]
    Inference { input: String, reason: String },
    #[error("inference for {input} timed out after {after:?}")]
    Timeout { input: String, after: Duration },
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::NoActiveModel => ErrorKind::NoActiveModel,
            JobError::InputNotFound(_) => ErrorKind::InputNotFound,
            JobError::Inference { .. } => ErrorKind::InferenceError,
            JobError::Timeout { .. } => ErrorKind::Timeout,
            JobError::Artifact(err) => err.kind(),
            JobError::Workspace(err) => err.kind(),
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody::new(self.kind(), self.to_string())
    }
}

/// Output of one successful job.
#[derive(Debug, Clone)]
pub struct ResultArtifact {
    pub job_id: JobId,
    pub input_name: String,
    pub model_id: String,
    pub model_version: u64,
    pub output_urls: Vec<String>,
    pub directory: JobDirectory,
    pub directory_url: String,
}

impl ResultArtifact {
    pub fn to_item(&self) -> DetectionItem {
        DetectionItem {
            input: self.input_name.clone(),
            status: JobState::Completed,
            job_id: Some(self.job_id),
            model: Some(self.model_id.clone()),
            results: self.output_urls.clone(),
            saved_dir: Some(self.directory_url.clone()),
            message: self
                .output_urls
                .is_empty()
                .then(|| NO_DETECTIONS_MESSAGE.to_string()),
            error: None,
        }
    }
}

#[derive(Debug)]
pub struct BatchItem {
    pub input: String,
    pub outcome: Result<ResultArtifact, JobError>,
}

impl BatchItem {
    pub fn to_item(&self) -> DetectionItem {
        match &self.outcome {
            Ok(artifact) => artifact.to_item(),
            Err(err) => DetectionItem {
                input: self.input.clone(),
                status: JobState::Failed,
                job_id: None,
                model: None,
                results: Vec::new(),
                saved_dir: None,
                message: None,
                error: Some(err.body()),
            },
        }
    }
}

#[derive(Debug)]
pub struct BatchReport {
    pub batch_id: JobId,
    pub state: JobState,
    pub cancelled: bool,
    pub items: Vec<BatchItem>,
}

impl BatchReport {
    fn finish(batch_id: JobId, items: Vec<BatchItem>, cancelled: bool) -> Self {
        let failed = items.iter().filter(|item| item.outcome.is_err()).count();
        let state = if failed == 0 {
            JobState::Completed
        } else if failed == items.len() {
            JobState::Failed
        } else {
            JobState::PartiallyFailed
        };
        Self {
            batch_id,
            state,
            cancelled,
            items,
        }
    }

    pub fn to_response(&self) -> BatchResponse {
        BatchResponse {
            batch_id: self.batch_id,
            status: self.state,
            cancelled: self.cancelled,
            results: self.items.iter().map(BatchItem::to_item).collect(),
            batch_dirs: self
                .items
                .iter()
                .filter_map(|item| item.outcome.as_ref().ok())
                .map(|artifact| artifact.directory_url.clone())
                .collect(),
        }
    }
}

/// One input on its way through the model. The model is fixed when the job
/// is created and never re-read.
struct DetectionJob {
    id: JobId,
    input: String,
    model: Arc<ActiveModel>,
    state: JobState,
}

impl DetectionJob {
    fn new(input: &str, model: Arc<ActiveModel>) -> Self {
        Self {
            id: JobId::new(),
            input: input.to_string(),
            model,
            state: JobState::Created,
        }
    }

    fn transition(&mut self, next: JobState) {
        debug!("Job {} ({}): {} -> {}", self.id, self.input, self.state, next);
        self.state = next;
    }
}

pub struct DetectionRunner {
    registry: Arc<ModelRegistry>,
    artifacts: Arc<ArtifactStore>,
    timeout: Duration,
}

impl DetectionRunner {
    pub fn new(registry: Arc<ModelRegistry>, artifacts: Arc<ArtifactStore>, timeout: Duration) -> Self {
        Self {
            registry,
            artifacts,
            timeout,
        }
    }

    pub async fn run_one(
        &self,
        workspace: &UploadWorkspace,
        stored_name: &str,
    ) -> Result<ResultArtifact, JobError> {
        let source = workspace.resolve(stored_name).await.map_err(|err| match err {
            WorkspaceError::NotFound(name) => JobError::InputNotFound(name),
            other => other.into(),
        })?;

        let model = self.registry.current().ok_or(JobError::NoActiveModel)?;
        let mut job = DetectionJob::new(stored_name, model);

        match self.execute(&mut job, source).await {
            Ok(artifact) => {
                job.transition(JobState::Completed);
                info!(
                    "Job {} completed: {} with {} v{} -> {} file(s)",
                    job.id,
                    job.input,
                    job.model.id,
                    job.model.version,
                    artifact.output_urls.len()
                );
                Ok(artifact)
            }
            Err(err) => {
                job.transition(JobState::Failed);
                warn!("Job {} failed for {}: {}", job.id, job.input, err);
                Err(err)
            }
        }
    }

    async fn execute(&self, job: &mut DetectionJob, source: PathBuf) -> Result<ResultArtifact, JobError> {
        let directory = self.artifacts.new_job_directory(&job.id, &job.input).await?;

        let image = directory.path.join(&job.input);
        match fs::copy(&source, &image).await {
            Ok(_) => {}
            // The workspace was reset between resolve and copy.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(JobError::InputNotFound(job.input.clone()));
            }
            Err(err) => return Err(ArtifactError::from(err).into()),
        }
        let before = self.artifacts.snapshot(&directory).await?;

        job.transition(JobState::Running);
        let detector = job.model.detector();
        let output_dir = directory.path.clone();
        let deadline = Instant::now() + self.timeout;
        let handle =
            tokio::task::spawn_blocking(move || detector.detect(&image, &output_dir, deadline));

        match tokio::time::timeout(self.timeout + KILL_GRACE, handle).await {
            Err(_) | Ok(Ok(Err(BackendError::TimedOut))) => {
                return Err(JobError::Timeout {
                    input: job.input.clone(),
                    after: self.timeout,
                });
            }
            Ok(Err(join)) => {
                error!("Inference task for {} panicked: {}", job.input, join);
                return Err(JobError::Inference {
                    input: job.input.clone(),
                    reason: join.to_string(),
                });
            }
            Ok(Ok(Err(err))) => {
                return Err(JobError::Inference {
                    input: job.input.clone(),
                    reason: err.to_string(),
                });
            }
            Ok(Ok(Ok(()))) => {}
        }

        let output_urls = self.artifacts.record(&directory, &before).await?;
        Ok(ResultArtifact {
            job_id: job.id,
            input_name: job.input.clone(),
            model_id: job.model.id.clone(),
            model_version: job.model.version,
            output_urls,
            directory_url: self.artifacts.dir_url(&directory),
            directory,
        })
    }

    /// Runs every staged input in name order. A failing input is reported and
    /// the batch moves on; cancellation is only observed between inputs.
    pub async fn run_all(
        &self,
        workspace: &UploadWorkspace,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, JobError> {
        let batch_id = JobId::new();
        let inputs = workspace.list().await?;
        info!("Batch {} started with {} input(s)", batch_id, inputs.len());

        let mut items = Vec::with_capacity(inputs.len());
        let mut cancelled = false;
        for input in inputs {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let outcome = self.run_one(workspace, &input.stored_name).await;
            items.push(BatchItem {
                input: input.stored_name,
                outcome,
            });
        }

        let report = BatchReport::finish(batch_id, items, cancelled);
        if report.cancelled {
            warn!(
                "Batch {} cancelled after {} input(s)",
                report.batch_id,
                report.items.len()
            );
        } else {
            info!("Batch {} finished: {}", report.batch_id, report.state);
        }
        Ok(report)
    }
}
