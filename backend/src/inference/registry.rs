use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use shared::{ErrorKind, ModelInfo};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::fs;
use tokio::sync::Mutex;

use super::backend::{Detector, ModelLoader};
use crate::storage::naming::{self, SafeName};

const MAX_ID_ATTEMPTS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model not found: {0}")]
    NotFound(String),
    #[error("failed to load model {id}: {reason}")]
    Load { id: String, reason: String },
    #[error("invalid model file '{name}': expected a .{expected} file")]
    InvalidFormat { name: String, expected: String },
    #[error("failed to persist the active model selection: {0}")]
    Persist(#[source] io::Error),
    #[error("model store I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ModelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModelError::NotFound(_) => ErrorKind::ModelNotFound,
            ModelError::Load { .. } => ErrorKind::ModelLoadError,
            ModelError::InvalidFormat { .. } => ErrorKind::InvalidModelFormat,
            ModelError::Persist(_) | ModelError::Io(_) => ErrorKind::Internal,
        }
    }
}

/// One activation of a model. Immutable; a later activation produces a new
/// value with a higher version while jobs keep whichever `Arc` they took.
pub struct ActiveModel {
    pub id: String,
    pub path: PathBuf,
    pub version: u64,
    pub digest: String,
    pub activated_at: DateTime<Utc>,
    detector: Arc<dyn Detector>,
}

impl ActiveModel {
    pub fn detector(&self) -> Arc<dyn Detector> {
        self.detector.clone()
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            id: self.id.clone(),
            path: self.path.display().to_string(),
            version: self.version,
            digest: self.digest.clone(),
            activated_at: self.activated_at.to_rfc3339(),
        }
    }
}

impl fmt::Debug for ActiveModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveModel")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("version", &self.version)
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ActiveSelection {
    active_model: Option<String>,
}

pub struct ModelRegistry {
    models_dir: PathBuf,
    config_path: PathBuf,
    extension: String,
    loader: Arc<dyn ModelLoader>,
    active: RwLock<Option<Arc<ActiveModel>>>,
    swap: Mutex<()>,
    versions: AtomicU64,
}

impl ModelRegistry {
    pub fn new(
        models_dir: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        extension: impl Into<String>,
        loader: Arc<dyn ModelLoader>,
    ) -> Self {
        Self {
            models_dir: models_dir.into(),
            config_path: config_path.into(),
            extension: extension.into().trim_start_matches('.').to_ascii_lowercase(),
            loader,
            active: RwLock::new(None),
            swap: Mutex::new(()),
            versions: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> Option<Arc<ActiveModel>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn list_available(&self) -> Result<Vec<String>, ModelError> {
        let mut entries = match fs::read_dir(&self.models_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut models = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') || !self.has_model_extension(&name) {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                models.push(name);
            }
        }
        models.sort();
        Ok(models)
    }

    /// Loads `model_id` and, only once that succeeded, makes it the active
    /// model and persists the choice. On any failure the previous model stays.
    pub async fn activate(&self, model_id: &str) -> Result<Arc<ActiveModel>, ModelError> {
        // Same visibility rules as `list_available`: hidden partials and
        // foreign files are not models.
        if !naming::is_plain_component(model_id)
            || model_id.starts_with('.')
            || !self.has_model_extension(model_id)
        {
            return Err(ModelError::NotFound(model_id.to_string()));
        }
        let path = self.models_dir.join(model_id);
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {}
            _ => return Err(ModelError::NotFound(model_id.to_string())),
        }

        let _swap = self.swap.lock().await;

        let loader = self.loader.clone();
        let load_path = path.clone();
        let loaded = tokio::task::spawn_blocking(move || loader.load(&load_path))
            .await
            .map_err(|err| ModelError::Load {
                id: model_id.to_string(),
                reason: err.to_string(),
            })?
            .map_err(|err| ModelError::Load {
                id: model_id.to_string(),
                reason: err.to_string(),
            })?;

        let model = Arc::new(ActiveModel {
            id: model_id.to_string(),
            path,
            version: self.versions.fetch_add(1, Ordering::SeqCst) + 1,
            digest: loaded.digest,
            activated_at: Utc::now(),
            detector: loaded.detector,
        });

        self.persist_selection(model_id)
            .await
            .map_err(ModelError::Persist)?;

        let previous = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(model.clone());

        match previous {
            Some(previous) => info!(
                "Active model switched from {} (v{}) to {} (v{})",
                previous.id, previous.version, model.id, model.version
            ),
            None => info!("Active model set to {} (v{})", model.id, model.version),
        }
        Ok(model)
    }

    /// Stores a model file without activating it. Returns the stored id.
    ///
    /// An installed id is never overwritten: loaded detectors keep reading
    /// their file, so a name that is taken gets a random suffix instead.
    pub async fn install(&self, file_name: &str, bytes: &[u8]) -> Result<String, ModelError> {
        let safe = SafeName::from_client(file_name);
        if !safe.ext.eq_ignore_ascii_case(&self.extension) {
            return Err(ModelError::InvalidFormat {
                name: file_name.to_string(),
                expected: self.extension.clone(),
            });
        }
        let mut model_id = safe.file_name();

        fs::create_dir_all(&self.models_dir).await?;
        // Written under a dot-prefixed name so a half-written file is never listed.
        let partial = self
            .models_dir
            .join(format!(".{}.{}.partial", model_id, naming::random_suffix()));
        if let Err(err) = fs::write(&partial, bytes).await {
            self.discard_partial(&partial).await;
            return Err(err.into());
        }

        let mut placed = false;
        for _ in 0..MAX_ID_ATTEMPTS {
            // hard_link fails with AlreadyExists where rename would replace.
            match fs::hard_link(&partial, self.models_dir.join(&model_id)).await {
                Ok(()) => {
                    placed = true;
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("Model id {} taken, retrying with a suffix", model_id);
                    model_id = safe.with_suffix(&naming::random_suffix());
                }
                Err(err) => {
                    self.discard_partial(&partial).await;
                    return Err(err.into());
                }
            }
        }
        self.discard_partial(&partial).await;
        if !placed {
            return Err(ModelError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("no free model id for {file_name}"),
            )));
        }

        info!("Installed model {} ({} bytes)", model_id, bytes.len());
        Ok(model_id)
    }

    async fn discard_partial(&self, partial: &Path) {
        match fs::remove_file(partial).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("Failed to remove partial model {}: {}", partial.display(), err),
        }
    }

    /// Startup selection: the persisted model if it still loads, otherwise the
    /// first available model by name, otherwise nothing.
    pub async fn recover(&self) -> Option<Arc<ActiveModel>> {
        let mut candidates = Vec::new();
        if let Some(persisted) = self.load_selection().await {
            candidates.push(persisted);
        }
        match self.list_available().await {
            Ok(available) => {
                for id in available {
                    if !candidates.contains(&id) {
                        candidates.push(id);
                    }
                }
            }
            Err(err) => error!("Cannot list models in {}: {}", self.models_dir.display(), err),
        }

        for id in candidates {
            match self.activate(&id).await {
                Ok(model) => {
                    info!("Recovered active model {}", model.id);
                    return Some(model);
                }
                Err(err) => warn!("Skipping model {} at startup: {}", id, err),
            }
        }

        warn!(
            "No model could be activated; upload a .{} model to {}",
            self.extension,
            self.models_dir.display()
        );
        None
    }

    /// Copies a bundled default model into the models directory unless a file
    /// with the same name is already installed.
    pub async fn seed_default(&self, source: &Path) -> Result<bool, ModelError> {
        let Some(name) = source.file_name().and_then(|n| n.to_str()) else {
            return Ok(false);
        };
        let target = self.models_dir.join(name);
        if fs::metadata(&target).await.is_ok() {
            return Ok(false);
        }
        match fs::metadata(source).await {
            Ok(metadata) if metadata.is_file() => {}
            _ => {
                warn!("Default model {} does not exist", source.display());
                return Ok(false);
            }
        }
        fs::create_dir_all(&self.models_dir).await?;
        fs::copy(source, &target).await?;
        info!("Seeded default model {}", target.display());
        Ok(true)
    }

    fn has_model_extension(&self, name: &str) -> bool {
        naming::extension_of(name).is_some_and(|ext| ext == self.extension)
    }

    async fn load_selection(&self) -> Option<String> {
        let raw = match fs::read(&self.config_path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("Cannot read {}: {}", self.config_path.display(), err);
                return None;
            }
        };
        match serde_json::from_slice::<ActiveSelection>(&raw) {
            Ok(selection) => selection.active_model,
            Err(err) => {
                warn!("Ignoring malformed {}: {}", self.config_path.display(), err);
                None
            }
        }
    }

    async fn persist_selection(&self, model_id: &str) -> io::Result<()> {
        let selection = ActiveSelection {
            active_model: Some(model_id.to_string()),
        };
        let body = serde_json::to_vec_pretty(&selection).map_err(io::Error::other)?;

        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.config_path.with_extension("json.tmp");
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &self.config_path).await
    }
}
