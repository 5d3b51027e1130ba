use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use shared::{ErrorKind, UploadedImage};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::naming::{self, SafeName};

const MAX_NAME_ATTEMPTS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("file type not allowed: {0}")]
    InvalidExtension(String),
    #[error("upload not found: {0}")]
    NotFound(String),
    #[error("could not allocate a unique name for {0}")]
    NamesExhausted(String),
    #[error("workspace I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WorkspaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkspaceError::InvalidExtension(_) => ErrorKind::InvalidExtension,
            WorkspaceError::NotFound(_) => ErrorKind::NotFound,
            WorkspaceError::NamesExhausted(_) | WorkspaceError::Io(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetSummary {
    pub removed: usize,
    pub failed: usize,
}

/// Staging directory for images a user uploaded and may run detection on.
///
/// Every stored name is unique within the directory: files are created with
/// exclusive-create semantics, so a colliding name is disambiguated instead of
/// overwritten.
#[derive(Debug)]
pub struct UploadWorkspace {
    root: PathBuf,
    originals: Mutex<HashMap<String, String>>,
}

impl UploadWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            originals: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn store(
        &self,
        original_name: &str,
        bytes: &[u8],
    ) -> Result<UploadedImage, WorkspaceError> {
        let safe = SafeName::from_client(original_name);
        if !naming::is_image_extension(&safe.ext) {
            return Err(WorkspaceError::InvalidExtension(original_name.to_string()));
        }

        fs::create_dir_all(&self.root).await?;

        let mut candidate = safe.file_name();
        for _ in 0..MAX_NAME_ATTEMPTS {
            let path = self.root.join(&candidate);
            let file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;

            match file {
                Ok(mut file) => {
                    let written = async {
                        file.write_all(bytes).await?;
                        file.flush().await
                    }
                    .await;
                    if let Err(err) = written {
                        drop(file);
                        if let Err(cleanup) = fs::remove_file(&path).await {
                            warn!("Failed to remove partial upload {}: {}", path.display(), cleanup);
                        }
                        return Err(err.into());
                    }

                    self.originals
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(candidate.clone(), original_name.to_string());

                    info!(
                        "Stored upload '{}' as {} ({} bytes)",
                        original_name,
                        candidate,
                        bytes.len()
                    );
                    return Ok(UploadedImage {
                        original_name: original_name.to_string(),
                        size_bytes: bytes.len() as u64,
                        mime_ext: safe.ext.to_ascii_lowercase(),
                        mime_type: naming::mime_type_for(&safe.ext).to_string(),
                        stored_name: candidate,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("Upload name {} taken, retrying with a suffix", candidate);
                    candidate = safe.with_suffix(&naming::random_suffix());
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(WorkspaceError::NamesExhausted(original_name.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<UploadedImage>, WorkspaceError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let originals = self
            .originals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut images = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !naming::is_image_name(&name) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                // Deleted between read_dir and stat.
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let ext = naming::extension_of(&name).unwrap_or_default();
            images.push(UploadedImage {
                original_name: originals.get(&name).cloned().unwrap_or_else(|| name.clone()),
                size_bytes: metadata.len(),
                mime_type: naming::mime_type_for(&ext).to_string(),
                mime_ext: ext,
                stored_name: name,
            });
        }

        images.sort_by(|a, b| a.stored_name.cmp(&b.stored_name));
        Ok(images)
    }

    pub async fn resolve(&self, stored_name: &str) -> Result<PathBuf, WorkspaceError> {
        if !naming::is_plain_component(stored_name) || !naming::is_image_name(stored_name) {
            return Err(WorkspaceError::NotFound(stored_name.to_string()));
        }
        let path = self.root.join(stored_name);
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(path),
            Ok(_) => Err(WorkspaceError::NotFound(stored_name.to_string())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(WorkspaceError::NotFound(stored_name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Removes every entry. Individual failures are logged and counted, never
    /// returned, so one stuck file cannot block the rest of the cleanup.
    pub async fn reset(&self) -> ResetSummary {
        let mut summary = ResetSummary::default();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return summary,
            Err(err) => {
                warn!("Cannot read workspace {}: {}", self.root.display(), err);
                summary.failed += 1;
                return summary;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!("Stopped listing workspace {}: {}", self.root.display(), err);
                    summary.failed += 1;
                    break;
                }
            };

            let path = entry.path();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let removed = if is_dir {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };

            match removed {
                Ok(()) => {
                    summary.removed += 1;
                    if let Ok(name) = entry.file_name().into_string() {
                        self.originals
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&name);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!("Failed to remove {} during reset: {}", path.display(), err);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Workspace {} reset: {} removed, {} failed",
            self.root.display(),
            summary.removed,
            summary.failed
        );
        summary
    }
}

/// One [`UploadWorkspace`] per user, rooted under a shared uploads directory.
#[derive(Debug)]
pub struct Workspaces {
    root: PathBuf,
    open: Mutex<HashMap<String, Arc<UploadWorkspace>>>,
}

impl Workspaces {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_user(&self, user_id: &str) -> Arc<UploadWorkspace> {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        open.entry(user_id.to_string())
            .or_insert_with(|| Arc::new(UploadWorkspace::new(self.root.join(Self::dir_name(user_id)))))
            .clone()
    }

    // Cleaning alone could map two ids onto one directory, so a digest prefix
    // keeps them apart.
    fn dir_name(user_id: &str) -> String {
        let mut readable = naming::clean_segment(user_id).replace('.', "_");
        readable.truncate(32);
        if readable.is_empty() {
            readable.push_str("user");
        }
        let digest = hex::encode(Sha256::digest(user_id.as_bytes()));
        format!("{}-{}", readable, &digest[..8])
    }
}
