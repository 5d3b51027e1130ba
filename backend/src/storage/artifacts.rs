use chrono::Local;
use log::{debug, info};
use shared::{ErrorKind, JobId};
use std::collections::BTreeSet;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use super::naming;

pub const RESULTS_URL_PREFIX: &str = "/results";

const MAX_DIR_ATTEMPTS: usize = 16;
const MAX_DISCRIMINATOR_LEN: usize = 40;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("result not found: {0}")]
    NotFound(String),
    #[error("path escapes the results directory: {0}")]
    PathEscape(String),
    #[error("could not allocate a unique job directory")]
    DirectoriesExhausted,
    #[error("artifact store I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ArtifactError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArtifactError::NotFound(_) => ErrorKind::NotFound,
            ArtifactError::PathEscape(_) => ErrorKind::PathEscape,
            ArtifactError::DirectoriesExhausted | ArtifactError::Io(_) => ErrorKind::Internal,
        }
    }
}

/// A directory owned by exactly one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDirectory {
    pub name: String,
    pub path: PathBuf,
}

/// Results tree. Each job gets its own subdirectory, created exclusively, so
/// concurrent jobs never write into the same place.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn new_job_directory(
        &self,
        job_id: &JobId,
        discriminator: &str,
    ) -> Result<JobDirectory, ArtifactError> {
        fs::create_dir_all(&self.root).await?;

        let mut label = naming::clean_segment(discriminator).replace('.', "_");
        label.truncate(MAX_DISCRIMINATOR_LEN);
        if label.is_empty() {
            label.push_str("input");
        }

        for _ in 0..MAX_DIR_ATTEMPTS {
            let name = format!(
                "{}_{}_{}_{}",
                Local::now().format("%Y%m%d_%H%M%S_%3f"),
                job_id.short(),
                label,
                naming::random_suffix()
            );
            let path = self.root.join(&name);
            // create_dir (not create_dir_all) fails on an existing directory,
            // which is what makes the allocation exclusive.
            match fs::create_dir(&path).await {
                Ok(()) => {
                    debug!("Allocated job directory {}", path.display());
                    return Ok(JobDirectory { name, path });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Err(ArtifactError::DirectoriesExhausted)
    }

    /// File names currently present in a job directory.
    pub async fn snapshot(&self, dir: &JobDirectory) -> Result<BTreeSet<String>, ArtifactError> {
        let mut names = BTreeSet::new();
        let mut entries = fs::read_dir(&dir.path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(name) = entry.file_name().into_string() {
                names.insert(name);
            }
        }
        Ok(names)
    }

    /// URLs of the image files that appeared in `dir` since `before` was taken,
    /// in name order.
    pub async fn record(
        &self,
        dir: &JobDirectory,
        before: &BTreeSet<String>,
    ) -> Result<Vec<String>, ArtifactError> {
        let after = self.snapshot(dir).await?;
        let mut urls = Vec::new();
        for name in after.difference(before) {
            if !naming::is_image_name(name) {
                continue;
            }
            match fs::metadata(dir.path.join(name)).await {
                Ok(metadata) if metadata.is_file() => urls.push(self.url_for(&dir.name, name)),
                _ => continue,
            }
        }
        info!("Recorded {} result file(s) in {}", urls.len(), dir.name);
        Ok(urls)
    }

    pub fn url_for(&self, dir_name: &str, file_name: &str) -> String {
        format!(
            "{}/{}/{}",
            RESULTS_URL_PREFIX,
            urlencoding::encode(dir_name),
            urlencoding::encode(file_name)
        )
    }

    pub fn dir_url(&self, dir: &JobDirectory) -> String {
        format!("{}/{}", RESULTS_URL_PREFIX, urlencoding::encode(&dir.name))
    }

    /// Maps a results URL (with or without the `/results/` prefix) to a file
    /// inside the results root.
    pub async fn resolve_for_serving(&self, relative_url: &str) -> Result<PathBuf, ArtifactError> {
        let trimmed = relative_url.trim_start_matches('/');
        let trimmed = match trimmed.strip_prefix(RESULTS_URL_PREFIX.trim_start_matches('/')) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
            _ => trimmed,
        };
        let decoded = urlencoding::decode(trimmed)
            .map_err(|_| ArtifactError::NotFound(relative_url.to_string()))?;

        let mut relative = PathBuf::new();
        for component in Path::new(decoded.as_ref()).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(ArtifactError::PathEscape(relative_url.to_string()));
                }
            }
        }
        if relative.as_os_str().is_empty() {
            return Err(ArtifactError::NotFound(relative_url.to_string()));
        }

        let resolved = match fs::canonicalize(self.root.join(&relative)).await {
            Ok(path) => path,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound(relative_url.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        // Symlinks inside the tree may still point elsewhere.
        let root = fs::canonicalize(&self.root).await?;
        if !resolved.starts_with(&root) {
            return Err(ArtifactError::PathEscape(relative_url.to_string()));
        }

        match fs::metadata(&resolved).await {
            Ok(metadata) if metadata.is_file() => Ok(resolved),
            _ => Err(ArtifactError::NotFound(relative_url.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store() -> (ArtifactStore, TempDir) {
        let temp = TempDir::new().unwrap();
        (ArtifactStore::new(temp.path().join("results")), temp)
    }

    #[tokio::test]
    async fn job_directory_name_carries_job_and_label() {
        let (store, _temp) = store();
        let job = JobId::new();
        let dir = store.new_job_directory(&job, "cat.jpg").await.unwrap();

        assert!(dir.path.is_dir());
        assert!(dir.path.starts_with(store.root()));
        assert!(dir.name.contains(&job.short()));
        assert!(dir.name.contains("cat_jpg"));
    }

    #[tokio::test]
    async fn same_job_and_label_never_share_a_directory() {
        let (store, _temp) = store();
        let store = Arc::new(store);
        let job = JobId::new();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.new_job_directory(&job, "same").await.unwrap().path
            }));
        }
        let mut paths = HashSet::new();
        for handle in handles {
            assert!(paths.insert(handle.await.unwrap()));
        }
        assert_eq!(paths.len(), 32);
    }

    #[tokio::test]
    async fn record_only_reports_new_images() {
        let (store, _temp) = store();
        let dir = store.new_job_directory(&JobId::new(), "dog").await.unwrap();
        std::fs::write(dir.path.join("dog.png"), b"source").unwrap();
        let before = store.snapshot(&dir).await.unwrap();

        std::fs::write(dir.path.join("z_pred.jpg"), b"pred").unwrap();
        std::fs::write(dir.path.join("a_pred.png"), b"pred").unwrap();
        std::fs::write(dir.path.join("labels.txt"), b"0 0.5 0.5 1 1").unwrap();
        std::fs::create_dir(dir.path.join("crops.jpg")).unwrap();

        let urls = store.record(&dir, &before).await.unwrap();
        assert_eq!(
            urls,
            vec![
                format!("/results/{}/a_pred.png", dir.name),
                format!("/results/{}/z_pred.jpg", dir.name),
            ]
        );
    }

    #[tokio::test]
    async fn resolve_accepts_recorded_urls() {
        let (store, _temp) = store();
        let dir = store.new_job_directory(&JobId::new(), "cat").await.unwrap();
        std::fs::write(dir.path.join("cat.jpg"), b"annotated").unwrap();

        let url = store.url_for(&dir.name, "cat.jpg");
        let path = store.resolve_for_serving(&url).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"annotated");

        let bare = format!("{}/cat.jpg", dir.name);
        assert_eq!(store.resolve_for_serving(&bare).await.unwrap(), path);
    }

    #[tokio::test]
    async fn resolve_rejects_traversal() {
        let (store, _temp) = store();
        std::fs::create_dir_all(store.root()).unwrap();

        for url in [
            "../../etc/passwd",
            "/results/../../etc/passwd",
            "job/../../secret.jpg",
            "%2e%2e/%2e%2e/etc/passwd",
        ] {
            let err = store.resolve_for_serving(url).await.unwrap_err();
            assert!(matches!(err, ArtifactError::PathEscape(_)), "{url}");
            assert_eq!(err.kind(), ErrorKind::PathEscape);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_rejects_symlinks_out_of_the_tree() {
        let (store, temp) = store();
        let dir = store.new_job_directory(&JobId::new(), "x").await.unwrap();
        let outside = temp.path().join("outside.jpg");
        std::fs::write(&outside, b"secret").unwrap();
        std::os::unix::fs::symlink(&outside, dir.path.join("link.jpg")).unwrap();

        let err = store
            .resolve_for_serving(&format!("{}/link.jpg", dir.name))
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::PathEscape(_)));
    }

    #[tokio::test]
    async fn resolve_reports_missing_files_and_directories() {
        let (store, _temp) = store();
        let dir = store.new_job_directory(&JobId::new(), "x").await.unwrap();

        let missing = store
            .resolve_for_serving(&format!("/results/{}/nope.jpg", dir.name))
            .await
            .unwrap_err();
        assert!(matches!(missing, ArtifactError::NotFound(_)));

        let directory = store.resolve_for_serving(&dir.name).await.unwrap_err();
        assert!(matches!(directory, ArtifactError::NotFound(_)));

        let empty = store.resolve_for_serving("/results/").await.unwrap_err();
        assert!(matches!(empty, ArtifactError::NotFound(_)));
    }
}
