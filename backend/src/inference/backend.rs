use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_ARGS: [&str; 3] = ["{model}", "{image}", "{output}"];

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("model rejected: {0}")]
    Rejected(String),
    #[error("no inference program configured")]
    Unconfigured,
    #[error("{0}")]
    Failed(String),
    #[error("deadline passed before detection finished")]
    TimedOut,
}

/// A loaded model. Implementations write zero or more annotated images into
/// `output_dir`; they must not touch anything outside it, and must stop
/// writing once `deadline` has passed.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &Path, output_dir: &Path, deadline: Instant) -> Result<(), BackendError>;
}

pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<LoadedModel, BackendError>;
}

pub struct LoadedModel {
    pub detector: Arc<dyn Detector>,
    pub digest: String,
}

/// Runs detection through an external program, e.g. a YOLO CLI wrapper.
///
/// Arguments may contain `{model}`, `{image}` and `{output}` placeholders. The
/// program runs with the job directory as its working directory.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let args = if args.is_empty() {
            DEFAULT_ARGS.iter().map(|a| a.to_string()).collect()
        } else {
            args
        };
        Self {
            program: program.into(),
            args,
        }
    }
}

impl ModelLoader for CommandBackend {
    fn load(&self, path: &Path) -> Result<LoadedModel, BackendError> {
        if self.program.trim().is_empty() {
            return Err(BackendError::Unconfigured);
        }
        let bytes = std::fs::read(path)?;
        if bytes.is_empty() {
            return Err(BackendError::Rejected("model file is empty".into()));
        }
        let digest = hex::encode(Sha256::digest(&bytes));
        debug!("Read model {} ({} bytes, sha256 {})", path.display(), bytes.len(), digest);

        Ok(LoadedModel {
            detector: Arc::new(CommandDetector {
                program: self.program.clone(),
                args: self.args.clone(),
                model_path: path.to_path_buf(),
            }),
            digest,
        })
    }
}

struct CommandDetector {
    program: String,
    args: Vec<String>,
    model_path: PathBuf,
}

impl Detector for CommandDetector {
    fn detect(&self, image: &Path, output_dir: &Path, deadline: Instant) -> Result<(), BackendError> {
        let model = self.model_path.to_string_lossy();
        let image = image.to_string_lossy();
        let output = output_dir.to_string_lossy();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{model}", &model)
                    .replace("{image}", &image)
                    .replace("{output}", &output)
            })
            .collect();

        let mut child = Command::new(&self.program)
            .args(&args)
            .current_dir(output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drained off-thread so a chatty program cannot block on a full pipe.
        let stderr = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                if let Err(err) = child.kill() {
                    warn!("Failed to kill {} (pid {}): {}", self.program, child.id(), err);
                }
                if let Err(err) = child.wait() {
                    warn!("Failed to reap {} (pid {}): {}", self.program, child.id(), err);
                }
                return Err(BackendError::TimedOut);
            }
            std::thread::sleep(remaining.min(POLL_INTERVAL));
        };

        if status.success() {
            Ok(())
        } else {
            let stderr = stderr
                .and_then(|reader| reader.join().ok())
                .unwrap_or_default();
            Err(BackendError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                status,
                String::from_utf8_lossy(&stderr).trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[test]
    fn load_rejects_empty_model_files() {
        let temp = TempDir::new().unwrap();
        let model = temp.path().join("empty.pt");
        std::fs::write(&model, b"").unwrap();

        let backend = CommandBackend::new("true", Vec::new());
        assert!(matches!(backend.load(&model), Err(BackendError::Rejected(_))));
    }

    #[test]
    fn load_requires_a_program() {
        let temp = TempDir::new().unwrap();
        let model = temp.path().join("m.pt");
        std::fs::write(&model, b"weights").unwrap();

        let backend = CommandBackend::new("  ", Vec::new());
        assert!(matches!(backend.load(&model), Err(BackendError::Unconfigured)));
    }

    #[test]
    fn load_reports_missing_files() {
        let backend = CommandBackend::new("true", Vec::new());
        let err = backend.load(Path::new("/definitely/not/here.pt")).err().unwrap();
        assert!(matches!(err, BackendError::Io(_)));
    }

    #[test]
    fn load_computes_sha256_digest() {
        let temp = TempDir::new().unwrap();
        let model = temp.path().join("m.pt");
        std::fs::write(&model, b"abc").unwrap();

        let loaded = CommandBackend::new("true", Vec::new()).load(&model).unwrap();
        assert_eq!(
            loaded.digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[cfg(unix)]
    #[test]
    fn command_detector_writes_into_the_output_directory() {
        let temp = TempDir::new().unwrap();
        let model = temp.path().join("m.pt");
        std::fs::write(&model, b"weights").unwrap();
        let out = temp.path().join("job");
        std::fs::create_dir(&out).unwrap();
        let image = out.join("cat.jpg");
        std::fs::write(&image, b"pixels").unwrap();

        let backend = CommandBackend::new(
            "sh",
            vec![
                "-c".into(),
                "cp \"$1\" annotated.jpg".into(),
                "sh".into(),
                "{image}".into(),
            ],
        );
        let loaded = backend.load(&model).unwrap();
        loaded.detector.detect(&image, &out, soon()).unwrap();

        assert_eq!(std::fs::read(out.join("annotated.jpg")).unwrap(), b"pixels");
    }

    #[cfg(unix)]
    #[test]
    fn command_detector_surfaces_stderr_on_failure() {
        let temp = TempDir::new().unwrap();
        let model = temp.path().join("m.pt");
        std::fs::write(&model, b"weights").unwrap();

        let backend = CommandBackend::new(
            "sh",
            vec!["-c".into(), "echo 'bad weights' >&2; exit 3".into()],
        );
        let loaded = backend.load(&model).unwrap();
        let err = loaded
            .detector
            .detect(&temp.path().join("x.jpg"), temp.path(), soon())
            .unwrap_err();
        match err {
            BackendError::Failed(message) => assert!(message.contains("bad weights")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn command_detector_kills_the_program_at_the_deadline() {
        let temp = TempDir::new().unwrap();
        let model = temp.path().join("m.pt");
        std::fs::write(&model, b"weights").unwrap();

        let backend = CommandBackend::new("sh", vec!["-c".into(), "sleep 5".into()]);
        let loaded = backend.load(&model).unwrap();
        let started = Instant::now();
        let err = loaded
            .detector
            .detect(
                &temp.path().join("x.jpg"),
                temp.path(),
                Instant::now() + Duration::from_millis(200),
            )
            .unwrap_err();

        assert!(matches!(err, BackendError::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
