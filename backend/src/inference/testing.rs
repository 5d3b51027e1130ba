//! Deterministic stand-ins for the detection backend.
//!
//! The fake detector looks at the input it is given: content starting with
//! `fail` errors, `sleep` blocks for a while (or until the deadline, which it
//! then reports as a timeout), and inputs whose name contains
//! `cat` (or whose content contains `box`) produce one annotated image.

use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use super::backend::{BackendError, Detector, LoadedModel, ModelLoader};

pub const SLEEP_FOR: Duration = Duration::from_millis(400);

/// Lets a test observe a detection starting and decide when it may finish.
pub struct Gate {
    started: UnboundedSender<String>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl Gate {
    pub fn channel() -> (Arc<Gate>, UnboundedReceiver<String>, mpsc::Sender<()>) {
        let (started_tx, started_rx) = unbounded_channel();
        let (release_tx, release_rx) = mpsc::channel();
        let gate = Arc::new(Gate {
            started: started_tx,
            release: Mutex::new(release_rx),
        });
        (gate, started_rx, release_tx)
    }

    fn pass(&self, input: &str) {
        let _ = self.started.send(input.to_string());
        let _ = self.release.lock().unwrap().recv();
    }
}

#[derive(Default)]
pub struct FakeLoader {
    gate: Option<Arc<Gate>>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated(gate: Arc<Gate>) -> Self {
        Self { gate: Some(gate) }
    }
}

impl ModelLoader for FakeLoader {
    fn load(&self, path: &Path) -> Result<LoadedModel, BackendError> {
        let bytes = std::fs::read(path)?;
        if bytes == b"corrupt" {
            return Err(BackendError::Rejected("unreadable weights".into()));
        }
        Ok(LoadedModel {
            detector: Arc::new(FakeDetector {
                tag: String::from_utf8_lossy(&bytes).into_owned(),
                gate: self.gate.clone(),
            }),
            digest: format!("fake-{}", bytes.len()),
        })
    }
}

pub struct FakeDetector {
    tag: String,
    gate: Option<Arc<Gate>>,
}

impl Detector for FakeDetector {
    fn detect(&self, image: &Path, output_dir: &Path, deadline: Instant) -> Result<(), BackendError> {
        let name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(gate) = &self.gate {
            gate.pass(&name);
        }

        let content = std::fs::read(image)?;
        if content.starts_with(b"fail") {
            return Err(BackendError::Failed(format!("cannot decode {name}")));
        }
        if content.starts_with(b"sleep") {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining < SLEEP_FOR {
                std::thread::sleep(remaining);
                return Err(BackendError::TimedOut);
            }
            std::thread::sleep(SLEEP_FOR);
        }

        let stem = image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let found = stem.contains("cat") || content.windows(3).any(|w| w == b"box");
        if found {
            std::fs::write(output_dir.join(format!("{stem}_pred.jpg")), self.tag.as_bytes())?;
            std::fs::write(output_dir.join("labels.txt"), b"15 0.5 0.5 0.2 0.2")?;
        }
        Ok(())
    }
}
