pub mod backend;
pub mod registry;
pub mod runner;

#[cfg(test)]
pub mod testing;

pub use backend::{CommandBackend, ModelLoader};
pub use registry::{ModelError, ModelRegistry};
pub use runner::{DetectionRunner, JobError};
