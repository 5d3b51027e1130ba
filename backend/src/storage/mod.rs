pub mod artifacts;
pub mod naming;
pub mod workspace;

pub use artifacts::{ArtifactError, ArtifactStore, JobDirectory};
pub use workspace::{UploadWorkspace, WorkspaceError, Workspaces};
