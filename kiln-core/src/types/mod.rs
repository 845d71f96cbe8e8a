pub mod artifact;
pub mod events;
pub mod ids;
pub mod job;

pub use artifact::{
    Artifact, ArtifactKind, ArtifactLocation, ArtifactRef, FileDescriptor,
    ProbedMetadata, StorageHints, StorageTier,
};
pub use events::JobEvent;
pub use ids::{ArtifactId, JobId, OwnerId, SessionId};
pub use job::{GenerationJob, JobCategory, JobPatch, JobStatus};
