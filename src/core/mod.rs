mod errors;
mod orchestrator;
mod profile;
mod progress;
mod registrar;
mod scheduler;
mod store;
mod traits;
mod types;

pub use errors::{classify_status, ErrorClass, Result, TransferError, UploadError};
pub use orchestrator::{OrchestratorBuilder, UploadOrchestrator};
pub use profile::UploadProfile;
pub use progress::{
    ProgressAggregator,
    ProgressAggregatorHandle,
    ProgressReporter,
    ProgressUpdate,
    PROGRESS_THROTTLE,
};
pub use registrar::{BatchRegistrar, PhotoEntry, UploadConfirmation};
pub use store::{is_valid_transition, RecordStore, StoreReader};
pub use traits::{ConnectivityProbe, DestinationProvider, RegistryBackend, TransferExecutor};
pub use types::{
    guess_content_type,
    ByteSource,
    CommitReport,
    ContainerId,
    ContainerTarget,
    Destination,
    FileHandle,
    RegistrationOutcome,
    StatusCounts,
    UploadBatch,
    UploadEvent,
    UploadId,
    UploadRecord,
    UploadResults,
    UploadSession,
    UploadStatus,
};

#[cfg(test)]
mod tests;
