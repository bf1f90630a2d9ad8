pub mod config;
pub mod core;
pub mod ingest;
pub mod logging;
pub mod network;
pub mod uploaders;
pub mod utils;

// 重新导出核心类型
pub use crate::core::{
    ContainerId,
    ContainerTarget,
    ErrorClass,
    FileHandle,
    OrchestratorBuilder,
    Result,
    StatusCounts,
    TransferError,
    UploadBatch,
    UploadError,
    UploadEvent,
    UploadId,
    UploadOrchestrator,
    UploadProfile,
    UploadRecord,
    UploadResults,
    UploadSession,
    UploadStatus,
};

pub use config::Config;
pub use ingest::FileIngestQueue;
pub use network::{Connectivity, HttpProbe, NetworkMonitor};

#[cfg(test)]
mod tests;
