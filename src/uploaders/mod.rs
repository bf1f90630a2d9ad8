pub mod api;
pub mod presign;
pub mod progress_stream;
pub mod registry;
pub mod transfer;

pub use api::BackendClient;
pub use presign::PresignedUrlBatchClient;
pub use progress_stream::ProgressStream;
pub use registry::HttpRegistry;
pub use transfer::HttpTransferExecutor;
