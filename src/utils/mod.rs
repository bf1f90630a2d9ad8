pub mod progress;
pub mod retry;

pub use progress::{format_bytes, format_duration, SpeedCalculator};
pub use retry::{RetryCoordinator, RetryDecision, RetryPolicy};
