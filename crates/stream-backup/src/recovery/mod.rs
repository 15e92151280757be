pub mod retry_manager;

pub use retry_manager::{with_retry, RetryPolicy};
