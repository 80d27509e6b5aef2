//! HTTP plumbing for registry access: a thin client with bounded retries
//! and transient-error classification.

mod client;
mod retry;

pub use client::HttpClient;
pub use retry::{MAX_RETRIES, NonRetryableError, RETRY_DELAY_MS, check_retryable};
