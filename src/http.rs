//! HTTP transport and endpoint fetch orchestration.

pub mod client;
pub mod fetch;

pub use fetch::{FetchOutcome, Fetcher};
