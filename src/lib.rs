//! Client-side polling coordinator for multi-endpoint race data: cadence-based
//! scheduling, per-endpoint caching with conditional requests, circuit breaking,
//! rate limiting, and snapshot reconciliation for subscriber dispatch.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error_handler;
pub mod http;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod rate_limiter;
pub mod registry;
pub mod scheduler;
pub mod snapshot;

mod error;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use chrono::{DateTime, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}
#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
pub use crate::{
	coordinator::{Coordinator, CycleReport},
	error::{Error, Result},
	lifecycle::{LifecycleController, LifecycleState, Subscriber},
	registry::Registry,
};
