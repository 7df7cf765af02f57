//! Polling configuration, mirroring the enumerated fields in the external interface.

// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// Top-level configuration for the polling coordinator.
///
/// Every field is optional in source configuration (TOML/JSON) via `serde(default)`
/// and carries the documented default.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
	/// Master switch; registering a race while disabled is a no-op.
	pub enabled: bool,
	/// Enables verbose per-cycle tracing.
	pub debug_mode: bool,
	/// Per-request HTTP timeout.
	pub request_timeout: Duration,
	/// Maximum consecutive retries tracked for connection-health reporting.
	pub max_retries: u32,
	/// Interval multiplier applied while a race is backgrounded.
	pub background_multiplier: f64,
	/// Per-endpoint cache tuning.
	pub cache: CacheConfig,
	/// Request rate limiting.
	pub rate_limiter: RateLimiterConfig,
	/// Circuit breaker tuning.
	pub circuit_breaker: CircuitBreakerConfig,
	/// Interval adjustment tuning.
	pub scheduler: SchedulerConfig,
	/// Background-inactivity pause tuning.
	pub inactivity: InactivityConfig,
}
impl Default for PollingConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			debug_mode: false,
			request_timeout: Duration::from_millis(30_000),
			max_retries: 5,
			background_multiplier: 2.0,
			cache: CacheConfig::default(),
			rate_limiter: RateLimiterConfig::default(),
			circuit_breaker: CircuitBreakerConfig::default(),
			scheduler: SchedulerConfig::default(),
			inactivity: InactivityConfig::default(),
		}
	}
}
impl PollingConfig {
	/// Validate invariants for the configuration, returning the first violation found.
	pub fn validate(&self) -> Result<()> {
		if self.request_timeout < Duration::from_millis(1_000) {
			return Err(Error::Validation {
				field: "polling.request_timeout_ms",
				reason: "Must be at least 1000 ms.".into(),
			});
		}
		if self.max_retries < 1 {
			return Err(Error::Validation {
				field: "polling.max_retries",
				reason: "Must be at least 1.".into(),
			});
		}
		if self.background_multiplier < 1.0 {
			return Err(Error::Validation {
				field: "polling.background_multiplier",
				reason: "Must be greater than or equal to 1.0.".into(),
			});
		}
		self.scheduler.validate()?;

		Ok(())
	}
}

/// `cache.*` configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
	/// Maximum entries held per endpoint cache before LRU eviction.
	pub max_size: usize,
	/// Age past which a cached entry is considered stale but still usable.
	pub stale_threshold: Duration,
	/// Age past which a cached entry is no longer an acceptable fallback.
	pub critical_threshold: Duration,
}
impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			max_size: 50,
			stale_threshold: Duration::from_millis(60_000),
			critical_threshold: Duration::from_millis(600_000),
		}
	}
}

/// `rateLimiter.*` configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
	/// Sliding window width.
	pub window: Duration,
	/// Maximum requests allowed per `(race, endpoint)` within `window`.
	pub max_requests_per_window: u32,
}
impl Default for RateLimiterConfig {
	fn default() -> Self {
		Self { window: Duration::from_millis(60_000), max_requests_per_window: 24 }
	}
}

/// `circuitBreaker.*` configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
	/// Consecutive failures before the circuit opens.
	pub threshold: u32,
	/// How long the circuit stays open before allowing a trial request.
	pub reset: Duration,
}
impl Default for CircuitBreakerConfig {
	fn default() -> Self {
		Self { threshold: 5, reset: Duration::from_millis(60_000) }
	}
}

/// `scheduler.*` configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
	/// Floor below which the adjusted interval is never reduced.
	pub min_interval: Duration,
	/// Fractional jitter applied to the target interval, e.g. `0.12` for ±12%.
	pub jitter: f64,
	/// Average latency above which the interval is degraded.
	pub slow_response_threshold: Duration,
	/// Maximum multiplier applied when degrading for slow responses.
	pub max_degrade_multiplier: f64,
}
impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			min_interval: Duration::from_millis(5_000),
			jitter: 0.12,
			slow_response_threshold: Duration::from_millis(2_500),
			max_degrade_multiplier: 2.0,
		}
	}
}
impl SchedulerConfig {
	fn validate(&self) -> Result<()> {
		if !(0.0..=1.0).contains(&self.jitter) {
			return Err(Error::Validation {
				field: "scheduler.jitter",
				reason: "Must be between 0.0 and 1.0.".into(),
			});
		}
		if self.max_degrade_multiplier < 1.0 {
			return Err(Error::Validation {
				field: "scheduler.max_degrade_multiplier",
				reason: "Must be greater than or equal to 1.0.".into(),
			});
		}

		Ok(())
	}
}

/// `inactivity.*` configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InactivityConfig {
	/// How long a race must stay backgrounded before the lifecycle controller pauses it.
	pub pause_after: Duration,
}
impl Default for InactivityConfig {
	fn default() -> Self {
		Self { pause_after: Duration::from_millis(300_000) }
	}
}
