//! Failure classification, per-key exponential backoff, and circuit breaking.

// crates.io
use rand::Rng;
// self
use crate::{_prelude::*, config::CircuitBreakerConfig, model::Endpoint};

const BACKOFF_BASE: Duration = Duration::from_millis(1_000);
const BACKOFF_MAX: Duration = Duration::from_millis(30_000);
const BACKOFF_JITTER: f64 = 0.1;

/// Broad failure category, independent of severity or retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
	/// Connection-level failure (refused, reset, DNS).
	Network,
	/// Request exceeded its timeout.
	Timeout,
	/// A 5xx response.
	ServerError,
	/// A 4xx response.
	ClientError,
	/// The request was cancelled before completion.
	Abort,
	/// A failure that didn't fit any other category.
	Unknown,
}

/// Severity assigned to a classified failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
	/// Expected, routine.
	Low,
	/// Notable but not circuit-worthy.
	Medium,
	/// Circuit-worthy.
	High,
	/// Unrecoverable for the current cycle.
	Critical,
}

/// Outcome of classifying a single failure: its kind, severity, and the two
/// policy bits that drive the rest of the resilience layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classification {
	/// Broad failure category.
	pub kind: FailureKind,
	/// Assigned severity.
	pub severity: Severity,
	/// Whether the caller should retry this request.
	pub retryable: bool,
	/// Whether this failure counts toward the circuit breaker's threshold.
	pub opens_circuit: bool,
}
impl Classification {
	const ABORT: Self =
		Self { kind: FailureKind::Abort, severity: Severity::Low, retryable: false, opens_circuit: false };

	/// Classify an [`crate::Error`] observed while fetching an endpoint.
	///
	/// `aborted` must be set when the failure originated from cancellation rather than
	/// from the transport itself — aborts are never retried and never count against a
	/// circuit, matching the "abort is never reported, never counted" propagation rule.
	pub fn classify(error: &Error, aborted: bool) -> Self {
		if aborted {
			return Self::ABORT;
		}

		match error {
			Error::Reqwest(err) if err.is_timeout() => Self {
				kind: FailureKind::Timeout,
				severity: Severity::Medium,
				retryable: true,
				opens_circuit: false,
			},
			Error::Reqwest(err) if err.is_connect() || err.is_request() => Self {
				kind: FailureKind::Network,
				severity: Severity::High,
				retryable: true,
				opens_circuit: true,
			},
			Error::HttpStatus { status, .. } if status.is_server_error() => Self {
				kind: FailureKind::ServerError,
				severity: Severity::High,
				retryable: true,
				opens_circuit: true,
			},
			Error::HttpStatus { status, .. } if status.as_u16() == 429 => Self {
				kind: FailureKind::ClientError,
				severity: Severity::High,
				retryable: true,
				opens_circuit: false,
			},
			Error::HttpStatus { .. } => Self {
				kind: FailureKind::ClientError,
				severity: Severity::Medium,
				retryable: false,
				opens_circuit: false,
			},
			_ => Self {
				kind: FailureKind::Unknown,
				severity: Severity::Medium,
				retryable: false,
				opens_circuit: false,
			},
		}
	}
}

/// Compute the backoff delay for a given attempt count (0-indexed), following
/// `base * 2^attempt` capped at `max`, then widened by symmetric jitter.
pub fn backoff_for_attempt(attempt: u32) -> Duration {
	let exponent = attempt.min(16);
	let exponential = BACKOFF_BASE.mul_f64(2f64.powi(exponent as i32));
	let capped = exponential.min(BACKOFF_MAX);

	apply_jitter(capped)
}

fn apply_jitter(delay: Duration) -> Duration {
	let jitter = delay.mul_f64(BACKOFF_JITTER);
	let lower = delay.saturating_sub(jitter);
	let upper = delay + jitter;

	if upper <= lower {
		return delay;
	}

	let span = (upper - lower).as_nanos();
	let offset = rand::rng().random_range(0..=span.min(u64::MAX as u128) as u64);

	lower + Duration::from_nanos(offset)
}

/// Circuit breaker lifecycle state for a single `(race, endpoint)` key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
	/// Requests pass through normally.
	Closed,
	/// Requests are rejected and served from cache until `reset` elapses.
	Open,
	/// One trial request is allowed through to test recovery.
	HalfOpen,
}

/// Per-key circuit breaker, threaded through every [`Classification`] the
/// corresponding fetcher observes.
///
/// Threshold comparison is `>=` on the post-increment failure count: the circuit
/// opens on the failure that brings `consecutive_failures` to `threshold`, not on
/// the one after it.
#[derive(Debug)]
pub struct CircuitBreaker {
	config: CircuitBreakerConfig,
	state: CircuitState,
	consecutive_failures: u32,
	opened_at: Option<Instant>,
}
impl CircuitBreaker {
	/// Construct a closed breaker under the given configuration.
	pub fn new(config: CircuitBreakerConfig) -> Self {
		Self { config, state: CircuitState::Closed, consecutive_failures: 0, opened_at: None }
	}

	/// Current lifecycle state.
	pub fn state(&self) -> CircuitState {
		self.state
	}

	/// Whether a request should be gated off and served from cache instead.
	///
	/// Transitions `open -> half_open` as a side effect once `reset` has elapsed.
	pub fn should_reject(&mut self, now: Instant) -> bool {
		match self.state {
			CircuitState::Closed | CircuitState::HalfOpen => false,
			CircuitState::Open => {
				let due = self.opened_at.map(|at| now.saturating_duration_since(at) >= self.config.reset).unwrap_or(false);

				if due {
					tracing::debug!("circuit probing half-open");
					self.state = CircuitState::HalfOpen;
					false
				} else {
					true
				}
			},
		}
	}

	/// Record a success, resetting the breaker to `closed`.
	pub fn record_success(&mut self) {
		self.consecutive_failures = 0;
		self.state = CircuitState::Closed;
		self.opened_at = None;
	}

	/// Record a circuit-opening failure, possibly tripping or re-tripping the breaker.
	pub fn record_failure(&mut self, now: Instant) {
		match self.state {
			CircuitState::HalfOpen => {
				self.trip(now);
			},
			CircuitState::Closed => {
				self.consecutive_failures += 1;

				if self.consecutive_failures >= self.config.threshold {
					self.trip(now);
				}
			},
			CircuitState::Open => {},
		}
	}

	fn trip(&mut self, now: Instant) {
		tracing::warn!(failures = self.consecutive_failures, "circuit opening");
		self.state = CircuitState::Open;
		self.opened_at = Some(now);
	}

	/// Number of consecutive circuit-opening failures observed since the last success.
	pub fn consecutive_failures(&self) -> u32 {
		self.consecutive_failures
	}
}

/// Registry of per-`(race, endpoint)` circuit breakers.
#[derive(Debug, Default)]
pub struct ErrorHandler {
	config: CircuitBreakerConfig,
	breakers: std::collections::HashMap<(String, Endpoint), CircuitBreaker>,
}
impl ErrorHandler {
	/// Construct an empty registry under the given configuration.
	pub fn new(config: CircuitBreakerConfig) -> Self {
		Self { config, breakers: std::collections::HashMap::new() }
	}

	/// Borrow (creating if absent) the breaker for a key.
	pub fn breaker(&mut self, race_id: &str, endpoint: Endpoint) -> &mut CircuitBreaker {
		self.breakers
			.entry((race_id.to_string(), endpoint))
			.or_insert_with(|| CircuitBreaker::new(self.config.clone()))
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn config() -> CircuitBreakerConfig {
		CircuitBreakerConfig { threshold: 5, reset: Duration::from_secs(60) }
	}

	#[test]
	fn opens_on_the_failure_that_reaches_threshold() {
		let mut breaker = CircuitBreaker::new(config());
		let now = Instant::now();

		for _ in 0..4 {
			breaker.record_failure(now);
			assert_eq!(breaker.state(), CircuitState::Closed);
		}

		breaker.record_failure(now);

		assert_eq!(breaker.state(), CircuitState::Open);
	}

	#[test]
	fn half_open_failure_reopens_with_extended_deadline() {
		let mut breaker = CircuitBreaker::new(config());
		let now = Instant::now();

		for _ in 0..5 {
			breaker.record_failure(now);
		}

		assert!(!breaker.should_reject(now + Duration::from_secs(61)));
		assert_eq!(breaker.state(), CircuitState::HalfOpen);

		breaker.record_failure(now + Duration::from_secs(61));

		assert_eq!(breaker.state(), CircuitState::Open);
		assert!(breaker.should_reject(now + Duration::from_secs(61)));
	}

	#[test]
	fn half_open_success_closes_and_resets_failures() {
		let mut breaker = CircuitBreaker::new(config());
		let now = Instant::now();

		for _ in 0..5 {
			breaker.record_failure(now);
		}

		breaker.should_reject(now + Duration::from_secs(61));
		breaker.record_success();

		assert_eq!(breaker.state(), CircuitState::Closed);
		assert_eq!(breaker.consecutive_failures(), 0);
	}

	#[test]
	fn backoff_grows_exponentially_within_jitter_bounds() {
		for attempt in 0..6 {
			let delay = backoff_for_attempt(attempt);
			let expected = BACKOFF_BASE.mul_f64(2f64.powi(attempt as i32)).min(BACKOFF_MAX);
			let jitter = expected.mul_f64(BACKOFF_JITTER);

			assert!(delay >= expected.saturating_sub(jitter));
			assert!(delay <= expected + jitter);
		}
	}

	#[test]
	fn classify_maps_429_to_retryable_without_circuit() {
		let error = Error::HttpStatus {
			status: http::StatusCode::TOO_MANY_REQUESTS,
			url: "https://example.com".parse().unwrap(),
			body: None,
		};
		let classification = Classification::classify(&error, false);

		assert!(classification.retryable);
		assert!(!classification.opens_circuit);
		assert_eq!(classification.severity, Severity::High);
	}

	#[test]
	fn classify_maps_other_4xx_to_non_retryable() {
		let error = Error::HttpStatus {
			status: http::StatusCode::NOT_FOUND,
			url: "https://example.com".parse().unwrap(),
			body: None,
		};
		let classification = Classification::classify(&error, false);

		assert!(!classification.retryable);
		assert!(!classification.opens_circuit);
	}

	#[test]
	fn classify_treats_abort_as_non_retryable_non_circuit() {
		let error = Error::Cache("ignored".into());
		let classification = Classification::classify(&error, true);

		assert_eq!(classification, Classification::ABORT);
	}
}
