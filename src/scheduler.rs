//! Cadence table lookup and interval adjustment pipeline.

// crates.io
use rand::Rng;
// self
use crate::{_prelude::*, config::SchedulerConfig, metrics::Compliance, model::RaceStatus};

/// Abstracts wall-clock time so the scheduler's tick loop can be driven by a
/// deterministic clock under test instead of real sleeps.
pub trait Clock: Send + Sync {
	/// The current instant.
	fn now(&self) -> Instant;
}

/// Production clock backed by [`tokio::time::Instant`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;
impl Clock for SystemClock {
	fn now(&self) -> Instant {
		Instant::now()
	}
}

/// Deterministic clock for tests: `now()` returns whatever was last set.
#[cfg(test)]
#[derive(Debug)]
pub struct TestClock(std::sync::Mutex<Instant>);
#[cfg(test)]
impl TestClock {
	/// Construct a test clock starting at `start`.
	pub fn new(start: Instant) -> Self {
		Self(std::sync::Mutex::new(start))
	}

	/// Move the clock forward by `by`.
	pub fn advance(&self, by: Duration) {
		let mut guard = self.0.lock().expect("test clock lock poisoned");

		*guard += by;
	}
}
#[cfg(test)]
impl Clock for TestClock {
	fn now(&self) -> Instant {
		*self.0.lock().expect("test clock lock poisoned")
	}
}

/// Current scheduling state for a race, read by telemetry consumers.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleState {
	/// The unjittered interval selected by the adjustment pipeline.
	pub target_interval: Duration,
	/// The jittered interval actually armed for the next tick.
	pub scheduled_interval: Duration,
	/// Wall-clock time between the previous two cycle starts, if known.
	pub last_actual_interval: Option<Duration>,
	/// How long the previous cycle took to run.
	pub last_cycle_duration: Option<Duration>,
	/// When the previous cycle started.
	pub last_run_at: Option<Instant>,
	/// When the next cycle is expected to start.
	pub next_run_at: Option<Instant>,
	/// Jitter applied to `target_interval` to produce `scheduled_interval`.
	pub jitter: Duration,
	/// Multiplier applied while the race is backgrounded.
	pub background_multiplier: f64,
	/// Cadence-compliance classification for the last cycle.
	pub compliance: Compliance,
}

/// Select `baseIntervalMs` for a race from its status and time-to-start.
///
/// `tts` is time-to-start. A terminal status selects `Duration::ZERO`, signalling
/// the caller to stop scheduling entirely.
pub fn base_interval(status: RaceStatus, tts: Duration) -> Duration {
	let minutes = tts.as_secs_f64() / 60.0;

	if status.is_terminal() {
		return Duration::ZERO;
	}

	match status {
		RaceStatus::Open if minutes > 65.0 => Duration::from_millis(900_000),
		RaceStatus::Open if minutes > 20.0 => Duration::from_millis(150_000),
		RaceStatus::Open if minutes > 5.0 => Duration::from_millis(75_000),
		RaceStatus::Open if minutes > 3.0 => Duration::from_millis(30_000),
		RaceStatus::Open => Duration::from_millis(15_000),
		RaceStatus::Closed | RaceStatus::Running | RaceStatus::Interim => Duration::from_millis(15_000),
		_ if minutes > 20.0 => Duration::from_millis(150_000),
		_ => Duration::from_millis(15_000),
	}
}

/// Inputs to the interval adjustment pipeline.
#[derive(Clone, Copy, Debug)]
pub struct AdjustmentInputs {
	/// The status/time-to-start cadence selected by [`base_interval`].
	pub base_interval: Duration,
	/// Multiplier to apply while the race is backgrounded; `1.0` when visible.
	pub background_multiplier: f64,
	/// Slowest average endpoint latency observed for this race, used to degrade
	/// the interval when responses are running slow.
	pub slowest_avg_latency: Duration,
	/// Scheduler tuning knobs.
	pub config: SchedulerConfigRef,
	/// Whether the race is currently backgrounded.
	pub hidden: bool,
	/// How long the race has been continuously backgrounded.
	pub hidden_duration: Duration,
	/// How long a race must stay backgrounded before the pipeline pauses it.
	pub pause_after: Duration,
}

/// A copy of the scheduler-relevant config fields, avoiding a lifetime on
/// [`AdjustmentInputs`].
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfigRef {
	/// Floor below which the interval is never adjusted.
	pub min_interval: Duration,
	/// Fractional jitter applied to the target interval, e.g. `0.1` for ±10%.
	pub jitter: f64,
	/// Average latency above which the interval is degraded.
	pub slow_response_threshold: Duration,
	/// Maximum multiplier applied when degrading for slow responses.
	pub max_degrade_multiplier: f64,
}
impl From<&SchedulerConfig> for SchedulerConfigRef {
	fn from(config: &SchedulerConfig) -> Self {
		Self {
			min_interval: config.min_interval,
			jitter: config.jitter,
			slow_response_threshold: config.slow_response_threshold,
			max_degrade_multiplier: config.max_degrade_multiplier,
		}
	}
}

/// Result of applying the adjustment pipeline: the scheduled interval (before
/// jitter is re-applied on each tick) and whether the scheduler should pause
/// entirely rather than arm another timer.
#[derive(Clone, Copy, Debug)]
pub struct AdjustedInterval {
	/// The unjittered interval selected by the pipeline, before [`apply_jitter`].
	pub target: Duration,
	/// Interval to sleep before the next cycle.
	pub scheduled: Duration,
	/// Whether the lifecycle controller should pause rather than arm a timer.
	pub pause: bool,
}

/// Apply the ordered adjustment pipeline to a base interval.
pub fn adjust_interval(inputs: AdjustmentInputs) -> AdjustedInterval {
	if inputs.hidden && inputs.hidden_duration >= inputs.pause_after {
		return AdjustedInterval { target: inputs.base_interval, scheduled: inputs.base_interval, pause: true };
	}

	let mut interval = inputs.base_interval.mul_f64(inputs.background_multiplier);

	if inputs.slowest_avg_latency >= inputs.config.slow_response_threshold {
		let over = inputs.slowest_avg_latency.as_secs_f64() - inputs.config.slow_response_threshold.as_secs_f64();
		let threshold = inputs.config.slow_response_threshold.as_secs_f64();
		let factor = (1.0 + over / threshold).min(inputs.config.max_degrade_multiplier);

		interval = interval.mul_f64(factor);
	}

	interval = interval.max(inputs.config.min_interval);

	let target = interval;
	let scheduled = apply_jitter(interval, inputs.config.jitter).max(inputs.config.min_interval);

	AdjustedInterval { target, scheduled, pause: false }
}

fn apply_jitter(interval: Duration, jitter: f64) -> Duration {
	if jitter <= 0.0 {
		return interval;
	}

	let span = interval.mul_f64(jitter);
	let lower = interval.saturating_sub(span);
	let upper = interval + span;
	let offset_nanos = rand::rng().random_range(0..=((upper - lower).as_nanos().min(u64::MAX as u128) as u64));

	lower + Duration::from_nanos(offset_nanos)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn config() -> SchedulerConfigRef {
		SchedulerConfigRef {
			min_interval: Duration::from_millis(5_000),
			jitter: 0.12,
			slow_response_threshold: Duration::from_millis(2_500),
			max_degrade_multiplier: 2.0,
		}
	}

	#[test]
	fn boundary_tts_selects_lower_frequency_branch() {
		assert_eq!(base_interval(RaceStatus::Open, Duration::from_secs(65 * 60)), Duration::from_millis(150_000));
		assert_eq!(base_interval(RaceStatus::Open, Duration::from_secs(65 * 60 + 1)), Duration::from_millis(900_000));
	}

	#[test]
	fn terminal_status_stops_scheduling() {
		assert_eq!(base_interval(RaceStatus::Final, Duration::from_secs(600)), Duration::ZERO);
	}

	#[test]
	fn active_statuses_use_fifteen_second_cadence() {
		assert_eq!(base_interval(RaceStatus::Running, Duration::from_secs(600)), Duration::from_millis(15_000));
		assert_eq!(base_interval(RaceStatus::Closed, Duration::from_secs(1)), Duration::from_millis(15_000));
	}

	#[test]
	fn slow_latency_widens_interval_up_to_cap() {
		let inputs = AdjustmentInputs {
			base_interval: Duration::from_millis(150_000),
			background_multiplier: 1.0,
			slowest_avg_latency: Duration::from_millis(100_000),
			config: config(),
			hidden: false,
			hidden_duration: Duration::ZERO,
			pause_after: Duration::from_secs(300),
		};
		let adjusted = adjust_interval(inputs);

		assert!(adjusted.scheduled <= Duration::from_millis(150_000 * 2).mul_f64(1.0 + 0.12));
	}

	#[test]
	fn result_is_never_below_min_interval() {
		let inputs = AdjustmentInputs {
			base_interval: Duration::from_millis(1_000),
			background_multiplier: 1.0,
			slowest_avg_latency: Duration::ZERO,
			config: config(),
			hidden: false,
			hidden_duration: Duration::ZERO,
			pause_after: Duration::from_secs(300),
		};
		let adjusted = adjust_interval(inputs);

		assert!(adjusted.scheduled >= Duration::from_millis(5_000));
	}

	#[test]
	fn hidden_past_five_minutes_pauses() {
		let inputs = AdjustmentInputs {
			base_interval: Duration::from_millis(150_000),
			background_multiplier: 2.0,
			slowest_avg_latency: Duration::ZERO,
			config: config(),
			hidden: true,
			hidden_duration: Duration::from_secs(300),
			pause_after: Duration::from_secs(300),
		};

		assert!(adjust_interval(inputs).pause);
	}

	#[test]
	fn pause_after_is_configurable_not_hardcoded() {
		let short = AdjustmentInputs {
			base_interval: Duration::from_millis(150_000),
			background_multiplier: 2.0,
			slowest_avg_latency: Duration::ZERO,
			config: config(),
			hidden: true,
			hidden_duration: Duration::from_secs(30),
			pause_after: Duration::from_secs(30),
		};
		assert!(adjust_interval(short).pause);

		let not_yet = AdjustmentInputs {
			base_interval: Duration::from_millis(150_000),
			background_multiplier: 2.0,
			slowest_avg_latency: Duration::ZERO,
			config: config(),
			hidden: true,
			hidden_duration: Duration::from_secs(250),
			pause_after: Duration::from_secs(600),
		};
		assert!(!adjust_interval(not_yet).pause);
	}
}
