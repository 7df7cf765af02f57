//! Per-race lifecycle state machine and tick loop.
//!
//! `idle -> active` on [`LifecycleController::start`]; `active <-> paused` via
//! `pause`/`resume`; any state but `stopped` transitions to `stopped` via `stop` or
//! on observing a terminal [`RaceStatus`]. The tick loop is spawned once per race
//! and runs until stopped, driving the scheduler's cadence and the coordinator's
//! cycles cooperatively against a [`CancellationToken`].

// crates.io
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
// self
use crate::{
	_prelude::*,
	config::PollingConfig,
	coordinator::Coordinator,
	error_handler::backoff_for_attempt,
	metrics::{Compliance, MetricsRegistry},
	model::{Endpoint, RaceSnapshot, RaceStatus},
	scheduler::{AdjustedInterval, AdjustmentInputs, Clock, ScheduleState, SchedulerConfigRef, adjust_interval, base_interval},
};

/// Current lifecycle state for a race's polling loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
	/// Registered but not yet started.
	Idle,
	/// Ticking: running cycles on a schedule.
	Active,
	/// Ticking suspended; cached state is retained.
	Paused,
	/// Terminally stopped; will not tick again.
	Stopped,
}

/// Receives reconciled snapshots and propagated errors from a race's polling loop.
///
/// Implementors must not block; dispatch is awaited inline in the tick loop.
#[async_trait::async_trait]
pub trait Subscriber: Send + Sync {
	/// A cycle accepted at least one slot; `trigger` is the post-cycle
	/// `money_flow_update_trigger` value.
	async fn on_data_update(&self, snapshot: Arc<RaceSnapshot>, trigger: u64);

	/// A cycle's critical endpoints all failed, or the loop could not proceed.
	/// `source` names the endpoint the failure originated from, if known.
	async fn on_error(&self, error: &Error, source: Option<Endpoint>);
}

struct VisibilityState {
	hidden: bool,
	hidden_since: Option<Instant>,
}

/// Wall-clock bookkeeping for the previous tick, used to compute cadence compliance.
struct CycleHistory {
	last_start: Option<Instant>,
	last_scheduled: Duration,
}

/// Drives one race's polling loop: pause/resume/stop controls, background-visibility
/// tracking, and the interval-adjusted tick loop itself.
pub struct LifecycleController<C: Clock = crate::scheduler::SystemClock> {
	coordinator: Arc<Coordinator>,
	subscriber: Arc<dyn Subscriber>,
	metrics: Arc<MetricsRegistry>,
	config: PollingConfig,
	clock: C,
	state: AsyncMutex<LifecycleState>,
	visibility: AsyncMutex<VisibilityState>,
	auto_paused: AsyncMutex<bool>,
	history: AsyncMutex<CycleHistory>,
	retry_attempt: AsyncMutex<u32>,
	cancel: CancellationToken,
	wake: Notify,
}
impl<C: Clock> LifecycleController<C> {
	/// Construct a controller in the `idle` state; call [`Self::start`] to begin polling.
	pub fn new(
		coordinator: Arc<Coordinator>,
		subscriber: Arc<dyn Subscriber>,
		metrics: Arc<MetricsRegistry>,
		config: PollingConfig,
		clock: C,
	) -> Self {
		Self {
			coordinator,
			subscriber,
			metrics,
			config,
			clock,
			state: AsyncMutex::new(LifecycleState::Idle),
			visibility: AsyncMutex::new(VisibilityState { hidden: false, hidden_since: None }),
			auto_paused: AsyncMutex::new(false),
			history: AsyncMutex::new(CycleHistory { last_start: None, last_scheduled: Duration::ZERO }),
			retry_attempt: AsyncMutex::new(0),
			cancel: CancellationToken::new(),
			wake: Notify::new(),
		}
	}

	/// Current lifecycle state.
	pub async fn state(&self) -> LifecycleState {
		*self.state.lock().await
	}

	/// `idle -> active`. A no-op if already active or stopped.
	pub async fn start(&self) {
		let mut state = self.state.lock().await;

		if *state == LifecycleState::Idle {
			*state = LifecycleState::Active;
			self.wake.notify_one();
		}
	}

	/// `active -> paused`. A no-op outside `active`.
	pub async fn pause(&self) {
		let mut state = self.state.lock().await;

		if *state == LifecycleState::Active {
			*state = LifecycleState::Paused;
		}
	}

	/// `paused -> active`. A no-op outside `paused`.
	pub async fn resume(&self) {
		let mut state = self.state.lock().await;

		if *state == LifecycleState::Paused {
			*state = LifecycleState::Active;
			self.wake.notify_one();
		}
	}

	/// Any state `-> stopped`. Cancels the tick loop's in-flight cycle and timer.
	pub async fn stop(&self) {
		*self.state.lock().await = LifecycleState::Stopped;
		self.cancel.cancel();
		self.wake.notify_one();
	}

	/// Record a tab-visibility transition. Entering hidden starts the inactivity
	/// timer; returning visible clears it immediately and resumes the tick loop if
	/// it had auto-paused for inactivity while hidden.
	pub async fn set_hidden(&self, hidden: bool) {
		let mut visibility = self.visibility.lock().await;

		if hidden && !visibility.hidden {
			visibility.hidden_since = Some(self.clock.now());
		} else if !hidden {
			visibility.hidden_since = None;
		}
		visibility.hidden = hidden;
		drop(visibility);

		if !hidden {
			let was_auto_paused = std::mem::take(&mut *self.auto_paused.lock().await);

			if was_auto_paused {
				self.resume().await;
			}
		}
	}

	/// Run the tick loop until [`Self::stop`] is called or the race reaches a
	/// terminal status. Intended to be spawned once per race via `tokio::spawn`.
	pub async fn run(&self) {
		loop {
			if *self.state.lock().await == LifecycleState::Stopped {
				return;
			}

			while *self.state.lock().await == LifecycleState::Paused {
				tokio::select! {
					_ = self.wake.notified() => {},
					_ = self.cancel.cancelled() => return,
				}
			}
			if *self.state.lock().await == LifecycleState::Idle {
				tokio::select! {
					_ = self.wake.notified() => {},
					_ = self.cancel.cancelled() => return,
				}
				continue;
			}

			let cycle_start = self.clock.now();
			let report = self.coordinator.run_cycle(&self.cancel).await;
			let cycle_duration = self.clock.now().saturating_duration_since(cycle_start);

			if let Some(error) = &report.critical_failure {
				tracing::warn!(%error, "cycle reported a critical failure");
				self.subscriber.on_error(error, report.failed_endpoint).await;
			}
			if let Some(snapshot) = report.snapshot {
				let trigger = snapshot.money_flow_update_trigger;

				self.subscriber.on_data_update(snapshot, trigger).await;
			}

			if report.status.is_terminal() {
				tracing::info!(status = ?report.status, "race reached a terminal status, stopping");
				self.stop().await;
				return;
			}

			let interval = self.next_interval(report.status, report.time_to_start, cycle_start, cycle_duration).await;

			let sleep_for = if report.critical_failure.is_some() {
				let mut attempt = self.retry_attempt.lock().await;
				let delay = backoff_for_attempt(*attempt);

				*attempt += 1;
				tracing::debug!(attempt = *attempt, delay = ?delay, "backing off after a critical cycle failure");

				delay
			} else {
				*self.retry_attempt.lock().await = 0;

				interval.scheduled
			};

			if interval.pause {
				tracing::debug!("hidden past the inactivity threshold, pausing");
				*self.auto_paused.lock().await = true;
				self.pause().await;
				continue;
			}

			tokio::select! {
				_ = tokio::time::sleep(sleep_for) => {},
				_ = self.cancel.cancelled() => return,
				_ = self.wake.notified() => {},
			}
		}
	}

	async fn next_interval(
		&self,
		status: RaceStatus,
		time_to_start: Duration,
		cycle_start: Instant,
		cycle_duration: Duration,
	) -> AdjustedInterval {
		let base = base_interval(status, time_to_start);
		let visibility = self.visibility.lock().await;
		let hidden_duration =
			visibility.hidden_since.map(|since| self.clock.now().saturating_duration_since(since)).unwrap_or(Duration::ZERO);
		let slowest_avg_latency = Endpoint::ALL
			.iter()
			.filter_map(|endpoint| self.metrics.endpoint_snapshot(self.coordinator.race_id(), *endpoint))
			.map(|snapshot| snapshot.average_latency)
			.max()
			.unwrap_or(Duration::ZERO);
		let inputs = AdjustmentInputs {
			base_interval: base,
			background_multiplier: if visibility.hidden { self.config.background_multiplier } else { 1.0 },
			slowest_avg_latency,
			config: SchedulerConfigRef::from(&self.config.scheduler),
			hidden: visibility.hidden,
			hidden_duration,
			pause_after: self.config.inactivity.pause_after,
		};

		let adjusted = adjust_interval(inputs);

		self.record_schedule(&adjusted, inputs.background_multiplier, cycle_start, cycle_duration).await;

		adjusted
	}

	async fn record_schedule(
		&self,
		adjusted: &AdjustedInterval,
		background_multiplier: f64,
		cycle_start: Instant,
		cycle_duration: Duration,
	) {
		let mut history = self.history.lock().await;
		let (last_actual_interval, compliance) = match history.last_start {
			Some(last_start) if history.last_scheduled > Duration::ZERO => {
				let actual = cycle_start.saturating_duration_since(last_start);
				let ratio = actual.as_secs_f64() / history.last_scheduled.as_secs_f64();

				(Some(actual), Compliance::from_ratio(ratio))
			},
			_ => (None, Compliance::OnTrack),
		};
		let jitter = adjusted.scheduled.abs_diff(adjusted.target);

		history.last_start = Some(cycle_start);
		history.last_scheduled = adjusted.scheduled;
		drop(history);

		let state = ScheduleState {
			target_interval: adjusted.target,
			scheduled_interval: adjusted.scheduled,
			last_actual_interval,
			last_cycle_duration: Some(cycle_duration),
			last_run_at: Some(cycle_start),
			next_run_at: if adjusted.pause { None } else { Some(cycle_start + adjusted.scheduled) },
			jitter,
			background_multiplier,
			compliance,
		};

		self.metrics.record_schedule(self.coordinator.race_id(), state);
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use wiremock::{
		Mock, MockServer, ResponseTemplate,
		matchers::{method, path},
	};
	// self
	use super::*;
	use crate::{
		cache::Caches,
		config::{CacheConfig, CircuitBreakerConfig, RateLimiterConfig},
		error_handler::ErrorHandler,
		http::Fetcher,
		metrics::MetricsRegistry,
		rate_limiter::RateLimiter,
		scheduler::{SystemClock, TestClock},
	};

	struct RecordingSubscriber {
		updates: AsyncMutex<Vec<Arc<RaceSnapshot>>>,
	}
	#[async_trait::async_trait]
	impl Subscriber for RecordingSubscriber {
		async fn on_data_update(&self, snapshot: Arc<RaceSnapshot>, _trigger: u64) {
			self.updates.lock().await.push(snapshot);
		}

		async fn on_error(&self, _error: &Error, _source: Option<Endpoint>) {}
	}

	fn coordinator() -> Arc<Coordinator> {
		let config = PollingConfig::default();
		let base_url: url::Url = "http://127.0.0.1:1/api/race".parse().unwrap();

		Arc::new(Coordinator::new(
			"race-1",
			base_url,
			&config,
			Arc::new(Fetcher::new(reqwest::Client::new())),
			Arc::new(Caches::new(CacheConfig::default())),
			Arc::new(AsyncMutex::new(RateLimiter::new(RateLimiterConfig::default()))),
			Arc::new(AsyncMutex::new(ErrorHandler::new(CircuitBreakerConfig::default()))),
			Arc::new(MetricsRegistry::new()),
		))
	}

	#[tokio::test]
	async fn starts_in_idle_and_transitions_to_active() {
		let subscriber = Arc::new(RecordingSubscriber { updates: AsyncMutex::new(Vec::new()) });
		let controller = LifecycleController::new(
			coordinator(),
			subscriber,
			Arc::new(MetricsRegistry::new()),
			PollingConfig::default(),
			TestClock::new(Instant::now()),
		);

		assert_eq!(controller.state().await, LifecycleState::Idle);

		controller.start().await;

		assert_eq!(controller.state().await, LifecycleState::Active);
	}

	#[tokio::test]
	async fn pause_and_resume_round_trip() {
		let subscriber = Arc::new(RecordingSubscriber { updates: AsyncMutex::new(Vec::new()) });
		let controller = LifecycleController::new(
			coordinator(),
			subscriber,
			Arc::new(MetricsRegistry::new()),
			PollingConfig::default(),
			TestClock::new(Instant::now()),
		);

		controller.start().await;
		controller.pause().await;
		assert_eq!(controller.state().await, LifecycleState::Paused);

		controller.resume().await;
		assert_eq!(controller.state().await, LifecycleState::Active);
	}

	#[tokio::test]
	async fn stop_is_terminal() {
		let subscriber = Arc::new(RecordingSubscriber { updates: AsyncMutex::new(Vec::new()) });
		let controller = LifecycleController::new(
			coordinator(),
			subscriber,
			Arc::new(MetricsRegistry::new()),
			PollingConfig::default(),
			TestClock::new(Instant::now()),
		);

		controller.start().await;
		controller.stop().await;

		assert_eq!(controller.state().await, LifecycleState::Stopped);

		controller.start().await;
		assert_eq!(controller.state().await, LifecycleState::Stopped);
	}

	#[tokio::test]
	async fn next_interval_records_schedule_state_with_compliance() {
		let coordinator = coordinator();
		let subscriber = Arc::new(RecordingSubscriber { updates: AsyncMutex::new(Vec::new()) });
		let metrics = Arc::new(MetricsRegistry::new());
		let clock = TestClock::new(Instant::now());
		let controller =
			LifecycleController::new(coordinator.clone(), subscriber, metrics.clone(), PollingConfig::default(), clock);

		let first_start = Instant::now();

		controller.next_interval(RaceStatus::Open, Duration::from_secs(3600), first_start, Duration::from_millis(10)).await;

		let health = metrics.connection_health(coordinator.race_id(), 5, Instant::now());
		let schedule = health.schedule.expect("schedule state recorded after the first tick");

		assert_eq!(schedule.last_actual_interval, None);
		assert_eq!(schedule.compliance, crate::metrics::Compliance::OnTrack);

		let scheduled = schedule.scheduled_interval;
		let second_start = first_start + scheduled * 3;

		controller.next_interval(RaceStatus::Open, Duration::from_secs(3600), second_start, Duration::from_millis(10)).await;

		let health = metrics.connection_health(coordinator.race_id(), 5, Instant::now());
		let schedule = health.schedule.expect("schedule state recorded after the second tick");

		assert_eq!(schedule.last_actual_interval, Some(scheduled * 3));
		assert_eq!(schedule.compliance, crate::metrics::Compliance::Stalled);
	}

	#[tokio::test]
	async fn set_hidden_false_resumes_a_controller_that_auto_paused() {
		let subscriber = Arc::new(RecordingSubscriber { updates: AsyncMutex::new(Vec::new()) });
		let controller = LifecycleController::new(
			coordinator(),
			subscriber,
			Arc::new(MetricsRegistry::new()),
			PollingConfig::default(),
			TestClock::new(Instant::now()),
		);

		controller.start().await;
		controller.set_hidden(true).await;
		*controller.auto_paused.lock().await = true;
		controller.pause().await;
		assert_eq!(controller.state().await, LifecycleState::Paused);

		controller.set_hidden(false).await;

		assert_eq!(controller.state().await, LifecycleState::Active);
		assert!(!*controller.auto_paused.lock().await);
	}

	#[tokio::test]
	async fn set_hidden_false_leaves_a_manually_paused_controller_paused() {
		let subscriber = Arc::new(RecordingSubscriber { updates: AsyncMutex::new(Vec::new()) });
		let controller = LifecycleController::new(
			coordinator(),
			subscriber,
			Arc::new(MetricsRegistry::new()),
			PollingConfig::default(),
			TestClock::new(Instant::now()),
		);

		controller.start().await;
		controller.set_hidden(true).await;
		controller.pause().await;
		assert_eq!(controller.state().await, LifecycleState::Paused);

		controller.set_hidden(false).await;

		assert_eq!(controller.state().await, LifecycleState::Paused);
	}

	#[tokio::test]
	async fn critical_failures_back_off_then_reset_on_success() {
		let server = MockServer::start().await;

		Mock::given(method("GET"))
			.and(path("/api/race/race-1"))
			.respond_with(ResponseTemplate::new(500))
			.up_to_n_times(2)
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/api/race/race-1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"race": {
					"race_id": "race-1",
					"start_time": (Utc::now() + chrono::Duration::hours(2)).to_rfc3339(),
					"status": "open",
				},
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/api/race/race-1/entrants"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"entrants": []})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/api/race/race-1/pools"))
			.respond_with(ResponseTemplate::new(500))
			.mount(&server)
			.await;

		let config = PollingConfig { request_timeout: Duration::from_secs(5), ..Default::default() };
		let base_url: url::Url = format!("{}/api/race", server.uri()).parse().unwrap();
		let coordinator = Arc::new(Coordinator::new(
			"race-1",
			base_url,
			&config,
			Arc::new(Fetcher::new(reqwest::Client::new())),
			Arc::new(Caches::new(CacheConfig::default())),
			Arc::new(AsyncMutex::new(RateLimiter::new(RateLimiterConfig::default()))),
			Arc::new(AsyncMutex::new(ErrorHandler::new(CircuitBreakerConfig::default()))),
			Arc::new(MetricsRegistry::new()),
		));
		let subscriber = Arc::new(RecordingSubscriber { updates: AsyncMutex::new(Vec::new()) });
		let controller =
			Arc::new(LifecycleController::new(coordinator, subscriber, Arc::new(MetricsRegistry::new()), config, SystemClock));

		controller.start().await;

		let run_controller = controller.clone();
		let handle = tokio::spawn(async move { run_controller.run().await });

		// First cycle fails immediately (no backoff elapsed yet): attempt becomes 1.
		assert!(wait_for(|| async { *controller.retry_attempt.lock().await == 1 }, Duration::from_secs(2)).await);

		// Second cycle fails again after backing off ~1s: attempt becomes 2.
		assert!(wait_for(|| async { *controller.retry_attempt.lock().await == 2 }, Duration::from_secs(3)).await);

		// Third cycle succeeds (race now 200) after backing off ~2s: attempt resets to 0.
		assert!(wait_for(|| async { *controller.retry_attempt.lock().await == 0 }, Duration::from_secs(4)).await);

		controller.stop().await;
		handle.abort();
	}

	async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
	where
		F: FnMut() -> Fut,
		Fut: std::future::Future<Output = bool>,
	{
		let start = tokio::time::Instant::now();

		loop {
			if condition().await {
				return true;
			}
			if start.elapsed() >= timeout {
				return false;
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
	}
}
