//! Per-endpoint counters, cycle timings, compliance classification, and alert
//! derivation, shared process-wide across every race the registry drives.

// std
use std::{
	collections::{HashMap, VecDeque},
	sync::Mutex,
};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
// crates.io
#[cfg(feature = "metrics")] use metrics::Label;
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
#[cfg(feature = "metrics")] use smallvec::SmallVec;
// self
use crate::{_prelude::*, model::Endpoint, scheduler::ScheduleState};

const LATENCY_SAMPLE_CAP: usize = 50;
const DEBUG_EVENT_CAP: usize = 100;

#[cfg(feature = "metrics")] type LabelSet = SmallVec<[Label; 3]>;

#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the default Prometheus recorder. Safe to call more than once;
/// later calls are no-ops once a recorder is installed.
#[cfg(feature = "prometheus")]
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new().install_recorder().map_err(|err| Error::Metrics(err.to_string()))?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Raw counters and latency samples for a single `(race, endpoint)`.
#[derive(Debug, Default)]
struct EndpointMetrics {
	request_count: u64,
	success_count: u64,
	error_count: u64,
	consecutive_failures: u32,
	latency_samples: VecDeque<Duration>,
	last_success_at: Option<Instant>,
	last_error_at: Option<Instant>,
	last_error_message: Option<String>,
}
impl EndpointMetrics {
	fn record_success(&mut self, latency: Duration, now: Instant) {
		self.request_count += 1;
		self.success_count += 1;
		self.consecutive_failures = 0;
		self.last_success_at = Some(now);

		if self.latency_samples.len() >= LATENCY_SAMPLE_CAP {
			self.latency_samples.pop_front();
		}
		self.latency_samples.push_back(latency);
	}

	fn record_error(&mut self, message: String, now: Instant) {
		self.request_count += 1;
		self.error_count += 1;
		self.consecutive_failures += 1;
		self.last_error_at = Some(now);
		self.last_error_message = Some(message);
	}

	fn snapshot(&self) -> EndpointMetricsSnapshot {
		let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();

		sorted.sort();

		let average_latency = if sorted.is_empty() {
			Duration::ZERO
		} else {
			sorted.iter().sum::<Duration>() / sorted.len() as u32
		};
		let p95_latency = percentile(&sorted, 0.95);

		EndpointMetricsSnapshot {
			request_count: self.request_count,
			success_count: self.success_count,
			error_count: self.error_count,
			consecutive_failures: self.consecutive_failures,
			average_latency,
			p95_latency,
			last_success_at: self.last_success_at,
			last_error_at: self.last_error_at,
			last_error_message: self.last_error_message.clone(),
		}
	}
}

fn percentile(sorted: &[Duration], fraction: f64) -> Duration {
	if sorted.is_empty() {
		return Duration::ZERO;
	}

	let rank = ((sorted.len() - 1) as f64 * fraction).round() as usize;

	sorted[rank.min(sorted.len() - 1)]
}

/// Read-only view of [`EndpointMetrics`] for telemetry consumers.
#[derive(Clone, Debug)]
pub struct EndpointMetricsSnapshot {
	/// Total requests issued.
	pub request_count: u64,
	/// Requests that completed successfully.
	pub success_count: u64,
	/// Requests that failed.
	pub error_count: u64,
	/// Current run of consecutive failures.
	pub consecutive_failures: u32,
	/// Mean observed latency.
	pub average_latency: Duration,
	/// 95th-percentile observed latency.
	pub p95_latency: Duration,
	/// When the last successful request completed.
	pub last_success_at: Option<Instant>,
	/// When the last failed request completed.
	pub last_error_at: Option<Instant>,
	/// The most recent error message, if any.
	pub last_error_message: Option<String>,
}
impl EndpointMetricsSnapshot {
	/// Ratio of errors to total requests, `0.0` with no requests observed.
	pub fn error_rate(&self) -> f64 {
		if self.request_count == 0 {
			0.0
		} else {
			self.error_count as f64 / self.request_count as f64
		}
	}
}

/// Cadence-compliance classification comparing actual to scheduled interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compliance {
	/// Actual interval is within 1.2x the scheduled interval.
	OnTrack,
	/// Actual interval is between 1.2x and 2.0x the scheduled interval.
	Slow,
	/// Actual interval exceeds 2.0x the scheduled interval.
	Stalled,
}
impl Compliance {
	/// Classify `lastActualIntervalMs / scheduledIntervalMs`.
	pub fn from_ratio(ratio: f64) -> Self {
		if ratio <= 1.2 {
			Compliance::OnTrack
		} else if ratio <= 2.0 {
			Compliance::Slow
		} else {
			Compliance::Stalled
		}
	}
}

/// Severity of a derived alert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertLevel {
	/// A degraded but non-critical condition.
	Warning,
	/// A critical condition requiring attention.
	Error,
}

/// One alert derived from current metrics; never persisted, rebuilt on read.
#[derive(Clone, Debug, PartialEq)]
pub struct Alert {
	/// Severity of this alert.
	pub level: AlertLevel,
	/// Human-readable description.
	pub message: String,
}

/// Aggregate connection-health view polled by UI consumers.
#[derive(Clone, Debug)]
pub struct ConnectionHealth {
	/// Whether the race's polling loop is currently considered healthy.
	pub is_healthy: bool,
	/// Average latency across all endpoints.
	pub avg_latency: Duration,
	/// Time since the race was registered.
	pub uptime: Duration,
	/// Total cycles that accepted at least one slot.
	pub total_updates: u64,
	/// Total requests issued across all endpoints.
	pub total_requests: u64,
	/// Total failed requests across all endpoints.
	pub total_errors: u64,
	/// `total_errors / total_requests`, `0.0` with no requests observed.
	pub error_rate: f64,
	/// Cadence-compliance state, if a schedule has been recorded.
	pub schedule: Option<ScheduleState>,
	/// Currently active alerts.
	pub alerts: Vec<Alert>,
}

#[derive(Debug, Default)]
struct RaceTotals {
	total_updates: u64,
	started_at: Option<Instant>,
}

/// Process-wide telemetry registry: per-`(race, endpoint)` counters, a bounded
/// debug event log, and the last-known [`ScheduleState`] per race.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
	endpoints: Mutex<HashMap<(String, Endpoint), EndpointMetrics>>,
	schedules: Mutex<HashMap<String, ScheduleState>>,
	totals: Mutex<HashMap<String, RaceTotals>>,
	debug_events: Mutex<VecDeque<String>>,
}
impl MetricsRegistry {
	/// Construct an empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	/// Mark the start of a polling cycle for a race, recording first-observed time.
	pub fn cycle_start(&self, race_id: &str, now: Instant) {
		let mut totals = self.totals.lock().expect("metrics totals lock poisoned");

		totals.entry(race_id.to_string()).or_insert_with(|| RaceTotals { total_updates: 0, started_at: Some(now) });
	}

	/// Mark the end of a polling cycle, recording the duration as a debug event.
	pub fn cycle_end(&self, race_id: &str, duration: Duration, accepted_a_slot: bool) {
		self.push_debug_event(format!("cycle for '{race_id}' completed in {duration:?}"));

		if accepted_a_slot {
			let mut totals = self.totals.lock().expect("metrics totals lock poisoned");

			totals.entry(race_id.to_string()).or_insert_with(|| RaceTotals { total_updates: 0, started_at: None }).total_updates +=
				1;
		}
	}

	/// Record a successful endpoint request.
	pub fn record_success(&self, race_id: &str, endpoint: Endpoint, latency: Duration, now: Instant) {
		let mut endpoints = self.endpoints.lock().expect("metrics endpoints lock poisoned");

		endpoints.entry((race_id.to_string(), endpoint)).or_default().record_success(latency, now);

		#[cfg(feature = "metrics")]
		record_request(race_id, endpoint, "success", latency);
	}

	/// Record a failed endpoint request.
	pub fn record_error(&self, race_id: &str, endpoint: Endpoint, message: impl Into<String>, now: Instant) {
		let message = message.into();
		let mut endpoints = self.endpoints.lock().expect("metrics endpoints lock poisoned");

		endpoints.entry((race_id.to_string(), endpoint)).or_default().record_error(message.clone(), now);

		self.push_debug_event(format!("{race_id}/{endpoint:?}: {message}"));

		#[cfg(feature = "metrics")]
		record_request(race_id, endpoint, "error", Duration::ZERO);
	}

	/// Record the [`ScheduleState`] most recently computed for a race.
	pub fn record_schedule(&self, race_id: &str, state: ScheduleState) {
		self.schedules.lock().expect("metrics schedules lock poisoned").insert(race_id.to_string(), state);
	}

	/// Snapshot a single endpoint's counters.
	pub fn endpoint_snapshot(&self, race_id: &str, endpoint: Endpoint) -> Option<EndpointMetricsSnapshot> {
		self.endpoints
			.lock()
			.expect("metrics endpoints lock poisoned")
			.get(&(race_id.to_string(), endpoint))
			.map(EndpointMetrics::snapshot)
	}

	/// Derive the current alert list for a race from its endpoint and schedule state.
	pub fn alerts(&self, race_id: &str, max_retries: u32) -> Vec<Alert> {
		let mut alerts = Vec::new();
		let endpoints = self.endpoints.lock().expect("metrics endpoints lock poisoned");
		let mut total_requests = 0u64;
		let mut total_errors = 0u64;

		for (key, metrics) in endpoints.iter().filter(|((race, _), _)| race == race_id) {
			let snapshot = metrics.snapshot();

			total_requests += snapshot.request_count;
			total_errors += snapshot.error_count;

			if snapshot.consecutive_failures >= max_retries {
				alerts.push(Alert {
					level: AlertLevel::Error,
					message: format!("{:?} has failed {} consecutive times", key.1, snapshot.consecutive_failures),
				});
			} else if snapshot.error_rate() > 0.10 {
				alerts.push(Alert { level: AlertLevel::Warning, message: format!("{:?} error rate above 10%", key.1) });
			}
		}

		let overall_rate = if total_requests == 0 { 0.0 } else { total_errors as f64 / total_requests as f64 };

		if overall_rate > 0.10 {
			alerts.push(Alert { level: AlertLevel::Error, message: "overall error rate above 10%".into() });
		} else if overall_rate > 0.05 {
			alerts.push(Alert { level: AlertLevel::Warning, message: "overall error rate above 5%".into() });
		}

		if let Some(schedule) = self.schedules.lock().expect("metrics schedules lock poisoned").get(race_id) {
			match schedule.compliance {
				Compliance::Stalled => alerts.push(Alert { level: AlertLevel::Error, message: "cadence stalled".into() }),
				Compliance::Slow => alerts.push(Alert { level: AlertLevel::Warning, message: "cadence slow".into() }),
				Compliance::OnTrack => {},
			}
		}

		alerts
	}

	/// Compute the polled connection-health view for a race.
	pub fn connection_health(&self, race_id: &str, max_retries: u32, now: Instant) -> ConnectionHealth {
		let endpoints = self.endpoints.lock().expect("metrics endpoints lock poisoned");
		let mut total_requests = 0u64;
		let mut total_errors = 0u64;
		let mut latencies = Vec::new();

		for (_, metrics) in endpoints.iter().filter(|((race, _), _)| race == race_id) {
			let snapshot = metrics.snapshot();

			total_requests += snapshot.request_count;
			total_errors += snapshot.error_count;

			if snapshot.average_latency > Duration::ZERO {
				latencies.push(snapshot.average_latency);
			}
		}

		drop(endpoints);

		let avg_latency = if latencies.is_empty() {
			Duration::ZERO
		} else {
			latencies.iter().sum::<Duration>() / latencies.len() as u32
		};
		let error_rate = if total_requests == 0 { 0.0 } else { total_errors as f64 / total_requests as f64 };
		let totals = self.totals.lock().expect("metrics totals lock poisoned");
		let race_totals = totals.get(race_id);
		let uptime = race_totals
			.and_then(|t| t.started_at)
			.map(|started| now.saturating_duration_since(started))
			.unwrap_or(Duration::ZERO);
		let total_updates = race_totals.map(|t| t.total_updates).unwrap_or(0);

		drop(totals);

		let schedule = self.schedules.lock().expect("metrics schedules lock poisoned").get(race_id).cloned();
		let alerts = self.alerts(race_id, max_retries);

		ConnectionHealth {
			is_healthy: !alerts.iter().any(|a| a.level == AlertLevel::Error),
			avg_latency,
			uptime,
			total_updates,
			total_requests,
			total_errors,
			error_rate,
			schedule,
			alerts,
		}
	}

	/// Drop every accumulated counter, schedule, and debug event. Exists so test
	/// suites sharing a process-wide registry never leak state between cases.
	pub fn reset(&self) {
		self.endpoints.lock().expect("metrics endpoints lock poisoned").clear();
		self.schedules.lock().expect("metrics schedules lock poisoned").clear();
		self.totals.lock().expect("metrics totals lock poisoned").clear();
		self.debug_events.lock().expect("metrics debug events lock poisoned").clear();
	}

	fn push_debug_event(&self, message: String) {
		let mut events = self.debug_events.lock().expect("metrics debug events lock poisoned");

		if events.len() >= DEBUG_EVENT_CAP {
			events.pop_front();
		}
		events.push_back(message);
	}
}

#[cfg(feature = "metrics")]
fn record_request(race_id: &str, endpoint: Endpoint, status: &'static str, latency: Duration) {
	let mut labels: LabelSet = LabelSet::new();

	labels.push(Label::new("race_id", race_id.to_owned()));
	labels.push(Label::new("endpoint", format!("{endpoint:?}")));
	labels.push(Label::new("status", status));

	metrics::counter!("race_poll_requests_total", labels.iter()).increment(1);

	if status == "success" {
		metrics::histogram!("race_poll_latency_seconds", labels.iter()).record(latency.as_secs_f64());
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn error_rate_and_p95_computed_from_samples() {
		let registry = MetricsRegistry::new();
		let now = Instant::now();

		for millis in [10, 20, 30, 40, 100] {
			registry.record_success("race-1", Endpoint::Race, Duration::from_millis(millis), now);
		}
		registry.record_error("race-1", Endpoint::Race, "boom", now);

		let snapshot = registry.endpoint_snapshot("race-1", Endpoint::Race).unwrap();

		assert_eq!(snapshot.request_count, 6);
		assert!((snapshot.error_rate() - 1.0 / 6.0).abs() < 1e-9);
		assert_eq!(snapshot.p95_latency, Duration::from_millis(100));
	}

	#[test]
	fn consecutive_failures_reset_on_success() {
		let registry = MetricsRegistry::new();
		let now = Instant::now();

		for _ in 0..3 {
			registry.record_error("race-1", Endpoint::Pools, "boom", now);
		}
		registry.record_success("race-1", Endpoint::Pools, Duration::from_millis(5), now);

		let snapshot = registry.endpoint_snapshot("race-1", Endpoint::Pools).unwrap();

		assert_eq!(snapshot.consecutive_failures, 0);
	}

	#[test]
	fn alerts_fire_at_consecutive_failure_threshold() {
		let registry = MetricsRegistry::new();
		let now = Instant::now();

		for _ in 0..5 {
			registry.record_error("race-1", Endpoint::Pools, "boom", now);
		}

		let alerts = registry.alerts("race-1", 5);

		assert!(alerts.iter().any(|a| a.level == AlertLevel::Error));
	}

	#[test]
	fn reset_clears_all_state() {
		let registry = MetricsRegistry::new();

		registry.record_success("race-1", Endpoint::Race, Duration::from_millis(5), Instant::now());
		registry.reset();

		assert!(registry.endpoint_snapshot("race-1", Endpoint::Race).is_none());
	}
}
