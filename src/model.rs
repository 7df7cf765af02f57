//! Wire types and the reconciled snapshot surfaced to subscribers.

// std
use std::str::FromStr;
// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// One of the four correlated endpoints polled per race per cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
	/// `/api/race/{id}` — the race record itself.
	Race,
	/// `/api/race/{id}/entrants` — the ordered entrant list.
	Entrants,
	/// `/api/race/{id}/pools` — betting pool totals.
	Pools,
	/// `/api/race/{id}/money-flow-timeline` — the money-flow timeline.
	MoneyFlow,
}
impl Endpoint {
	/// All four endpoints, in the order they are staggered within a cycle.
	pub const ALL: [Endpoint; 4] =
		[Endpoint::Race, Endpoint::Entrants, Endpoint::Pools, Endpoint::MoneyFlow];

	/// Stagger offset applied before issuing this endpoint's request within a cycle.
	pub fn stagger_offset(self) -> Duration {
		match self {
			Endpoint::Race => Duration::ZERO,
			Endpoint::Entrants => Duration::from_millis(100),
			Endpoint::Pools => Duration::from_millis(200),
			Endpoint::MoneyFlow => Duration::from_millis(300),
		}
	}

	/// Path suffix appended to the race's base path.
	pub fn path_suffix(self) -> &'static str {
		match self {
			Endpoint::Race => "",
			Endpoint::Entrants => "/entrants",
			Endpoint::Pools => "/pools",
			Endpoint::MoneyFlow => "/money-flow-timeline",
		}
	}
}

/// Lifecycle status of a race, parsed case-insensitively from the raw API string.
///
/// An unrecognised value becomes `Unknown` rather than a parse error, matching the
/// "never fail a cycle on a parser error" posture applied elsewhere to payload fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaceStatus {
	/// Betting is open; no results exist yet.
	Open,
	/// Betting has closed ahead of the start.
	Closed,
	/// The race is underway.
	Running,
	/// Running has finished; interim results are being settled.
	Interim,
	/// Results are final.
	Final,
	/// Results are final and dividends have been paid.
	Finalized,
	/// The race was abandoned before running.
	Abandoned,
	/// The race was cancelled before running.
	Cancelled,
	/// An unrecognised status string.
	#[default]
	Unknown,
}
impl RaceStatus {
	/// Terminal statuses after which no further HTTP requests should be issued.
	pub fn is_terminal(self) -> bool {
		matches!(self, RaceStatus::Final | RaceStatus::Finalized | RaceStatus::Abandoned | RaceStatus::Cancelled)
	}

	/// The complement of [`RaceStatus::is_terminal`].
	pub fn is_active(self) -> bool {
		!self.is_terminal()
	}
}
impl FromStr for RaceStatus {
	type Err = std::convert::Infallible;

	fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match value.to_ascii_lowercase().as_str() {
			"open" => RaceStatus::Open,
			"closed" => RaceStatus::Closed,
			"running" => RaceStatus::Running,
			"interim" => RaceStatus::Interim,
			"final" => RaceStatus::Final,
			"finalized" => RaceStatus::Finalized,
			"abandoned" => RaceStatus::Abandoned,
			"cancelled" => RaceStatus::Cancelled,
			_ => RaceStatus::Unknown,
		})
	}
}
/// Result status reported once a race has finished.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
	/// Results are provisional.
	#[default]
	Interim,
	/// Results are settled.
	Final,
	/// Results are under protest.
	Protest,
}
impl FromStr for ResultStatus {
	type Err = std::convert::Infallible;

	fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match value.to_ascii_lowercase().as_str() {
			"final" => ResultStatus::Final,
			"protest" => ResultStatus::Protest,
			_ => ResultStatus::Interim,
		})
	}
}

/// The race record returned by `/api/race/{id}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Race {
	/// The race's unique id, matching the `{id}` path segment it was fetched under.
	pub race_id: String,
	/// Scheduled start time.
	pub start_time: DateTime<Utc>,
	/// Current lifecycle status.
	pub status: RaceStatus,
	/// Free-text weather description, if reported.
	#[serde(default)]
	pub weather: Option<String>,
	/// Free-text track condition, if reported.
	#[serde(default)]
	pub track_condition: Option<String>,
	/// Race distance in metres, if reported.
	#[serde(default)]
	pub distance: Option<f64>,
	/// Number of runners, if reported.
	#[serde(default)]
	pub runner_count: Option<u32>,
	/// Whether results have been published for this race.
	#[serde(default)]
	pub results_available: bool,
	/// Either a pre-parsed JSON value or a JSON-encoded string; decoded permissively.
	#[serde(default)]
	pub results_data: Option<serde_json::Value>,
	/// Raw dividends payload, decoded permissively like `results_data`.
	#[serde(default)]
	pub dividends_data: Option<serde_json::Value>,
	/// Raw fixed-odds payload, decoded permissively like `results_data`.
	#[serde(default)]
	pub fixed_odds_data: Option<serde_json::Value>,
	/// Raw result-status string, parsed into [`ResultStatus`] when deriving [`ResultsData`].
	#[serde(default)]
	pub result_status: Option<String>,
	/// Timestamp results were finalised, if available.
	#[serde(default)]
	pub result_time: Option<DateTime<Utc>>,
}

/// One entrant in the race's runner list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entrant {
	/// The entrant's unique id.
	pub entrant_id: String,
	/// Display name.
	pub name: String,
	/// Saddlecloth/runner number.
	pub runner_number: u32,
	/// Current win odds, if priced.
	#[serde(default)]
	pub win_odds: Option<f64>,
	/// Current place odds, if priced.
	#[serde(default)]
	pub place_odds: Option<f64>,
	/// Whether the entrant has been scratched from the race.
	#[serde(default)]
	pub is_scratched: bool,
}

/// Betting pool totals returned by `/api/race/{id}/pools`.
///
/// The endpoint may return this bare or wrapped in `{"pools": ...}` depending on the
/// origin; both shapes deserialize to the same struct, preferring the bare shape when
/// both a bare field and a `pools` wrapper could plausibly match.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Pools {
	/// ISO currency code the pool totals are denominated in.
	pub currency: String,
	/// Total amount wagered across all pool types.
	pub total_race_pool: f64,
	/// Amount wagered on the win pool.
	pub win_pool: f64,
	/// Amount wagered on the place pool.
	pub place_pool: f64,
}
impl<'de> Deserialize<'de> for Pools {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		#[derive(Deserialize)]
		struct Bare {
			currency: String,
			total_race_pool: f64,
			win_pool: f64,
			place_pool: f64,
		}
		#[derive(Deserialize)]
		struct Wrapped {
			pools: Bare,
		}
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Shape {
			Bare(Bare),
			Wrapped(Wrapped),
		}

		let shape = Shape::deserialize(deserializer)?;
		let bare = match shape {
			Shape::Bare(bare) => bare,
			Shape::Wrapped(wrapped) => wrapped.pools,
		};

		Ok(Self {
			currency: bare.currency,
			total_race_pool: bare.total_race_pool,
			win_pool: bare.win_pool,
			place_pool: bare.place_pool,
		})
	}
}

/// One point on the money-flow timeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MoneyFlowPoint {
	/// The entrant this point's flow belongs to.
	pub entrant_id: String,
	/// When this point was recorded.
	pub timestamp: DateTime<Utc>,
	/// Amount wagered as of this point.
	pub amount: f64,
}

/// Raw body of the money-flow-timeline endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MoneyFlowTimeline {
	/// The timeline's data points.
	#[serde(default)]
	pub documents: Vec<MoneyFlowPoint>,
	/// Origin-specific metadata describing which intervals are covered.
	#[serde(default)]
	pub interval_coverage: Option<serde_json::Value>,
	/// An informational message from the origin, if any.
	#[serde(default)]
	pub message: Option<String>,
}

/// A single dividend payout line derived from `dividendsData`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dividend {
	/// The entrant this payout belongs to.
	pub entrant_id: String,
	/// Payout amount.
	pub amount: f64,
}

/// A single result placing derived from `resultsData`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultPlacing {
	/// The entrant this placing belongs to.
	pub entrant_id: String,
	/// Finishing position, 1-indexed.
	pub position: u32,
}

/// View derived from `race.{resultsData,dividendsData,fixedOddsData,resultStatus}`,
/// present iff `race.results_available && race.results_data.is_some()`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultsData {
	/// Whether the results are interim, final, or under protest.
	pub status: ResultStatus,
	/// When the results were finalised.
	pub result_time: DateTime<Utc>,
	/// Finishing order.
	pub results: Vec<ResultPlacing>,
	/// Dividend payouts.
	pub dividends: Vec<Dividend>,
	/// Raw fixed-odds entries, passed through undecoded.
	#[serde(default)]
	pub fixed_odds: Vec<serde_json::Value>,
}

/// The reconciled, per-race view emitted to subscribers once per cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RaceSnapshot {
	/// The race this snapshot belongs to.
	pub race_id: String,
	/// The most recently accepted race record, if any cycle has accepted one.
	pub race: Option<Race>,
	/// The most recently accepted entrant list.
	pub entrants: Vec<Entrant>,
	/// The most recently accepted pool totals, if any cycle has accepted one.
	pub pools: Option<Pools>,
	/// Bumped each time a money-flow fetch yields a payload different from the last.
	pub money_flow_update_trigger: u64,
	/// Derived results view, present once the race record reports results available.
	pub results_data: Option<ResultsData>,
	/// When the race record was last accepted.
	pub last_race_update: Option<DateTime<Utc>>,
	/// When the entrant list was last accepted.
	pub last_entrants_update: Option<DateTime<Utc>>,
	/// When pool totals were last accepted.
	pub last_pool_update: Option<DateTime<Utc>>,
	/// When derived results were last accepted.
	pub last_results_update: Option<DateTime<Utc>>,
}
impl RaceSnapshot {
	/// An empty snapshot for a race that has not yet completed its first cycle.
	pub fn empty(race_id: impl Into<String>) -> Self {
		Self {
			race_id: race_id.into(),
			race: None,
			entrants: Vec::new(),
			pools: None,
			money_flow_update_trigger: 0,
			results_data: None,
			last_race_update: None,
			last_entrants_update: None,
			last_pool_update: None,
			last_results_update: None,
		}
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn sample() -> Pools {
		Pools { currency: "NZD".into(), total_race_pool: 100.0, win_pool: 60.0, place_pool: 40.0 }
	}

	#[test]
	fn pools_decodes_bare_shape() {
		let raw = serde_json::json!({"currency": "NZD", "total_race_pool": 100.0, "win_pool": 60.0, "place_pool": 40.0});

		assert_eq!(serde_json::from_value::<Pools>(raw).unwrap(), sample());
	}

	#[test]
	fn pools_decodes_wrapped_shape() {
		let raw = serde_json::json!({
			"pools": {"currency": "NZD", "total_race_pool": 100.0, "win_pool": 60.0, "place_pool": 40.0},
		});

		assert_eq!(serde_json::from_value::<Pools>(raw).unwrap(), sample());
	}

	#[test]
	fn race_status_parses_case_insensitively_and_defaults_to_unknown() {
		assert_eq!("OPEN".parse::<RaceStatus>().unwrap(), RaceStatus::Open);
		assert_eq!("made-up".parse::<RaceStatus>().unwrap(), RaceStatus::Unknown);
	}
}
