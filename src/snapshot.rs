//! Derives `resultsData` from a race record and tracks whether it changed.

// self
use crate::{
	_prelude::*,
	model::{Dividend, Race, ResultPlacing, ResultStatus, ResultsData},
};

/// Permissively decode a field that may arrive as an already-structured JSON value
/// or as a JSON-encoded string; invalid input yields `None` rather than an error,
/// per the "never fail a cycle on a parser error" rule.
fn permissive_decode<T>(value: &serde_json::Value) -> Option<T>
where
	T: serde::de::DeserializeOwned,
{
	if let serde_json::Value::String(raw) = value {
		serde_json::from_str(raw).ok()
	} else {
		serde_json::from_value(value.clone()).ok()
	}
}

fn permissive_decode_seq<T>(value: Option<&serde_json::Value>) -> Vec<T>
where
	T: serde::de::DeserializeOwned,
{
	value.and_then(permissive_decode::<Vec<T>>).unwrap_or_default()
}

/// Derive [`ResultsData`] from a race record, iff `results_available` and a
/// results payload is present. `now` backstops a missing `result_time`.
pub fn derive_results(race: &Race, now: DateTime<Utc>) -> Option<ResultsData> {
	if !race.results_available {
		return None;
	}

	let results_data = race.results_data.as_ref()?;
	let status = race
		.result_status
		.as_deref()
		.and_then(|raw| raw.parse::<ResultStatus>().ok())
		.unwrap_or_default();
	let result_time = race.result_time.unwrap_or(now);
	let results = permissive_decode_seq::<ResultPlacing>(Some(results_data));
	let dividends = permissive_decode_seq::<Dividend>(race.dividends_data.as_ref());
	let fixed_odds = race
		.fixed_odds_data
		.as_ref()
		.and_then(permissive_decode::<Vec<serde_json::Value>>)
		.unwrap_or_default();

	Some(ResultsData { status, result_time, results, dividends, fixed_odds })
}

/// Cheap predicate over the fields that matter for deciding whether
/// `lastResultsUpdate` should advance, avoiding a full structural diff.
pub fn results_changed(previous: Option<&ResultsData>, current: &ResultsData) -> bool {
	match previous {
		None => true,
		Some(previous) => {
			previous.status != current.status
				|| previous.result_time != current.result_time
				|| previous.results.len() != current.results.len()
				|| previous.dividends.len() != current.dividends.len()
		},
	}
}
