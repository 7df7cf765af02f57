//! Crate-wide error types and `Result` alias.

// self
use crate::model::Endpoint;

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the race polling coordinator.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	SystemTime(#[from] std::time::SystemTimeError),

	#[error(transparent)]
	Http(#[from] http::Error),
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[error("Cache error: {0}")]
	Cache(String),
	#[error("Request was cancelled.")]
	Aborted,
	#[error("Circuit open for race '{race_id}' endpoint {endpoint:?}.")]
	CircuitOpen { race_id: String, endpoint: Endpoint },
	#[error("Rate limit exceeded for race '{race_id}' endpoint {endpoint:?}.")]
	RateLimited { race_id: String, endpoint: Endpoint },
	#[error("Upstream HTTP status {status} from {url}: {body:?}")]
	HttpStatus { status: http::StatusCode, url: url::Url, body: Option<String> },
	#[error("Metrics error: {0}")]
	Metrics(String),
	#[error("Race '{race_id}' is not registered.")]
	NotRegistered { race_id: String },
	#[error("One or more critical endpoints failed for race '{race_id}': {reasons}")]
	CriticalFailure { race_id: String, reasons: String },
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },
}
#[cfg(feature = "metrics")]
impl<T> From<metrics::SetRecorderError<T>> for Error
where
	T: std::fmt::Display,
{
	fn from(value: metrics::SetRecorderError<T>) -> Self {
		Self::Metrics(value.to_string())
	}
}
