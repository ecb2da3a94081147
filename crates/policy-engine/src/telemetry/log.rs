//! Structured logging init (§1.1, §4.10). One span per stream, child spans
//! per phase, carrying `route_key` / `request_id` -- set up by the caller
//! (`extproc::Handler`) via `tracing::Span`; this module only wires the
//! global subscriber.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
	Json,
	Console,
}

impl std::str::FromStr for LogFormat {
	type Err = String;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"json" => Ok(LogFormat::Json),
			"console" => Ok(LogFormat::Console),
			other => Err(format!("unknown log format '{other}', expected 'json' or 'console'")),
		}
	}
}

/// Installs the global `tracing` subscriber. `level` is an `EnvFilter`
/// directive string (e.g. `info`, `policy_engine=debug,warn`).
pub fn init(level: &str, format: LogFormat) {
	let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
	let registry = tracing_subscriber::registry().with(filter);

	match format {
		LogFormat::Json => {
			registry.with(tracing_subscriber::fmt::layer().json().with_current_span(true)).init();
		}
		LogFormat::Console => {
			registry.with(tracing_subscriber::fmt::layer()).init();
		}
	}
}
