//! Process metrics: streams opened/closed, phase latency, policy
//! invocation/skip/error counts, short-circuit counts, config-reload
//! outcomes -- exported in Prometheus text format via `prometheus-client`.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
	pub phase: &'static str,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PolicyLabels {
	pub name: String,
	pub version: String,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReloadLabels {
	pub outcome: &'static str,
}

pub struct Metrics {
	pub streams_opened: Counter,
	pub streams_closed: Counter,
	pub phase_latency_seconds: Family<PhaseLabels, Histogram>,
	pub policy_invocations: Family<PolicyLabels, Counter>,
	pub policy_skipped: Family<PolicyLabels, Counter>,
	pub policy_errors: Family<PolicyLabels, Counter>,
	pub short_circuits: Counter,
	pub config_reloads: Family<ReloadLabels, Counter>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let streams_opened = Counter::default();
		let streams_closed = Counter::default();
		let phase_latency_seconds = Family::new_with_constructor(|| Histogram::new(prometheus_client::metrics::histogram::exponential_buckets(0.0001, 2.0, 16)));
		let policy_invocations = Family::default();
		let policy_skipped = Family::default();
		let policy_errors = Family::default();
		let short_circuits = Counter::default();
		let config_reloads = Family::default();

		registry.register("streams_opened", "ext_proc streams opened", streams_opened.clone());
		registry.register("streams_closed", "ext_proc streams closed", streams_closed.clone());
		registry.register("phase_latency_seconds", "per-phase chain execution latency", phase_latency_seconds.clone());
		registry.register("policy_invocations", "policy phase invocations", policy_invocations.clone());
		registry.register("policy_skipped", "policy phase invocations skipped by execution_condition", policy_skipped.clone());
		registry.register("policy_errors", "policy invocation errors", policy_errors.clone());
		registry.register("short_circuits", "phases that ended in an ImmediateResponse", short_circuits.clone());
		registry.register("config_reloads", "config document reload attempts", config_reloads.clone());

		Metrics {
			streams_opened,
			streams_closed,
			phase_latency_seconds,
			policy_invocations,
			policy_skipped,
			policy_errors,
			short_circuits,
			config_reloads,
		}
	}
}

/// Encodes the registry's current state in Prometheus text exposition
/// format, for `GET /metrics` (§4.12).
pub fn encode(registry: &Registry) -> Result<String, std::fmt::Error> {
	let mut buf = String::new();
	prometheus_client::encoding::text::encode(&mut buf, registry)?;
	Ok(buf)
}
