//! Analytics Emitter: serializes accumulated per-request metadata onto
//! the response envelope under a reserved filter-metadata namespace (§4.9,
//! §6, §9's `wso2.route` note).

use policy_core::prelude::*;

use crate::context::RequestContext;

/// The filter-metadata namespace analytics are emitted under. Treated as an
/// opaque constant per §9 ("the exact struct key is retained as an opaque
/// constant to be made configurable").
pub const NAMESPACE: &str = "wso2.route";

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AnalyticsPayload {
	#[serde(skip_serializing_if = "serde_json::Map::is_empty")]
	pub analytics_data: serde_json::Map<String, serde_json::Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub api_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub api_name: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub api_version: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub api_context: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub operation_path: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub api_kind: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub request_id: Option<String>,
}

pub struct Emitter;

impl Emitter {
	/// Builds the payload for the current phase response. Emits system
	/// fields only when non-empty (§4.9); failures are the caller's concern
	/// (serialization to a `prost_wkt_types::Struct` happens in `extproc`,
	/// and failures there are logged and skipped per §4.9/§4.7, never fail
	/// the transaction).
	pub fn build(ctx: &RequestContext, phase_metadata: &serde_json::Map<String, serde_json::Value>) -> AnalyticsPayload {
		let mut analytics_data = ctx.accumulated_analytics_data.clone();
		for (k, v) in phase_metadata {
			analytics_data.insert(k.clone(), v.clone());
		}

		AnalyticsPayload {
			analytics_data,
			api_id: non_empty(&ctx.api_id),
			api_name: non_empty(&ctx.api_name),
			api_version: non_empty(&ctx.api_version),
			api_context: non_empty(&ctx.api_context),
			operation_path: non_empty(&ctx.operation_path),
			api_kind: non_empty(&ctx.api_kind),
			request_id: ctx.request_id.map(|id| id.to_string()),
		}
	}
}

fn non_empty(s: &Strng) -> Option<String> {
	if s.is_empty() { None } else { Some(s.to_string()) }
}
