//! Policy Contract: the capability set every policy variant
//! implements, and the Policy Action vocabulary it returns.

pub mod registry;

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use policy_core::prelude::*;

use crate::context::RequestContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMode {
	Skip,
	Process,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
	Skip,
	Buffer,
	Stream,
}

impl BodyMode {
	pub fn requires_body(self) -> bool {
		!matches!(self, BodyMode::Skip)
	}
}

/// A policy's declared processing hint (§3 "Policy Definition"). `mode()` is
/// pure; the engine uses it only at chain-build time to compute
/// `requires_request_body` / `requires_response_body` -- it is not consulted
/// per-invocation (absence of an operation is the per-call no-op signal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingMode {
	pub request_headers: HeaderMode,
	pub request_body: BodyMode,
	pub response_headers: HeaderMode,
	pub response_body: BodyMode,
}

impl Default for ProcessingMode {
	fn default() -> Self {
		ProcessingMode {
			request_headers: HeaderMode::Process,
			request_body: BodyMode::Skip,
			response_headers: HeaderMode::Process,
			response_body: BodyMode::Skip,
		}
	}
}

/// One ordered header edit. Within a single `Action`, operations for the
/// same key are applied in the order remove -> set -> append before being
/// flattened into the phase-wide op list the translator resolves (§4.7);
/// the spec doesn't constrain intra-action ordering, so this is the chosen,
/// documented convention (see DESIGN.md).
#[derive(Debug, Clone, Default)]
pub struct HeaderEdits {
	pub set: Vec<(Strng, Vec<u8>)>,
	pub append: Vec<(Strng, Vec<u8>)>,
	pub remove: Vec<Strng>,
}

pub type AnalyticsMap = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default)]
pub struct RequestMods {
	pub headers: HeaderEdits,
	pub body: Option<Bytes>,
	pub path: Option<Strng>,
	pub add_query_params: Vec<(Strng, Strng)>,
	pub analytics_metadata: AnalyticsMap,
}

#[derive(Debug, Clone, Default)]
pub struct ResponseMods {
	pub headers: HeaderEdits,
	pub body: Option<Bytes>,
	pub status_code: Option<u16>,
	pub analytics_metadata: AnalyticsMap,
}

#[derive(Debug, Clone, Default)]
pub struct ImmediateResponse {
	pub status_code: u16,
	pub headers: Vec<(Strng, Vec<u8>)>,
	pub body: Bytes,
	pub analytics_metadata: AnalyticsMap,
}

/// Policy Action (§3): a tagged variant, one per policy invocation.
#[derive(Debug, Clone)]
pub enum Action {
	UpstreamRequestMods(RequestMods),
	UpstreamResponseMods(ResponseMods),
	/// Only valid during request phases; a response-phase policy returning
	/// this is a `PolicyError` (§7), not honored as a short-circuit.
	ImmediateResponse(ImmediateResponse),
	Noop,
}

impl Action {
	pub fn is_immediate_response(&self) -> bool {
		matches!(self, Action::ImmediateResponse(_))
	}
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
	#[error("policy panicked: {0}")]
	Panicked(String),
	#[error("{0}")]
	Other(String),
}

/// Every policy is polymorphic over `{mode(), on_request_headers,
/// on_request_body, on_response_headers, on_response_body}` (§4.1). Phase
/// operations default to `Noop` -- "operations may be absent; absence is
/// equivalent to a no-op action" (§3).
#[async_trait]
pub trait Policy: Send + Sync {
	async fn on_request_headers(&self, ctx: &mut RequestContext) -> Action {
		let _ = ctx;
		Action::Noop
	}

	async fn on_request_body(&self, ctx: &mut RequestContext) -> Action {
		let _ = ctx;
		Action::Noop
	}

	async fn on_response_headers(&self, ctx: &mut RequestContext) -> Action {
		let _ = ctx;
		Action::Noop
	}

	async fn on_response_body(&self, ctx: &mut RequestContext) -> Action {
		let _ = ctx;
		Action::Noop
	}
}

/// Invokes `call`, converting a panic inside the policy into a `PolicyError`
/// rather than unwinding the stream (§4.10 "Panics inside a policy must be
/// caught and converted to a policy `error` result").
pub(crate) async fn invoke_guarded<F>(call: F) -> Result<Action, PolicyError>
where
	F: std::future::Future<Output = Action>,
{
	AssertUnwindSafe(call)
		.catch_unwind()
		.await
		.map_err(|payload| PolicyError::Panicked(panic_message(payload)))
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"non-string panic payload".to_string()
	}
}
