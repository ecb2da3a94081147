//! Policy Chain Executor and the Policy Chain data type itself.
//! Runs one phase of a chain, honoring `execution_condition`, short-circuit,
//! and fail-open/fail-closed semantics (§4.5).

use std::sync::Arc;

use policy_core::prelude::*;
use tracing::warn;

use crate::condition::Condition;
use crate::context::RequestContext;
use crate::policy::{Action, ImmediateResponse, Policy, ProcessingMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
	Continue,
	FailClosed,
}

impl Default for OnError {
	fn default() -> Self {
		OnError::Continue
	}
}

/// One member of a built chain: the resolved policy instance plus the
/// per-spec config that governs how the executor treats it.
pub struct ChainEntry {
	pub name: Strng,
	pub version: Strng,
	pub mode: ProcessingMode,
	pub execution_condition: Option<Condition>,
	pub on_error: OnError,
	pub policy: Arc<dyn Policy>,
}

/// Ordered sequence of Policy Instances bound to one route key, built once
/// per route at configuration-apply time (§3).
pub struct PolicyChain {
	pub route_key: Strng,
	pub entries: Vec<ChainEntry>,
	pub requires_request_body: bool,
	pub requires_response_body: bool,
}

impl PolicyChain {
	pub fn build(route_key: Strng, entries: Vec<ChainEntry>) -> Self {
		let requires_request_body = entries.iter().any(|e| e.mode.request_body.requires_body());
		let requires_response_body = entries.iter().any(|e| e.mode.response_body.requires_body());
		PolicyChain {
			route_key,
			entries,
			requires_request_body,
			requires_response_body,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	RequestHeaders,
	RequestBody,
	ResponseHeaders,
	ResponseBody,
}

impl Phase {
	fn is_request_phase(self) -> bool {
		matches!(self, Phase::RequestHeaders | Phase::RequestBody)
	}
}

pub struct PolicyOutcome {
	pub policy_index: usize,
	pub name: Strng,
	pub version: Strng,
	pub skipped: bool,
	pub action: Option<Action>,
	pub error: Option<String>,
}

pub struct PhaseResult {
	pub phase: Phase,
	pub outcomes: Vec<PolicyOutcome>,
	pub short_circuited: bool,
	pub final_action: Option<Action>,
}

pub struct ChainExecutor;

impl ChainExecutor {
	pub async fn execute(chain: &PolicyChain, phase: Phase, ctx: &mut RequestContext) -> PhaseResult {
		let mut outcomes = Vec::with_capacity(chain.entries.len());
		let mut short_circuited = false;
		let mut final_action = None;

		for (policy_index, entry) in chain.entries.iter().enumerate() {
			if let Some(condition) = &entry.execution_condition {
				match condition.eval(ctx) {
					Ok(true) => {}
					Ok(false) => {
						outcomes.push(PolicyOutcome {
							policy_index,
							name: entry.name.clone(),
							version: entry.version.clone(),
							skipped: true,
							action: None,
							error: None,
						});
						continue;
					}
					Err(e) => {
						warn!(
							policy = %entry.name,
							version = %entry.version,
							error = %e,
							"execution_condition failed to evaluate; skipping policy for this phase"
						);
						outcomes.push(PolicyOutcome {
							policy_index,
							name: entry.name.clone(),
							version: entry.version.clone(),
							skipped: true,
							action: None,
							error: None,
						});
						continue;
					}
				}
			}

			let call = match phase {
				Phase::RequestHeaders => entry.policy.on_request_headers(ctx),
				Phase::RequestBody => entry.policy.on_request_body(ctx),
				Phase::ResponseHeaders => entry.policy.on_response_headers(ctx),
				Phase::ResponseBody => entry.policy.on_response_body(ctx),
			};

			match crate::policy::invoke_guarded(call).await {
				Ok(action) if action.is_immediate_response() && !phase.is_request_phase() => {
					// §3: ImmediateResponse is only valid during request phases.
					warn!(
						policy = %entry.name,
						version = %entry.version,
						"policy returned ImmediateResponse during a response phase; ignoring"
					);
					outcomes.push(PolicyOutcome {
						policy_index,
						name: entry.name.clone(),
						version: entry.version.clone(),
						skipped: false,
						action: None,
						error: Some("ImmediateResponse is invalid during response phases".to_string()),
					});
				}
				Ok(action @ Action::ImmediateResponse(_)) => {
					outcomes.push(PolicyOutcome {
						policy_index,
						name: entry.name.clone(),
						version: entry.version.clone(),
						skipped: false,
						action: Some(action.clone()),
						error: None,
					});
					short_circuited = true;
					final_action = Some(action);
					break;
				}
				Ok(action) => {
					outcomes.push(PolicyOutcome {
						policy_index,
						name: entry.name.clone(),
						version: entry.version.clone(),
						skipped: false,
						action: Some(action),
						error: None,
					});
				}
				Err(e) => {
					tracing::error!(
						policy = %entry.name,
						version = %entry.version,
						error = %e,
						"policy invocation failed"
					);
					if entry.on_error == OnError::FailClosed {
						let synthesized = ImmediateResponse {
							status_code: 500,
							headers: Vec::new(),
							body: bytes::Bytes::new(),
							analytics_metadata: Default::default(),
						};
						outcomes.push(PolicyOutcome {
							policy_index,
							name: entry.name.clone(),
							version: entry.version.clone(),
							skipped: false,
							action: None,
							error: Some(e.to_string()),
						});
						short_circuited = true;
						final_action = Some(Action::ImmediateResponse(synthesized));
						break;
					}
					outcomes.push(PolicyOutcome {
						policy_index,
						name: entry.name.clone(),
						version: entry.version.clone(),
						skipped: false,
						action: None,
						error: Some(e.to_string()),
					});
				}
			}
		}

		PhaseResult {
			phase,
			outcomes,
			short_circuited,
			final_action,
		}
	}
}
