//! Action Translator: merges a phase's `PhaseResult` into exactly one
//! proxy response envelope (§4.7). This is where most of the engine's
//! correctness lives -- header-operation conflict resolution, body
//! last-writer-wins, path/query overrides, and the body processing-mode
//! override.

use bytes::Bytes;
use indexmap::IndexMap;
use policy_core::prelude::*;
use tracing::warn;

use crate::chain::{Phase, PhaseResult, PolicyChain};
use crate::policy::Action;

const CONTENT_LENGTH: &str = "content-length";

#[derive(Debug, Clone)]
pub enum HeaderDirective {
	Remove(Strng),
	OverwriteOrAdd(Strng, Vec<u8>),
	AppendOrAdd(Strng, Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyWireMode {
	None,
	Buffered,
}

#[derive(Debug, Clone, Copy)]
pub struct ModeOverride {
	pub request_body_mode: Option<BodyWireMode>,
	pub response_body_mode: Option<BodyWireMode>,
}

#[derive(Debug, Clone, Default)]
pub struct ContinueResponse {
	pub header_directives: Vec<HeaderDirective>,
	pub body: Option<Bytes>,
	pub path_override: Option<Strng>,
	pub query_params: Vec<(Strng, Strng)>,
	pub status_code_override: Option<u16>,
	pub mode_override: Option<ModeOverride>,
	pub analytics_metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ImmediateEnvelope {
	pub status_code: u16,
	pub headers: Vec<(Strng, Vec<u8>)>,
	pub body: Bytes,
	pub analytics_metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub enum PhaseResponse {
	Continue(ContinueResponse),
	Immediate(ImmediateEnvelope),
}

#[derive(Debug, Clone, Copy)]
enum HeaderOp<'a> {
	Set(&'a [u8]),
	Append(&'a [u8]),
	Remove,
}

/// Ordinary internal errors (e.g. analytics serialization) degrade to an
/// empty continue-response per §4.7's "Failure semantics". A panic while
/// building the response is a stronger failure mode (§4.10, §7
/// "PanicInEngine") and aborts the stream with `ImmediateResponse{500}`
/// instead.
pub fn translate(chain: &PolicyChain, phase: Phase, result: &PhaseResult) -> PhaseResponse {
	if let Some(final_action) = &result.final_action {
		if result.short_circuited {
			return build_immediate(final_action);
		}
	}

	match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| build_continue(chain, phase, result))) {
		Ok(response) => PhaseResponse::Continue(response),
		Err(_) => {
			tracing::error!("translator panicked building phase response; aborting stream with 500");
			PhaseResponse::Immediate(ImmediateEnvelope {
				status_code: 500,
				headers: Vec::new(),
				body: Bytes::new(),
				analytics_metadata: Default::default(),
			})
		}
	}
}

fn build_immediate(action: &Action) -> PhaseResponse {
	match action {
		Action::ImmediateResponse(ir) => PhaseResponse::Immediate(ImmediateEnvelope {
			status_code: ir.status_code,
			headers: ir.headers.clone(),
			body: ir.body.clone(),
			analytics_metadata: ir.analytics_metadata.clone(),
		}),
		_ => PhaseResponse::Immediate(ImmediateEnvelope {
			status_code: 500,
			headers: Vec::new(),
			body: Bytes::new(),
			analytics_metadata: Default::default(),
		}),
	}
}

fn build_continue(chain: &PolicyChain, phase: Phase, result: &PhaseResult) -> ContinueResponse {
	let is_request_phase = matches!(phase, Phase::RequestHeaders | Phase::RequestBody);

	let mut ops: IndexMap<Strng, Vec<(usize, Owned)>> = IndexMap::new();
	let mut seq = 0usize;
	let mut body: Option<Bytes> = None;
	let mut path_override: Option<Strng> = None;
	let mut query_params: Vec<(Strng, Strng)> = Vec::new();
	let mut status_code_override: Option<u16> = None;
	let mut analytics_metadata = serde_json::Map::new();

	for outcome in &result.outcomes {
		let Some(action) = &outcome.action else { continue };
		match (is_request_phase, action) {
			(true, Action::UpstreamRequestMods(mods)) => {
				collect_header_edits(&mods.headers, &mut ops, &mut seq);
				if let Some(b) = &mods.body {
					body = Some(b.clone());
				}
				if let Some(p) = &mods.path {
					path_override = Some(p.clone());
				}
				query_params.extend(mods.add_query_params.iter().cloned());
				merge_analytics(&mut analytics_metadata, &mods.analytics_metadata);
			}
			(false, Action::UpstreamResponseMods(mods)) => {
				collect_header_edits(&mods.headers, &mut ops, &mut seq);
				if let Some(b) = &mods.body {
					body = Some(b.clone());
				}
				if let Some(code) = mods.status_code {
					status_code_override = Some(code);
				}
				merge_analytics(&mut analytics_metadata, &mods.analytics_metadata);
			}
			(_, Action::Noop) => {}
			(_, Action::ImmediateResponse(_)) => {
				// Already handled by the short-circuit branch in `translate`;
				// reaching here means a response-phase policy attempted one
				// and the executor already logged/ignored it.
			}
			_ => {
				warn!("policy action type does not match phase direction; ignoring");
			}
		}
	}

	if body.is_some() {
		ops.shift_remove(&Strng::from(CONTENT_LENGTH));
	}

	let mut header_directives: Vec<HeaderDirective> = ops
		.into_iter()
		.flat_map(|(key, edits)| resolve_header_ops(key, edits))
		.collect();

	if let Some(b) = &body {
		header_directives.push(HeaderDirective::OverwriteOrAdd(
			Strng::from(CONTENT_LENGTH),
			b.len().to_string().into_bytes(),
		));
	}

	let mode_override = match phase {
		Phase::RequestHeaders => Some(ModeOverride {
			request_body_mode: Some(if chain.requires_request_body {
				BodyWireMode::Buffered
			} else {
				BodyWireMode::None
			}),
			response_body_mode: None,
		}),
		Phase::ResponseHeaders => Some(ModeOverride {
			request_body_mode: None,
			response_body_mode: Some(if chain.requires_response_body {
				BodyWireMode::Buffered
			} else {
				BodyWireMode::None
			}),
		}),
		_ => None,
	};

	// §4.7: path and query changes are surfaced via the request-headers
	// phase response only, even though a request-body policy is allowed to
	// set them on its own `UpstreamRequestMods`.
	let is_request_headers_phase = matches!(phase, Phase::RequestHeaders);

	ContinueResponse {
		header_directives,
		body,
		path_override: if is_request_headers_phase { path_override } else { None },
		query_params: if is_request_headers_phase { query_params } else { Vec::new() },
		status_code_override,
		mode_override,
		analytics_metadata,
	}
}

#[derive(Debug, Clone)]
enum Owned {
	Set(Vec<u8>),
	Append(Vec<u8>),
	Remove,
}

fn collect_header_edits(
	edits: &crate::policy::HeaderEdits,
	ops: &mut IndexMap<Strng, Vec<(usize, Owned)>>,
	seq: &mut usize,
) {
	// Intra-action convention: remove, then set, then append (see
	// policy::HeaderEdits doc comment).
	for key in &edits.remove {
		push_op(ops, seq, key, Owned::Remove);
	}
	for (key, value) in &edits.set {
		push_op(ops, seq, key, Owned::Set(value.clone()));
	}
	for (key, value) in &edits.append {
		push_op(ops, seq, key, Owned::Append(value.clone()));
	}
}

fn push_op(ops: &mut IndexMap<Strng, Vec<(usize, Owned)>>, seq: &mut usize, key: &Strng, op: Owned) {
	let lowered = Strng::from(key.as_str().to_ascii_lowercase());
	*seq += 1;
	ops.entry(lowered).or_default().push((*seq, op));
}

fn merge_analytics(into: &mut serde_json::Map<String, serde_json::Value>, from: &serde_json::Map<String, serde_json::Value>) {
	for (k, v) in from {
		into.insert(k.clone(), v.clone());
	}
}

/// Implements §4.7's header-operation conflict resolution for one key's
/// ordered operation sequence.
fn resolve_header_ops(key: Strng, mut edits: Vec<(usize, Owned)>) -> Vec<HeaderDirective> {
	edits.sort_by_key(|(seq, _)| *seq);
	let ops: Vec<HeaderOp> = edits
		.iter()
		.map(|(_, op)| match op {
			Owned::Set(v) => HeaderOp::Set(v.as_slice()),
			Owned::Append(v) => HeaderOp::Append(v.as_slice()),
			Owned::Remove => HeaderOp::Remove,
		})
		.collect();

	let Some(last) = ops.last() else {
		return Vec::new();
	};

	match last {
		HeaderOp::Remove => vec![HeaderDirective::Remove(key)],
		HeaderOp::Set(value) => vec![HeaderDirective::OverwriteOrAdd(key, value.to_vec())],
		HeaderOp::Append(_) => {
			let break_index = ops.iter().rposition(|op| matches!(op, HeaderOp::Set(_) | HeaderOp::Remove));
			let mut out = Vec::new();
			let append_start = match break_index {
				Some(idx) => {
					match ops[idx] {
						HeaderOp::Set(value) => out.push(HeaderDirective::OverwriteOrAdd(key.clone(), value.to_vec())),
						HeaderOp::Remove => {
							// discard the remove; only subsequent appends emit
						}
						HeaderOp::Append(_) => unreachable!(),
					}
					idx + 1
				}
				None => 0,
			};
			for op in &ops[append_start..] {
				if let HeaderOp::Append(value) = op {
					out.push(HeaderDirective::AppendOrAdd(key.clone(), value.to_vec()));
				}
			}
			out
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chain::{ChainEntry, OnError};
	use crate::context::RequestContext;
	use crate::policy::{HeaderEdits, Policy, ProcessingMode, RequestMods};
	use async_trait::async_trait;
	use std::sync::Arc;

	fn mods_with(edits: HeaderEdits) -> Action {
		Action::UpstreamRequestMods(RequestMods {
			headers: edits,
			..Default::default()
		})
	}

	fn outcome(idx: usize, action: Option<Action>) -> crate::chain::PolicyOutcome {
		crate::chain::PolicyOutcome {
			policy_index: idx,
			name: Strng::from("p"),
			version: Strng::from("v1"),
			skipped: false,
			action,
			error: None,
		}
	}

	struct Noop;
	#[async_trait]
	impl Policy for Noop {}

	fn chain() -> PolicyChain {
		PolicyChain::build(
			Strng::from("r1"),
			vec![ChainEntry {
				name: Strng::from("p"),
				version: Strng::from("v1"),
				mode: ProcessingMode::default(),
				execution_condition: None,
				on_error: OnError::Continue,
				policy: Arc::new(Noop),
			}],
		)
	}

	#[test]
	fn scenario_header_rewrite_chain() {
		let mut e1 = HeaderEdits::default();
		e1.set.push((Strng::from("x-a"), b"1".to_vec()));
		let mut e2 = HeaderEdits::default();
		e2.append.push((Strng::from("x-a"), b"2".to_vec()));
		let mut e3 = HeaderEdits::default();
		e3.append.push((Strng::from("x-a"), b"3".to_vec()));

		let result = PhaseResult {
			phase: Phase::RequestHeaders,
			outcomes: vec![
				outcome(0, Some(mods_with(e1))),
				outcome(1, Some(mods_with(e2))),
				outcome(2, Some(mods_with(e3))),
			],
			short_circuited: false,
			final_action: None,
		};

		let c = chain();
		let response = translate(&c, Phase::RequestHeaders, &result);
		let PhaseResponse::Continue(cr) = response else {
			panic!("expected continue response")
		};
		assert_eq!(cr.header_directives.len(), 3);
		assert!(matches!(cr.header_directives[0], HeaderDirective::OverwriteOrAdd(_, ref v) if v == b"1"));
		assert!(matches!(cr.header_directives[1], HeaderDirective::AppendOrAdd(_, ref v) if v == b"2"));
		assert!(matches!(cr.header_directives[2], HeaderDirective::AppendOrAdd(_, ref v) if v == b"3"));
		assert_eq!(cr.mode_override.unwrap().request_body_mode, Some(BodyWireMode::None));
	}

	#[test]
	fn scenario_set_then_remove() {
		let mut e1 = HeaderEdits::default();
		e1.set.push((Strng::from("x-a"), b"1".to_vec()));
		let mut e2 = HeaderEdits::default();
		e2.remove.push(Strng::from("x-a"));

		let result = PhaseResult {
			phase: Phase::RequestHeaders,
			outcomes: vec![outcome(0, Some(mods_with(e1))), outcome(1, Some(mods_with(e2)))],
			short_circuited: false,
			final_action: None,
		};
		let c = chain();
		let PhaseResponse::Continue(cr) = translate(&c, Phase::RequestHeaders, &result) else {
			panic!("expected continue")
		};
		assert_eq!(cr.header_directives.len(), 1);
		assert!(matches!(cr.header_directives[0], HeaderDirective::Remove(_)));
	}

	#[test]
	fn append_after_remove_discards_the_remove() {
		let mut e1 = HeaderEdits::default();
		e1.remove.push(Strng::from("x-a"));
		let mut e2 = HeaderEdits::default();
		e2.append.push((Strng::from("x-a"), b"1".to_vec()));

		let result = PhaseResult {
			phase: Phase::RequestHeaders,
			outcomes: vec![outcome(0, Some(mods_with(e1))), outcome(1, Some(mods_with(e2)))],
			short_circuited: false,
			final_action: None,
		};
		let c = chain();
		let PhaseResponse::Continue(cr) = translate(&c, Phase::RequestHeaders, &result) else {
			panic!("expected continue")
		};
		assert_eq!(cr.header_directives.len(), 1);
		assert!(matches!(cr.header_directives[0], HeaderDirective::AppendOrAdd(_, ref v) if v == b"1"));
	}

	#[test]
	fn body_change_recomputes_content_length_and_strips_policy_value() {
		let mut e1 = HeaderEdits::default();
		e1.set.push((Strng::from("content-length"), b"999".to_vec()));
		let action = Action::UpstreamRequestMods(RequestMods {
			headers: e1,
			body: Some(Bytes::from_static(b"hello")),
			..Default::default()
		});
		let result = PhaseResult {
			phase: Phase::RequestBody,
			outcomes: vec![outcome(0, Some(action))],
			short_circuited: false,
			final_action: None,
		};
		let c = chain();
		let PhaseResponse::Continue(cr) = translate(&c, Phase::RequestBody, &result) else {
			panic!("expected continue")
		};
		assert_eq!(cr.body.as_deref(), Some(b"hello".as_slice()));
		let cl = cr
			.header_directives
			.iter()
			.find(|d| matches!(d, HeaderDirective::OverwriteOrAdd(k, _) if k.as_str() == "content-length"))
			.unwrap();
		assert!(matches!(cl, HeaderDirective::OverwriteOrAdd(_, v) if v == b"5"));
	}

	#[test]
	fn case_insensitive_header_keys_collapse_to_one_directive() {
		let mut e1 = HeaderEdits::default();
		e1.set.push((Strng::from("X-A"), b"1".to_vec()));
		let mut e2 = HeaderEdits::default();
		e2.set.push((Strng::from("x-a"), b"2".to_vec()));

		let result = PhaseResult {
			phase: Phase::RequestHeaders,
			outcomes: vec![outcome(0, Some(mods_with(e1))), outcome(1, Some(mods_with(e2)))],
			short_circuited: false,
			final_action: None,
		};
		let c = chain();
		let PhaseResponse::Continue(cr) = translate(&c, Phase::RequestHeaders, &result) else {
			panic!("expected continue")
		};
		assert_eq!(cr.header_directives.len(), 1);
		assert!(matches!(cr.header_directives[0], HeaderDirective::OverwriteOrAdd(_, ref v) if v == b"2"));
	}
}
