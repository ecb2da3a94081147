//! Stream Handler / Execution Context: the bidirectional ext_proc gRPC
//! server. One task per stream drives the phase state machine, binding the
//! shared request context to the resolved chain and the translator. The
//! engine acts as the ext_proc server side of the protocol, accepting a
//! bidirectional stream from the proxy rather than dialing out to one.

use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use policy_core::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::Instrument;

use policy_proto::external_processor_server::ExternalProcessor;
use policy_proto::processing_mode::{BodySendMode, HeaderSendMode};
use policy_proto::processing_request::Request as ReqOneof;
use policy_proto::processing_response::Response as RespOneof;
use policy_proto::{
	BodyResponse, CommonResponse, HeaderMutation, HeaderValue, HeaderValueOption, HeadersResponse, ImmediateResponse as ProtoImmediateResponse,
	ProcessingMode as ProtoProcessingMode, ProcessingRequest, ProcessingResponse,
};

use crate::analytics::Emitter;
use crate::chain::{ChainExecutor, Phase, PolicyChain};
use crate::context::{RequestContext, RouteAttributes};
use crate::route::RouteRegistry;
use crate::telemetry::metrics::{Metrics, PhaseLabels, PolicyLabels};
use crate::translator::{self, BodyWireMode, HeaderDirective, PhaseResponse};

pub struct Handler {
	routes: Arc<RouteRegistry>,
	metrics: Arc<Metrics>,
}

impl Handler {
	pub fn new(routes: Arc<RouteRegistry>, metrics: Arc<Metrics>) -> Self {
		Handler { routes, metrics }
	}
}

type ResponseStream = Pin<Box<dyn Stream<Item = Result<ProcessingResponse, Status>> + Send + 'static>>;

impl ExternalProcessor for Handler {
	type ProcessStream = ResponseStream;

	async fn process(&self, request: Request<Streaming<ProcessingRequest>>) -> Result<Response<Self::ProcessStream>, Status> {
		let inbound = request.into_inner();
		let routes = self.routes.clone();
		let metrics = self.metrics.clone();
		let (tx, rx) = mpsc::channel(16);

		tokio::spawn(drive_stream(inbound, tx, routes, metrics).instrument(tracing::info_span!("ext_proc_stream")));

		let out = ReceiverStream::new(rx);
		Ok(Response::new(Box::pin(out)))
	}
}

async fn next_request(inbound: &mut Streaming<ProcessingRequest>) -> Option<ProcessingRequest> {
	match inbound.message().await {
		Ok(Some(msg)) => Some(msg),
		Ok(None) => None,
		Err(status) => {
			tracing::warn!(error = %status, "ext_proc stream read error; aborting");
			None
		}
	}
}

/// Drives one stream end to end. Every early return corresponds to an ABORT
/// or DONE transition in §4.8's state diagram; the task simply stops
/// sending, which closes the gRPC response stream.
async fn drive_stream(mut inbound: Streaming<ProcessingRequest>, tx: mpsc::Sender<Result<ProcessingResponse, Status>>, routes: Arc<RouteRegistry>, metrics: Arc<Metrics>) {
	metrics.streams_opened.inc();

	let Some(first) = next_request(&mut inbound).await else {
		metrics.streams_closed.inc();
		return;
	};
	let route_ctx = first.route_context.clone().unwrap_or_default();
	let Some(ReqOneof::RequestHeaders(req_headers)) = first.request else {
		let _ = tx.send(Err(Status::invalid_argument("first message must be request_headers"))).await;
		metrics.streams_closed.inc();
		return;
	};

	// NO_CHAIN: respond with a skip-all envelope; no context beyond what's
	// needed to log (§4.3, §4.8, scenario §8.6).
	let Some(chain) = routes.get(&route_ctx.route_key) else {
		tracing::info!(route_key = %route_ctx.route_key, "no chain for route; responding skip-all");
		let _ = tx.send(Ok(skip_all_response())).await;
		metrics.streams_closed.inc();
		return;
	};

	let mut ctx = RequestContext::new(Strng::from(route_ctx.route_key.as_str())).with_attributes(RouteAttributes {
		api_id: Strng::from(route_ctx.api_id.as_str()),
		api_name: Strng::from(route_ctx.api_name.as_str()),
		api_version: Strng::from(route_ctx.api_version.as_str()),
		api_context: Strng::from(route_ctx.api_context.as_str()),
		operation_path: Strng::from(route_ctx.operation_path.as_str()),
		api_kind: Strng::from(route_ctx.api_kind.as_str()),
	});
	ctx.ensure_request_id();
	apply_inbound_headers(&mut ctx, HeaderSide::Request, req_headers.headers.as_ref());

	let span = tracing::info_span!("stream", route_key = %chain.route_key, request_id = ?ctx.request_id);
	drive_chain(chain, ctx, &mut inbound, &tx, &metrics).instrument(span).await;
	metrics.streams_closed.inc();
}

/// The request-headers-through-response-body sequence for a stream with a
/// resolved chain. Split out of `drive_stream` so the per-stream span can
/// wrap it with `.instrument()` instead of holding an `Entered` guard across
/// await points.
async fn drive_chain(
	chain: Arc<PolicyChain>,
	mut ctx: RequestContext,
	inbound: &mut Streaming<ProcessingRequest>,
	tx: &mpsc::Sender<Result<ProcessingResponse, Status>>,
	metrics: &Metrics,
) {
	let (response, short_circuited) = run_phase(&chain, Phase::RequestHeaders, &mut ctx, metrics).await;
	if tx.send(Ok(response)).await.is_err() || short_circuited {
		return;
	}

	if chain.requires_request_body {
		let Some(next) = next_request(inbound).await else { return };
		match next.request {
			Some(ReqOneof::RequestBody(body)) => {
				ctx.request_body.set(Bytes::from(body.body));
				let (response, short_circuited) = run_phase(&chain, Phase::RequestBody, &mut ctx, metrics).await;
				if tx.send(Ok(response)).await.is_err() || short_circuited {
					return;
				}
			}
			_ => {
				let _ = tx.send(Err(Status::invalid_argument("expected request_body"))).await;
				return;
			}
		}
	}

	let Some(next) = next_request(inbound).await else { return };
	match next.request {
		Some(ReqOneof::ResponseHeaders(resp_headers)) => {
			apply_inbound_headers(&mut ctx, HeaderSide::Response, resp_headers.headers.as_ref());
			let (response, short_circuited) = run_phase(&chain, Phase::ResponseHeaders, &mut ctx, metrics).await;
			if tx.send(Ok(response)).await.is_err() || short_circuited {
				return;
			}
		}
		_ => {
			let _ = tx.send(Err(Status::invalid_argument("expected response_headers"))).await;
			return;
		}
	}

	if chain.requires_response_body {
		if let Some(next) = next_request(inbound).await {
			match next.request {
				Some(ReqOneof::ResponseBody(body)) => {
					ctx.response_body.set(Bytes::from(body.body));
					let (response, _short_circuited) = run_phase(&chain, Phase::ResponseBody, &mut ctx, metrics).await;
					let _ = tx.send(Ok(response)).await;
				}
				_ => {
					let _ = tx.send(Err(Status::invalid_argument("expected response_body"))).await;
				}
			}
		}
	}
}

async fn run_phase(chain: &PolicyChain, phase: Phase, ctx: &mut RequestContext, metrics: &Metrics) -> (ProcessingResponse, bool) {
	let start = std::time::Instant::now();
	let result = ChainExecutor::execute(chain, phase, ctx)
		.instrument(tracing::info_span!("phase", phase = phase_name(phase)))
		.await;

	for outcome in &result.outcomes {
		let labels = PolicyLabels {
			name: outcome.name.to_string(),
			version: outcome.version.to_string(),
		};
		if outcome.skipped {
			metrics.policy_skipped.get_or_create(&labels).inc();
			continue;
		}
		metrics.policy_invocations.get_or_create(&labels).inc();
		if outcome.error.is_some() {
			metrics.policy_errors.get_or_create(&labels).inc();
		}
	}
	let phase_response = translator::translate(chain, phase, &result);
	// A translator panic synthesizes its own `Immediate{500}` (§4.10) even
	// when the chain executor never short-circuited; either source of an
	// immediate response stops the stream the same way.
	let short_circuited = result.short_circuited || matches!(phase_response, PhaseResponse::Immediate(_));
	if short_circuited {
		metrics.short_circuits.inc();
	}
	metrics
		.phase_latency_seconds
		.get_or_create(&PhaseLabels { phase: phase_name(phase) })
		.observe(start.elapsed().as_secs_f64());

	let analytics = match &phase_response {
		PhaseResponse::Continue(c) => Emitter::build(ctx, &c.analytics_metadata),
		PhaseResponse::Immediate(i) => Emitter::build(ctx, &i.analytics_metadata),
	};
	ctx.merge_analytics(&analytics.analytics_data);

	(to_proto_response(phase, phase_response, &analytics, ctx.path.as_str()), short_circuited)
}

fn phase_name(phase: Phase) -> &'static str {
	match phase {
		Phase::RequestHeaders => "request_headers",
		Phase::RequestBody => "request_body",
		Phase::ResponseHeaders => "response_headers",
		Phase::ResponseBody => "response_body",
	}
}

/// Which side's `HeaderMap` ordinary (non-pseudo) headers land in.
#[derive(Clone, Copy)]
enum HeaderSide {
	Request,
	Response,
}

/// Applies an ext_proc `HeaderMap` to `ctx`. Pseudo-headers (`:method`,
/// `:path`, ...) aren't valid `http::HeaderName`s, so they're classified
/// first and routed to the matching `RequestContext` field; anything not
/// modeled there (`:authority`, `:scheme`, `:status`) is dropped, same as an
/// unmatched variant would be. Everything else is a normal header, appended
/// to the request or response `HeaderMap` per `side`.
fn apply_inbound_headers(ctx: &mut RequestContext, side: HeaderSide, headers: Option<&policy_proto::HeaderMap>) {
	let Some(headers) = headers else { return };
	for h in &headers.headers {
		match h.key.as_str() {
			":method" => ctx.method = Strng::from(String::from_utf8_lossy(&h.raw_value).into_owned()),
			":path" => ctx.path = Strng::from(String::from_utf8_lossy(&h.raw_value).into_owned()),
			key if key.starts_with(':') => {}
			_ => {
				let Ok(name) = http::HeaderName::from_bytes(h.key.as_bytes()) else { continue };
				let Ok(value) = http::HeaderValue::from_bytes(&h.raw_value) else { continue };
				let into = match side {
					HeaderSide::Request => &mut ctx.request_headers,
					HeaderSide::Response => &mut ctx.response_headers,
				};
				into.append(name, value);
			}
		}
	}
}

fn header_mutation_proto(directives: &[HeaderDirective]) -> HeaderMutation {
	let mut set_headers = Vec::new();
	let mut remove_headers = Vec::new();
	for directive in directives {
		match directive {
			HeaderDirective::Remove(key) => remove_headers.push(key.to_string()),
			HeaderDirective::OverwriteOrAdd(key, value) => set_headers.push(HeaderValueOption {
				header: Some(HeaderValue {
					key: key.to_string(),
					raw_value: value.clone(),
				}),
				append_action: policy_proto::header_value_option::HeaderAppendAction::OverwriteIfExistsOrAdd as i32,
			}),
			HeaderDirective::AppendOrAdd(key, value) => set_headers.push(HeaderValueOption {
				header: Some(HeaderValue {
					key: key.to_string(),
					raw_value: value.clone(),
				}),
				append_action: policy_proto::header_value_option::HeaderAppendAction::AppendIfExistsOrAdd as i32,
			}),
		}
	}
	HeaderMutation { set_headers, remove_headers }
}

fn body_send_mode(mode: BodyWireMode) -> BodySendMode {
	match mode {
		BodyWireMode::None => BodySendMode::None,
		BodyWireMode::Buffered => BodySendMode::Buffered,
	}
}

fn mode_override_proto(mode_override: Option<translator::ModeOverride>) -> Option<ProtoProcessingMode> {
	let mode_override = mode_override?;
	Some(ProtoProcessingMode {
		request_header_mode: HeaderSendMode::Default as i32,
		request_body_mode: mode_override.request_body_mode.map(body_send_mode).unwrap_or(BodySendMode::None) as i32,
		response_header_mode: HeaderSendMode::Default as i32,
		response_body_mode: mode_override.response_body_mode.map(body_send_mode).unwrap_or(BodySendMode::None) as i32,
		// Trailers are out of this spec's contract (§9); always SKIP.
		request_trailer_mode: HeaderSendMode::Skip as i32,
		response_trailer_mode: HeaderSendMode::Skip as i32,
	})
}

fn analytics_struct(payload: &crate::analytics::AnalyticsPayload) -> Option<prost_wkt_types::Struct> {
	let value = serde_json::to_value(payload).ok()?;
	match serde_json::from_value(value) {
		Ok(s) => Some(s),
		Err(e) => {
			tracing::warn!(error = %e, "failed to serialize analytics metadata; omitting from response");
			None
		}
	}
}

fn to_proto_response(phase: Phase, response: PhaseResponse, analytics: &crate::analytics::AnalyticsPayload, original_path: &str) -> ProcessingResponse {
	let dynamic_metadata = analytics_struct(analytics);

	let oneof = match response {
		PhaseResponse::Immediate(envelope) => {
			return ProcessingResponse {
				response: Some(RespOneof::ImmediateResponse(ProtoImmediateResponse {
					status: Some(policy_proto::HttpStatus { code: envelope.status_code as u32 }),
					headers: Some(HeaderMutation {
						set_headers: envelope
							.headers
							.into_iter()
							.map(|(k, v)| HeaderValueOption {
								header: Some(HeaderValue { key: k.to_string(), raw_value: v }),
								append_action: policy_proto::header_value_option::HeaderAppendAction::OverwriteIfExistsOrAdd as i32,
							})
							.collect(),
						remove_headers: Vec::new(),
					}),
					body: envelope.body.to_vec(),
					grpc_status: None,
					details: String::new(),
				})),
				dynamic_metadata,
			};
		}
		PhaseResponse::Continue(c) => {
			let mut directives = c.header_directives;
			// Path/query and response-status overrides have no dedicated proto
			// field in this schema; follow the common ext_proc convention of
			// carrying them as pseudo-header mutations (§4.7).
			if c.path_override.is_some() || !c.query_params.is_empty() {
				let mut path = c.path_override.map(|p| p.to_string()).unwrap_or_else(|| original_path.to_string());
				if !path.is_empty() {
					if !c.query_params.is_empty() {
						let qs: Vec<String> = c.query_params.iter().map(|(k, v)| format!("{k}={v}")).collect();
						let sep = if path.contains('?') { "&" } else { "?" };
						path.push_str(sep);
						path.push_str(&qs.join("&"));
					}
					directives.push(HeaderDirective::OverwriteOrAdd(Strng::from(":path"), path.into_bytes()));
				}
			}
			if let Some(code) = c.status_code_override {
				directives.push(HeaderDirective::OverwriteOrAdd(Strng::from(":status"), code.to_string().into_bytes()));
			}

			let common = CommonResponse {
				status: policy_proto::common_response::ResponseStatus::Continue as i32,
				header_mutation: Some(header_mutation_proto(&directives)),
				body_mutation: c.body.map(|b| policy_proto::BodyMutation {
					mutation: Some(policy_proto::body_mutation::Mutation::Body(b.to_vec())),
				}),
				mode_override: mode_override_proto(c.mode_override),
			};
			match phase {
				Phase::RequestHeaders => RespOneof::RequestHeaders(HeadersResponse { response: Some(common) }),
				Phase::RequestBody => RespOneof::RequestBody(BodyResponse { response: Some(common) }),
				Phase::ResponseHeaders => RespOneof::ResponseHeaders(HeadersResponse { response: Some(common) }),
				Phase::ResponseBody => RespOneof::ResponseBody(BodyResponse { response: Some(common) }),
			}
		}
	};

	ProcessingResponse {
		response: Some(oneof),
		dynamic_metadata,
	}
}

/// §4.8 NO_CHAIN / scenario §8.6: skip all subsequent phases, all body and
/// trailer modes SKIP/NONE.
fn skip_all_response() -> ProcessingResponse {
	ProcessingResponse {
		response: Some(RespOneof::RequestHeaders(HeadersResponse {
			response: Some(CommonResponse {
				status: policy_proto::common_response::ResponseStatus::Continue as i32,
				header_mutation: None,
				body_mutation: None,
				mode_override: Some(ProtoProcessingMode {
					request_header_mode: HeaderSendMode::Default as i32,
					request_body_mode: BodySendMode::None as i32,
					response_header_mode: HeaderSendMode::Default as i32,
					response_body_mode: BodySendMode::None as i32,
					request_trailer_mode: HeaderSendMode::Skip as i32,
					response_trailer_mode: HeaderSendMode::Skip as i32,
				}),
			}),
		})),
		dynamic_metadata: None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn skip_all_response_has_none_body_modes() {
		let ProcessingResponse { response: Some(RespOneof::RequestHeaders(h)), .. } = skip_all_response() else {
			panic!("expected request_headers response")
		};
		let mode = h.response.unwrap().mode_override.unwrap();
		assert_eq!(mode.request_body_mode, BodySendMode::None as i32);
		assert_eq!(mode.response_body_mode, BodySendMode::None as i32);
	}

	#[test]
	fn header_mutation_translates_remove_and_overwrite() {
		let directives = vec![
			HeaderDirective::Remove(Strng::from("x-a")),
			HeaderDirective::OverwriteOrAdd(Strng::from("x-b"), b"1".to_vec()),
		];
		let mutation = header_mutation_proto(&directives);
		assert_eq!(mutation.remove_headers, vec!["x-a".to_string()]);
		assert_eq!(mutation.set_headers.len(), 1);
	}
}
