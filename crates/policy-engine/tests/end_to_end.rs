//! End-to-end scenarios driven through the public `config -> route
//! registry -> chain executor -> translator` pipeline rather than the gRPC
//! wire layer (that layer's own framing is covered by `extproc`'s unit
//! tests).

use std::sync::Arc;

use async_trait::async_trait;
use policy_engine::chain::{ChainExecutor, Phase};
use policy_engine::config::{ConfigLoader, RawConfig};
use policy_engine::context::RequestContext;
use policy_engine::policy::registry::{PolicyFactory, PolicyRegistry};
use policy_engine::policy::{Action, BodyMode, HeaderEdits, HeaderMode, ImmediateResponse, Policy, ProcessingMode, RequestMods, ResponseMods};
use policy_engine::route::RouteRegistry;
use policy_engine::translator::{self, BodyWireMode, HeaderDirective, PhaseResponse};
use policy_core::prelude::*;

// --- fixture policies -------------------------------------------------

struct SetHeader {
	key: &'static str,
	value: &'static str,
	append: bool,
}

#[async_trait]
impl Policy for SetHeader {
	async fn on_request_headers(&self, _ctx: &mut RequestContext) -> Action {
		let mut edits = HeaderEdits::default();
		if self.append {
			edits.append.push((Strng::from(self.key), self.value.as_bytes().to_vec()));
		} else {
			edits.set.push((Strng::from(self.key), self.value.as_bytes().to_vec()));
		}
		Action::UpstreamRequestMods(RequestMods {
			headers: edits,
			..Default::default()
		})
	}
}

struct ApiKeyAuth;

#[async_trait]
impl Policy for ApiKeyAuth {
	async fn on_request_headers(&self, ctx: &mut RequestContext) -> Action {
		if ctx.request_headers.contains_key("x-api-key") {
			return Action::Noop;
		}
		let mut analytics = serde_json::Map::new();
		analytics.insert("auth.success".into(), serde_json::json!(false));
		analytics.insert("auth.method".into(), serde_json::json!("api-key"));
		Action::ImmediateResponse(ImmediateResponse {
			status_code: 401,
			headers: vec![(Strng::from("content-type"), b"application/json".to_vec())],
			body: bytes::Bytes::from_static(br#"{"error":"Unauthorized","message":"Valid API key required"}"#),
			analytics_metadata: analytics,
		})
	}
}

struct DownstreamCounter(Arc<std::sync::atomic::AtomicUsize>);

#[async_trait]
impl Policy for DownstreamCounter {
	async fn on_request_headers(&self, _ctx: &mut RequestContext) -> Action {
		self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
		Action::Noop
	}
}

/// Flips `{"a":1}` JSON into a trivial XML-looking body; only exists to
/// exercise the body-phase mutation + content-type/content-length rewrite.
struct JsonToXml;

#[async_trait]
impl Policy for JsonToXml {
	async fn on_request_body(&self, ctx: &mut RequestContext) -> Action {
		let xml = format!("<root>{}</root>", String::from_utf8_lossy(&ctx.request_body.bytes));
		let mut edits = HeaderEdits::default();
		edits.set.push((Strng::from("content-type"), b"application/xml".to_vec()));
		Action::UpstreamRequestMods(RequestMods {
			headers: edits,
			body: Some(bytes::Bytes::from(xml)),
			..Default::default()
		})
	}
}

struct Panics;

#[async_trait]
impl Policy for Panics {
	async fn on_request_headers(&self, _ctx: &mut RequestContext) -> Action {
		panic!("boom")
	}
}

struct StatusOverride(u16);

#[async_trait]
impl Policy for StatusOverride {
	async fn on_response_headers(&self, _ctx: &mut RequestContext) -> Action {
		Action::UpstreamResponseMods(ResponseMods {
			status_code: Some(self.0),
			..Default::default()
		})
	}
}

// --- factories wired into a PolicyRegistry for the config-loader tests --

struct Factory<F>(ProcessingMode, F)
where
	F: Fn() -> Arc<dyn Policy> + Send + Sync;

impl<F> PolicyFactory for Factory<F>
where
	F: Fn() -> Arc<dyn Policy> + Send + Sync,
{
	fn mode(&self) -> ProcessingMode {
		self.0
	}
	fn build(&self, _params: &serde_json::Map<String, serde_json::Value>) -> Result<Arc<dyn Policy>, String> {
		Ok((self.1)())
	}
}

fn header_mode() -> ProcessingMode {
	ProcessingMode {
		request_headers: HeaderMode::Process,
		request_body: BodyMode::Skip,
		response_headers: HeaderMode::Process,
		response_body: BodyMode::Skip,
	}
}

fn body_mode() -> ProcessingMode {
	ProcessingMode {
		request_headers: HeaderMode::Process,
		request_body: BodyMode::Buffer,
		response_headers: HeaderMode::Process,
		response_body: BodyMode::Skip,
	}
}

// --- scenario 1: header rewrite chain -----------------------------------

#[tokio::test]
async fn header_rewrite_chain_end_to_end() {
	let registry = Arc::new(PolicyRegistry::new());
	registry
		.register("set-a1", "v1", Arc::new(Factory(header_mode(), || Arc::new(SetHeader { key: "x-a", value: "1", append: false }) as Arc<dyn Policy>)))
		.unwrap();
	registry
		.register("append-a2", "v1", Arc::new(Factory(header_mode(), || Arc::new(SetHeader { key: "x-a", value: "2", append: true }) as Arc<dyn Policy>)))
		.unwrap();
	registry
		.register("append-a3", "v1", Arc::new(Factory(header_mode(), || Arc::new(SetHeader { key: "x-a", value: "3", append: true }) as Arc<dyn Policy>)))
		.unwrap();

	let loader = ConfigLoader::new(registry);
	let raw: RawConfig = serde_json::from_value(serde_json::json!([{
		"route_key": "r1",
		"policies": [
			{"name": "set-a1", "version": "v1"},
			{"name": "append-a2", "version": "v1"},
			{"name": "append-a3", "version": "v1"},
		]
	}]))
	.unwrap();
	let config = loader.build(raw).unwrap();
	let routes = RouteRegistry::new();
	routes.replace(config.routes);

	let chain = routes.get("r1").expect("chain present");
	let mut ctx = RequestContext::new(Strng::from("r1"));
	let result = ChainExecutor::execute(&chain, Phase::RequestHeaders, &mut ctx).await;
	assert!(!result.short_circuited);

	let PhaseResponse::Continue(response) = translator::translate(&chain, Phase::RequestHeaders, &result) else {
		panic!("expected continue response")
	};
	assert_eq!(response.header_directives.len(), 3);
	assert!(matches!(&response.header_directives[0], HeaderDirective::OverwriteOrAdd(k, v) if k.as_str() == "x-a" && v == b"1"));
	assert!(matches!(&response.header_directives[1], HeaderDirective::AppendOrAdd(k, v) if k.as_str() == "x-a" && v == b"2"));
	assert!(matches!(&response.header_directives[2], HeaderDirective::AppendOrAdd(k, v) if k.as_str() == "x-a" && v == b"3"));
	assert_eq!(response.mode_override.unwrap().request_body_mode, Some(BodyWireMode::None));
}

// --- scenario 3: immediate 401 short-circuits the chain -----------------

#[tokio::test]
async fn missing_api_key_short_circuits_before_downstream_policies() {
	let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
	let hits_for_factory = hits.clone();

	let registry = Arc::new(PolicyRegistry::new());
	registry.register("api-key", "v1", Arc::new(Factory(header_mode(), || Arc::new(ApiKeyAuth) as Arc<dyn Policy>))).unwrap();
	registry
		.register(
			"downstream",
			"v1",
			Arc::new(Factory(header_mode(), move || Arc::new(DownstreamCounter(hits_for_factory.clone())) as Arc<dyn Policy>)),
		)
		.unwrap();

	let loader = ConfigLoader::new(registry);
	let raw: RawConfig = serde_json::from_value(serde_json::json!([{
		"route_key": "r1",
		"policies": [
			{"name": "api-key", "version": "v1"},
			{"name": "downstream", "version": "v1"},
			{"name": "downstream", "version": "v1"},
		]
	}]))
	.unwrap();
	let config = loader.build(raw).unwrap();
	let routes = RouteRegistry::new();
	routes.replace(config.routes);
	let chain = routes.get("r1").unwrap();

	let mut ctx = RequestContext::new(Strng::from("r1"));
	let result = ChainExecutor::execute(&chain, Phase::RequestHeaders, &mut ctx).await;
	assert!(result.short_circuited);
	assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 0, "downstream policies must not run after short-circuit");

	let PhaseResponse::Immediate(envelope) = translator::translate(&chain, Phase::RequestHeaders, &result) else {
		panic!("expected immediate response")
	};
	assert_eq!(envelope.status_code, 401);
	assert_eq!(envelope.analytics_metadata.get("auth.success"), Some(&serde_json::json!(false)));
	assert_eq!(envelope.analytics_metadata.get("auth.method"), Some(&serde_json::json!("api-key")));
}

// --- scenario 4: body transform requires BUFFERED request body mode ----

#[tokio::test]
async fn body_transform_sets_buffered_mode_and_rewrites_content() {
	let registry = Arc::new(PolicyRegistry::new());
	registry.register("json-to-xml", "v1", Arc::new(Factory(body_mode(), || Arc::new(JsonToXml) as Arc<dyn Policy>))).unwrap();

	let loader = ConfigLoader::new(registry);
	let raw: RawConfig = serde_json::from_value(serde_json::json!([{
		"route_key": "r1",
		"policies": [{"name": "json-to-xml", "version": "v1"}]
	}]))
	.unwrap();
	let config = loader.build(raw).unwrap();
	assert!(config.routes.get("r1").unwrap().requires_request_body);

	let routes = RouteRegistry::new();
	routes.replace(config.routes);
	let chain = routes.get("r1").unwrap();

	let mut ctx = RequestContext::new(Strng::from("r1"));
	let headers_result = ChainExecutor::execute(&chain, Phase::RequestHeaders, &mut ctx).await;
	let PhaseResponse::Continue(headers_response) = translator::translate(&chain, Phase::RequestHeaders, &headers_result) else {
		panic!("expected continue")
	};
	assert_eq!(headers_response.mode_override.unwrap().request_body_mode, Some(BodyWireMode::Buffered));

	ctx.request_body.set(bytes::Bytes::from_static(br#"{"a":1}"#));
	let body_result = ChainExecutor::execute(&chain, Phase::RequestBody, &mut ctx).await;
	let PhaseResponse::Continue(body_response) = translator::translate(&chain, Phase::RequestBody, &body_result) else {
		panic!("expected continue")
	};
	assert_eq!(body_response.body.as_deref(), Some(br#"<root>{"a":1}</root>"#.as_slice()));
	let content_length = body_response
		.header_directives
		.iter()
		.find(|d| matches!(d, HeaderDirective::OverwriteOrAdd(k, _) if k.as_str() == "content-length"))
		.expect("content-length recomputed");
	assert!(matches!(content_length, HeaderDirective::OverwriteOrAdd(_, v) if v == br#"<root>{"a":1}</root>"#.len().to_string().as_bytes()));
}

// --- scenario 5: config hot-swap never mixes chains mid-stream ----------

#[tokio::test]
async fn in_flight_stream_keeps_its_chain_across_a_hot_swap() {
	let registry = Arc::new(PolicyRegistry::new());
	registry
		.register("set-a1", "v1", Arc::new(Factory(header_mode(), || Arc::new(SetHeader { key: "x-a", value: "1", append: false }) as Arc<dyn Policy>)))
		.unwrap();
	registry
		.register("set-b2", "v1", Arc::new(Factory(header_mode(), || Arc::new(SetHeader { key: "x-b", value: "2", append: false }) as Arc<dyn Policy>)))
		.unwrap();
	let loader = ConfigLoader::new(registry);

	let doc_a: RawConfig = serde_json::from_value(serde_json::json!([
		{"route_key": "r", "policies": [{"name": "set-a1", "version": "v1"}]}
	]))
	.unwrap();
	let doc_b: RawConfig = serde_json::from_value(serde_json::json!([
		{"route_key": "r", "policies": [{"name": "set-b2", "version": "v1"}]}
	]))
	.unwrap();

	let routes = RouteRegistry::new();
	routes.replace(loader.build(doc_a).unwrap().routes);

	// Stream begun at T0 holds its own Arc across the swap (§8.5).
	let held_chain = routes.get("r").unwrap();

	routes.replace(loader.build(doc_b).unwrap().routes);

	let mut held_ctx = RequestContext::new(Strng::from("r"));
	let held_result = ChainExecutor::execute(&held_chain, Phase::RequestHeaders, &mut held_ctx).await;
	let PhaseResponse::Continue(held_response) = translator::translate(&held_chain, Phase::RequestHeaders, &held_result) else {
		panic!("expected continue")
	};
	assert!(matches!(&held_response.header_directives[0], HeaderDirective::OverwriteOrAdd(k, _) if k.as_str() == "x-a"));

	let new_chain = routes.get("r").unwrap();
	let mut new_ctx = RequestContext::new(Strng::from("r"));
	let new_result = ChainExecutor::execute(&new_chain, Phase::RequestHeaders, &mut new_ctx).await;
	let PhaseResponse::Continue(new_response) = translator::translate(&new_chain, Phase::RequestHeaders, &new_result) else {
		panic!("expected continue")
	};
	assert!(matches!(&new_response.header_directives[0], HeaderDirective::OverwriteOrAdd(k, _) if k.as_str() == "x-b"));
}

// --- scenario 6: no chain for a route is a registry-level no-op --------

#[tokio::test]
async fn unknown_route_has_no_chain() {
	let routes = RouteRegistry::new();
	assert!(routes.get("unknown").is_none());
}

// --- fail-closed synthesizes a 500 immediate response -------------------

#[tokio::test]
async fn fail_closed_policy_panic_synthesizes_500() {
	let registry = Arc::new(PolicyRegistry::new());
	registry.register("panics", "v1", Arc::new(Factory(header_mode(), || Arc::new(Panics) as Arc<dyn Policy>))).unwrap();

	let loader = ConfigLoader::new(registry);
	let raw: RawConfig = serde_json::from_value(serde_json::json!([{
		"route_key": "r1",
		"policies": [{"name": "panics", "version": "v1", "on_error": "fail_closed"}]
	}]))
	.unwrap();
	let config = loader.build(raw).unwrap();
	let routes = RouteRegistry::new();
	routes.replace(config.routes);
	let chain = routes.get("r1").unwrap();

	let mut ctx = RequestContext::new(Strng::from("r1"));
	let result = ChainExecutor::execute(&chain, Phase::RequestHeaders, &mut ctx).await;
	assert!(result.short_circuited);

	let PhaseResponse::Immediate(envelope) = translator::translate(&chain, Phase::RequestHeaders, &result) else {
		panic!("expected synthesized immediate response")
	};
	assert_eq!(envelope.status_code, 500);
}

// --- status_code override on the response-headers phase -----------------

#[tokio::test]
async fn response_status_override_is_last_write_wins() {
	let registry = Arc::new(PolicyRegistry::new());
	registry.register("force-404", "v1", Arc::new(Factory(header_mode(), || Arc::new(StatusOverride(404)) as Arc<dyn Policy>))).unwrap();
	registry.register("force-503", "v1", Arc::new(Factory(header_mode(), || Arc::new(StatusOverride(503)) as Arc<dyn Policy>))).unwrap();

	let loader = ConfigLoader::new(registry);
	let raw: RawConfig = serde_json::from_value(serde_json::json!([{
		"route_key": "r1",
		"policies": [
			{"name": "force-404", "version": "v1"},
			{"name": "force-503", "version": "v1"},
		]
	}]))
	.unwrap();
	let config = loader.build(raw).unwrap();
	let routes = RouteRegistry::new();
	routes.replace(config.routes);
	let chain = routes.get("r1").unwrap();

	let mut ctx = RequestContext::new(Strng::from("r1"));
	let result = ChainExecutor::execute(&chain, Phase::ResponseHeaders, &mut ctx).await;
	let PhaseResponse::Continue(response) = translator::translate(&chain, Phase::ResponseHeaders, &result) else {
		panic!("expected continue")
	};
	assert_eq!(response.status_code_override, Some(503));
}
