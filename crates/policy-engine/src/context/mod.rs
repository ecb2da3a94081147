//! Shared Request Context: per-transaction state carried across
//! phases. Owned by exactly one task for the lifetime of the stream --
//! no cross-stream sharing, no thread-locals (§9 "per-stream mutable
//! context passed explicitly").

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http::HeaderMap;
use policy_core::prelude::*;
use uuid::Uuid;

/// A phase's body buffer. Absence (`present = false`) is a valid state that
/// policies must handle -- it means the chain did not require this body.
#[derive(Debug, Clone, Default)]
pub struct BodyBuffer {
	pub present: bool,
	pub bytes: Bytes,
}

impl BodyBuffer {
	pub fn set(&mut self, bytes: Bytes) {
		self.present = true;
		self.bytes = bytes;
	}
}

/// Cooperative cancellation signal, shared between the stream handler and
/// any in-flight policy I/O (§5 "Cancellation").
#[derive(Clone, Default)]
pub struct CancellationHandle(Arc<AtomicBool>);

impl CancellationHandle {
	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

/// Route/API attributes extracted at stream init from the ext_proc
/// attributes' `wso2.route` sub-struct.
#[derive(Debug, Clone, Default)]
pub struct RouteAttributes {
	pub api_id: Strng,
	pub api_name: Strng,
	pub api_version: Strng,
	pub api_context: Strng,
	pub operation_path: Strng,
	pub api_kind: Strng,
}

pub struct RequestContext {
	pub request_id: Option<Uuid>,
	pub route_key: Strng,
	pub api_id: Strng,
	pub api_name: Strng,
	pub api_version: Strng,
	pub api_context: Strng,
	pub operation_path: Strng,
	pub api_kind: Strng,
	pub method: Strng,
	pub path: Strng,

	pub request_headers: HeaderMap,
	pub request_body: BodyBuffer,
	pub response_headers: HeaderMap,
	pub response_body: BodyBuffer,

	/// Mutable scratch used both for cross-phase policy communication (e.g.
	/// `auth.success`) and as input to the analytics emitter.
	pub metadata: serde_json::Map<String, serde_json::Value>,
	/// Merged across phases, last-write-wins per key (§3).
	pub accumulated_analytics_data: serde_json::Map<String, serde_json::Value>,

	pub cancellation: CancellationHandle,
}

impl RequestContext {
	/// Allocated lazily on the request-headers phase (§4.6), once a chain is
	/// known to exist for the route.
	pub fn new(route_key: Strng) -> Self {
		RequestContext {
			request_id: None,
			route_key,
			api_id: Strng::from(""),
			api_name: Strng::from(""),
			api_version: Strng::from(""),
			api_context: Strng::from(""),
			operation_path: Strng::from(""),
			api_kind: Strng::from(""),
			method: Strng::from(""),
			path: Strng::from(""),
			request_headers: HeaderMap::new(),
			request_body: BodyBuffer::default(),
			response_headers: HeaderMap::new(),
			response_body: BodyBuffer::default(),
			metadata: serde_json::Map::new(),
			accumulated_analytics_data: serde_json::Map::new(),
			cancellation: CancellationHandle::default(),
		}
	}

	pub fn with_attributes(mut self, attrs: RouteAttributes) -> Self {
		self.api_id = attrs.api_id;
		self.api_name = attrs.api_name;
		self.api_version = attrs.api_version;
		self.api_context = attrs.api_context;
		self.operation_path = attrs.operation_path;
		self.api_kind = attrs.api_kind;
		self
	}

	/// `request_id` is assigned exactly once per stream (§3 invariant a).
	pub fn ensure_request_id(&mut self) -> Uuid {
		*self.request_id.get_or_insert_with(Uuid::new_v4)
	}

	pub fn merge_analytics(&mut self, data: &serde_json::Map<String, serde_json::Value>) {
		for (k, v) in data {
			self.accumulated_analytics_data.insert(k.clone(), v.clone());
		}
	}
}
