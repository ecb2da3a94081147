//! `execution_condition` evaluation: a CEL boolean expression evaluated
//! against a flat variable set built from the shared request context at
//! phase entry (`request.*`, `metadata.*`, `api.*`).

use std::collections::HashMap;
use std::sync::Arc;

use cel::objects::{Key, Map as CelMap};
use cel::{Context, Program, Value};
use policy_core::prelude::*;

use crate::context::RequestContext;

#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
	#[error("invalid execution_condition: {0}")]
	Parse(String),
	#[error("execution_condition did not evaluate to a boolean")]
	NotBoolean,
	#[error("execution_condition evaluation failed: {0}")]
	Eval(String),
}

/// A compiled `execution_condition`. Parsing happens once, at config-load
/// time (§4.4); a parse failure there is `InvalidPolicyParams`, never a
/// per-request surprise.
pub struct Condition {
	source: Strng,
	program: Program,
}

impl Condition {
	pub fn compile(source: &str) -> Result<Self, ConditionError> {
		let program = Program::compile(source).map_err(|e| ConditionError::Parse(e.to_string()))?;
		Ok(Condition {
			source: Strng::from(source),
			program,
		})
	}

	pub fn source(&self) -> &str {
		self.source.as_str()
	}

	/// Evaluates the condition against `ctx`. Per §3.1, a run-time failure
	/// (missing variable, type mismatch) degrades to `Ok(false)` at the call
	/// site in the chain executor, not here -- this returns the raw error so
	/// the caller can log it once before degrading.
	pub fn eval(&self, ctx: &RequestContext) -> Result<bool, ConditionError> {
		let mut context = Context::default();
		context
			.add_variable("request", request_value(ctx))
			.map_err(|e| ConditionError::Eval(e.to_string()))?;
		context
			.add_variable("metadata", metadata_value(ctx))
			.map_err(|e| ConditionError::Eval(e.to_string()))?;
		context
			.add_variable("api", api_value(ctx))
			.map_err(|e| ConditionError::Eval(e.to_string()))?;

		match self.program.execute(&context) {
			Ok(Value::Bool(b)) => Ok(b),
			Ok(_) => Err(ConditionError::NotBoolean),
			Err(e) => Err(ConditionError::Eval(e.to_string())),
		}
	}
}

fn request_value(ctx: &RequestContext) -> Value {
	let mut headers = HashMap::new();
	for (name, value) in ctx.request_headers.iter() {
		headers.insert(
			Key::String(Arc::new(name.as_str().to_ascii_lowercase())),
			Value::String(Arc::new(String::from_utf8_lossy(value.as_bytes()).into_owned())),
		);
	}
	let mut fields = HashMap::new();
	fields.insert(
		Key::String(Arc::new("method".to_string())),
		Value::String(Arc::new(ctx.method.to_string())),
	);
	fields.insert(
		Key::String(Arc::new("path".to_string())),
		Value::String(Arc::new(ctx.path.to_string())),
	);
	fields.insert(
		Key::String(Arc::new("headers".to_string())),
		Value::Map(CelMap::from(headers)),
	);
	Value::Map(CelMap::from(fields))
}

fn metadata_value(ctx: &RequestContext) -> Value {
	let mut fields = HashMap::new();
	for (key, value) in ctx.metadata.iter() {
		fields.insert(Key::String(Arc::new(key.clone())), json_to_cel(value));
	}
	Value::Map(CelMap::from(fields))
}

fn api_value(ctx: &RequestContext) -> Value {
	let mut fields = HashMap::new();
	fields.insert(
		Key::String(Arc::new("id".to_string())),
		Value::String(Arc::new(ctx.api_id.to_string())),
	);
	fields.insert(
		Key::String(Arc::new("name".to_string())),
		Value::String(Arc::new(ctx.api_name.to_string())),
	);
	fields.insert(
		Key::String(Arc::new("version".to_string())),
		Value::String(Arc::new(ctx.api_version.to_string())),
	);
	fields.insert(
		Key::String(Arc::new("context".to_string())),
		Value::String(Arc::new(ctx.api_context.to_string())),
	);
	fields.insert(
		Key::String(Arc::new("operation_path".to_string())),
		Value::String(Arc::new(ctx.operation_path.to_string())),
	);
	Value::Map(CelMap::from(fields))
}

fn json_to_cel(value: &serde_json::Value) -> Value {
	match value {
		serde_json::Value::Null => Value::Null,
		serde_json::Value::Bool(b) => Value::Bool(*b),
		serde_json::Value::Number(n) => {
			if let Some(i) = n.as_i64() {
				Value::Int(i)
			} else {
				Value::Float(n.as_f64().unwrap_or_default())
			}
		}
		serde_json::Value::String(s) => Value::String(Arc::new(s.clone())),
		serde_json::Value::Array(items) => Value::List(Arc::new(items.iter().map(json_to_cel).collect())),
		serde_json::Value::Object(map) => {
			let mut fields = HashMap::new();
			for (k, v) in map.iter() {
				fields.insert(Key::String(Arc::new(k.clone())), json_to_cel(v));
			}
			Value::Map(CelMap::from(fields))
		}
	}
}
