//! Policy Registry: name+version -> factory; produces policy
//! instances with validated config. Read-mostly; mutated only at process
//! start and by explicit dynamic-registration calls (§4.2).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use policy_core::prelude::*;

use super::{Policy, ProcessingMode};

pub type ParamMap = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
	#[error("policy {0}:{1} is already registered")]
	AlreadyRegistered(Strng, Strng),
	#[error("unknown policy {0}:{1}")]
	UnknownPolicy(Strng, Strng),
	#[error("invalid parameters for {0}:{1}: {2}")]
	InvalidParameters(Strng, Strng, String),
}

/// Builds a `Policy` instance from a validated parameter map. Implemented
/// once per policy kind; registered under `(name, version)`.
pub trait PolicyFactory: Send + Sync {
	fn mode(&self) -> ProcessingMode;
	fn build(&self, params: &ParamMap) -> Result<Arc<dyn Policy>, String>;
}

#[derive(Clone)]
struct Definition {
	mode: ProcessingMode,
	factory: Arc<dyn PolicyFactory>,
}

#[derive(Default)]
pub struct PolicyRegistry {
	definitions: RwLock<HashMap<(Strng, Strng), Definition>>,
}

impl PolicyRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(
		&self,
		name: impl Into<Strng>,
		version: impl Into<Strng>,
		factory: Arc<dyn PolicyFactory>,
	) -> Result<(), RegistryError> {
		let name = name.into();
		let version = version.into();
		let mut definitions = self.definitions.write();
		let key = (name.clone(), version.clone());
		if definitions.contains_key(&key) {
			return Err(RegistryError::AlreadyRegistered(name, version));
		}
		let mode = factory.mode();
		definitions.insert(key, Definition { mode, factory });
		Ok(())
	}

	pub fn lookup(&self, name: &str, version: &str) -> Option<ProcessingMode> {
		self
			.definitions
			.read()
			.get(&(Strng::from(name), Strng::from(version)))
			.map(|d| d.mode)
	}

	/// Builds an instance, returning its declared mode alongside it so the
	/// config loader can fold it into the chain's body requirements without
	/// a second lookup.
	pub fn create(
		&self,
		name: &str,
		version: &str,
		params: &ParamMap,
	) -> Result<(ProcessingMode, Arc<dyn Policy>), RegistryError> {
		let name_s = Strng::from(name);
		let version_s = Strng::from(version);
		let definitions = self.definitions.read();
		let definition = definitions
			.get(&(name_s.clone(), version_s.clone()))
			.ok_or_else(|| RegistryError::UnknownPolicy(name_s.clone(), version_s.clone()))?;
		let instance = definition
			.factory
			.build(params)
			.map_err(|e| RegistryError::InvalidParameters(name_s, version_s, e))?;
		Ok((definition.mode, instance))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::policy::{Action, HeaderMode};
	use async_trait::async_trait;

	struct NoopPolicy;
	#[async_trait]
	impl Policy for NoopPolicy {}

	struct NoopFactory;
	impl PolicyFactory for NoopFactory {
		fn mode(&self) -> ProcessingMode {
			ProcessingMode {
				request_headers: HeaderMode::Process,
				..ProcessingMode::default()
			}
		}
		fn build(&self, _params: &ParamMap) -> Result<Arc<dyn Policy>, String> {
			Ok(Arc::new(NoopPolicy))
		}
	}

	#[test]
	fn duplicate_registration_fails() {
		let registry = PolicyRegistry::new();
		registry.register("noop", "v1", Arc::new(NoopFactory)).unwrap();
		let err = registry.register("noop", "v1", Arc::new(NoopFactory)).unwrap_err();
		assert!(matches!(err, RegistryError::AlreadyRegistered(_, _)));
	}

	#[test]
	fn create_unknown_policy_fails() {
		let registry = PolicyRegistry::new();
		let err = registry.create("missing", "v1", &ParamMap::new()).unwrap_err();
		assert!(matches!(err, RegistryError::UnknownPolicy(_, _)));
	}

	#[test]
	fn create_builds_instance_for_known_policy() {
		let registry = PolicyRegistry::new();
		registry.register("noop", "v1", Arc::new(NoopFactory)).unwrap();
		let (_mode, _instance) = registry.create("noop", "v1", &ParamMap::new()).unwrap();
	}

	#[tokio::test]
	async fn built_instance_is_a_real_policy() {
		let registry = PolicyRegistry::new();
		registry.register("noop", "v1", Arc::new(NoopFactory)).unwrap();
		let (_mode, instance) = registry.create("noop", "v1", &ParamMap::new()).unwrap();
		let mut ctx = crate::context::RequestContext::new(Strng::from("r1"));
		assert!(matches!(instance.on_request_headers(&mut ctx).await, Action::Noop));
	}
}
