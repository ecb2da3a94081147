//! Config Loader: parses declarative route->chain documents, validates
//! against the Policy Registry, builds every chain, and hands back a fully
//! resolved `Config` for the caller to publish atomically into the
//! Route→Chain Registry. No partial application (§4.4).

pub mod watch;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use policy_core::prelude::*;

use crate::chain::{ChainEntry, OnError, PolicyChain};
use crate::condition::Condition;
use crate::policy::registry::{PolicyRegistry, RegistryError};

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawOnError {
	Continue,
	FailClosed,
}

impl From<RawOnError> for OnError {
	fn from(value: RawOnError) -> Self {
		match value {
			RawOnError::Continue => OnError::Continue,
			RawOnError::FailClosed => OnError::FailClosed,
		}
	}
}

fn default_enabled() -> bool {
	true
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RawPolicySpec {
	pub name: String,
	pub version: String,
	#[serde(default = "default_enabled")]
	pub enabled: bool,
	pub execution_condition: Option<String>,
	#[serde(default)]
	pub on_error: Option<RawOnError>,
	#[serde(default)]
	pub parameters: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RawRouteEntry {
	pub route_key: String,
	#[serde(default)]
	pub policies: Vec<RawPolicySpec>,
}

/// The document shape from §6: a top-level list of `{route_key, policies}`
/// entries, YAML or JSON.
pub type RawConfig = Vec<RawRouteEntry>;

/// The fully resolved, chain-built form -- what `ConfigLoader::load`
/// produces and what `RouteRegistry::replace` consumes.
pub struct Config {
	pub routes: HashMap<Strng, Arc<PolicyChain>>,
}

#[derive(Debug, Clone)]
pub enum ConfigSource {
	/// Loaded once at startup and re-read on SIGHUP or file-watch event
	/// (§4.11). The reload trigger itself lives in `config::watch`.
	File(PathBuf),
	/// An in-memory document -- used by tests today, and the seam a future
	/// control-plane push adapter would plug into (§4.11).
	Static(Bytes),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("invalid config: {0}")]
	InvalidConfig(String),
	#[error("unknown policy {0}:{1}")]
	UnknownPolicy(String, String),
	#[error("invalid parameters for policy {0}:{1}: {2}")]
	InvalidPolicyParams(String, String, String),
	#[error("failed to read config file {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

pub struct ConfigLoader {
	registry: Arc<PolicyRegistry>,
}

impl ConfigLoader {
	pub fn new(registry: Arc<PolicyRegistry>) -> Self {
		ConfigLoader { registry }
	}

	pub async fn load(&self, source: &ConfigSource) -> Result<Config, Error> {
		let bytes = match source {
			ConfigSource::File(path) => fs_err::tokio::read(path)
				.await
				.map_err(|source| Error::Io { path: path.clone(), source })?,
			ConfigSource::Static(bytes) => bytes.to_vec(),
		};
		let raw = parse_document(&bytes)?;
		self.build(raw)
	}

	/// Validate + build every chain in `raw`. Rejects the entire document on
	/// the first failure (§4.4 step 3) -- nothing here mutates live state;
	/// the caller publishes the result into the Route→Chain Registry.
	pub fn build(&self, raw: RawConfig) -> Result<Config, Error> {
		let mut routes = HashMap::with_capacity(raw.len());
		for entry in raw {
			if entry.route_key.is_empty() {
				return Err(Error::InvalidConfig("route_key must be non-empty".to_string()));
			}
			let mut entries = Vec::with_capacity(entry.policies.len());
			for spec in entry.policies {
				if !spec.enabled {
					continue;
				}
				let (mode, policy) = self.registry.create(&spec.name, &spec.version, &spec.parameters).map_err(|e| match e {
					RegistryError::UnknownPolicy(name, version) => Error::UnknownPolicy(name.to_string(), version.to_string()),
					RegistryError::InvalidParameters(name, version, msg) => Error::InvalidPolicyParams(name.to_string(), version.to_string(), msg),
					RegistryError::AlreadyRegistered(name, version) => {
						Error::InvalidConfig(format!("unexpected AlreadyRegistered for {name}:{version}"))
					}
				})?;
				let execution_condition = match &spec.execution_condition {
					Some(source) => Some(
						Condition::compile(source)
							.map_err(|e| Error::InvalidPolicyParams(spec.name.clone(), spec.version.clone(), e.to_string()))?,
					),
					None => None,
				};
				entries.push(ChainEntry {
					name: Strng::from(spec.name.as_str()),
					version: Strng::from(spec.version.as_str()),
					mode,
					execution_condition,
					on_error: spec.on_error.map(Into::into).unwrap_or_default(),
					policy,
				});
			}
			let route_key = Strng::from(entry.route_key.as_str());
			routes.insert(route_key.clone(), Arc::new(PolicyChain::build(route_key, entries)));
		}
		Ok(Config { routes })
	}
}

fn parse_document(bytes: &[u8]) -> Result<RawConfig, Error> {
	match serde_yaml::from_slice::<RawConfig>(bytes) {
		Ok(raw) => Ok(raw),
		Err(yaml_err) => serde_json::from_slice::<RawConfig>(bytes)
			.map_err(|json_err| Error::InvalidConfig(format!("not valid YAML ({yaml_err}) or JSON ({json_err})"))),
	}
}
