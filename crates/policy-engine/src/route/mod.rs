//! Route→Chain Registry. Read-mostly, atomic-hot-swap map from route key
//! to the chain bound to it: readers never block writers and writers never
//! mutate in place.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use policy_core::prelude::*;

use crate::chain::PolicyChain;

pub struct RouteRegistry {
	inner: ArcSwap<HashMap<Strng, Arc<PolicyChain>>>,
}

impl RouteRegistry {
	pub fn new() -> Self {
		RouteRegistry {
			inner: ArcSwap::from_pointee(HashMap::new()),
		}
	}

	/// O(1) expected; `None` means "no chain" -- the stream handler answers
	/// with a skip-all envelope (§4.3, §4.8).
	pub fn get(&self, route_key: &str) -> Option<Arc<PolicyChain>> {
		self.inner.load().get(route_key).cloned()
	}

	/// Atomic swap. All chains in `new_map` must already be built and
	/// validated -- partial updates are not permitted (§4.3). In-flight
	/// readers keep their already-cloned `Arc<PolicyChain>` until the
	/// stream they belong to ends (scenario §8.5).
	pub fn replace(&self, new_map: HashMap<Strng, Arc<PolicyChain>>) {
		self.inner.store(Arc::new(new_map));
	}

	pub fn dump(&self) -> Vec<Strng> {
		self.inner.load().keys().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.inner.load().len()
	}
}

impl Default for RouteRegistry {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn empty_chain(key: &str) -> Arc<PolicyChain> {
		Arc::new(PolicyChain::build(Strng::from(key), Vec::new()))
	}

	#[test]
	fn missing_route_returns_none() {
		let registry = RouteRegistry::new();
		assert!(registry.get("unknown").is_none());
	}

	#[test]
	fn replace_is_visible_to_new_readers() {
		let registry = RouteRegistry::new();
		let mut map = HashMap::new();
		map.insert(Strng::from("r1"), empty_chain("r1"));
		registry.replace(map);
		assert!(registry.get("r1").is_some());
	}

	#[test]
	fn in_flight_reader_keeps_old_snapshot_across_a_swap() {
		let registry = RouteRegistry::new();
		let mut map_a = HashMap::new();
		map_a.insert(Strng::from("r"), empty_chain("a-chain"));
		registry.replace(map_a);
		let held = registry.get("r").unwrap();

		let mut map_b = HashMap::new();
		map_b.insert(Strng::from("r"), empty_chain("b-chain"));
		registry.replace(map_b);

		assert_eq!(held.route_key.as_str(), "a-chain");
		assert_eq!(registry.get("r").unwrap().route_key.as_str(), "b-chain");
	}
}
