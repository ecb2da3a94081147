//! Generated bindings for the `policy.ext_proc.v1` gRPC service.
//!
//! The exact Envoy `envoy.service.ext_proc.v3` wire schema is out of scope
//! (see the root spec's Non-goals); this is a semantically-equivalent proto
//! covering the phases, mutations, and processing-mode overrides the engine
//! needs, with the same external-processor shape so an Envoy-compatible
//! proxy can speak to it without translation at the HTTP/2 framing level.

tonic::include_proto!("policy.ext_proc.v1");

include!(concat!(env!("OUT_DIR"), "/policy.ext_proc.v1.serde.rs"));
