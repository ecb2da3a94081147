use std::env;
use std::path::PathBuf;

use prost::Message;

fn main() -> anyhow::Result<()> {
	let out_dir = PathBuf::from(env::var("OUT_DIR")?);
	let descriptor_path = out_dir.join("policy_ext_proc_descriptor.bin");

	tonic_prost_build::configure()
		.build_server(true)
		.build_client(false)
		.file_descriptor_set_path(&descriptor_path)
		.extern_path(".google.protobuf.Struct", "::prost_wkt_types::Struct")
		.extern_path(".google.protobuf.Value", "::prost_wkt_types::Value")
		.compile_protos(&["proto/ext_proc.proto"], &["proto"])?;

	let descriptor_bytes = std::fs::read(&descriptor_path)?;
	let descriptor = prost_types::FileDescriptorSet::decode(descriptor_bytes.as_slice())?;
	prost_wkt_build::add_serde(out_dir, descriptor);

	println!("cargo:rerun-if-changed=proto/ext_proc.proto");
	Ok(())
}
