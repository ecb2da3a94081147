fn main() {
	let rustc = rustc_version::version_meta().expect("rustc_version");
	println!("cargo:rustc-env=POLICY_CORE_RUSTC_VERSION={}", rustc.semver);
	println!(
		"cargo:rustc-env=POLICY_CORE_RUSTC_COMMIT={}",
		rustc
			.commit_hash
			.unwrap_or_else(|| "unknown".to_string())
	);
}
