fn main() {
	let rustc = rustc_version::version().map(|v| v.to_string()).unwrap_or_else(|_| "unknown".to_string());
	println!("cargo:rustc-env=FORWARDER_RUSTC_VERSION={rustc}");
}
