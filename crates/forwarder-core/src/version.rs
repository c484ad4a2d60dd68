//! Build/version metadata surfaced in startup logs and the `User-Agent` the
//! proxy may attach to synthesized error responses.

use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct BuildInfo {
	pub version: String,
	pub rust_version: String,
	pub profile: &'static str,
}

static BUILD_INFO: OnceLock<BuildInfo> = OnceLock::new();

impl BuildInfo {
	pub fn new() -> Self {
		BUILD_INFO
			.get_or_init(|| BuildInfo {
				version: env!("CARGO_PKG_VERSION").to_string(),
				rust_version: rustc_version().to_string(),
				profile: if cfg!(debug_assertions) {
					"debug"
				} else {
					"release"
				},
			})
			.clone()
	}
}

impl Default for BuildInfo {
	fn default() -> Self {
		Self::new()
	}
}

fn rustc_version() -> &'static str {
	env!("FORWARDER_RUSTC_VERSION")
}
