//! Reads `/etc/hosts` at startup to enrich the localhost-alias set (spec.md
//! §9 Open Question (c)). Reloading is not supported and stays a
//! non-goal: the alias list is fixed once `ProxyRuntime` is built.

const LOOPBACK_V4: &str = "127.0.0.1";
const LOOPBACK_V6: &str = "::1";

/// Parses `contents` (the text of `/etc/hosts`) and returns every hostname
/// mapped to a loopback address, in file order with duplicates removed.
pub fn loopback_aliases_from_hosts(contents: &str) -> Vec<String> {
	let mut aliases = Vec::new();
	for line in contents.lines() {
		let line = line.split('#').next().unwrap_or("").trim();
		if line.is_empty() {
			continue;
		}
		let mut fields = line.split_whitespace();
		let Some(addr) = fields.next() else { continue };
		if addr != LOOPBACK_V4 && addr != LOOPBACK_V6 {
			continue;
		}
		for host in fields {
			if !aliases.iter().any(|a: &String| a == host) {
				aliases.push(host.to_string());
			}
		}
	}
	aliases
}

/// Reads and parses the system `/etc/hosts`. Missing or unreadable files
/// yield an empty alias set rather than a startup failure, since the
/// loopback-alias enrichment is best-effort.
pub async fn system_loopback_aliases() -> Vec<String> {
	match fs_err::tokio::read_to_string("/etc/hosts").await {
		Ok(contents) => loopback_aliases_from_hosts(&contents),
		Err(_) => Vec::new(),
	}
}
