//! CLI surface (spec.md §6): one `clap::Args` group per config section, an
//! `env = "FORWARDER_..."` on every field so the "every flag can be set via
//! an environment variable" rule is enforced by `clap` rather than hand
//! rolled, and a top-level [`Cli`] that flattens all the groups together.

use clap::Parser;

use crate::fileorinline::FileOrInline;

#[derive(Parser, Debug)]
#[command(name = "forwarder", version, about = "A forward HTTP/HTTPS proxy")]
pub struct Cli {
	#[command(flatten)]
	pub server: ServerArgs,
	#[command(flatten)]
	pub proxy: ProxyArgs,
	#[command(flatten)]
	pub mitm: MitmArgs,
	#[command(flatten)]
	pub dns: DnsArgs,
	#[command(flatten)]
	pub client: ClientArgs,
	#[command(flatten)]
	pub connect: ConnectArgs,

	/// `[srchost]:[srcport]=[dsthost]:[dstport]`, any field may be blank.
	/// Can be repeated.
	#[arg(long = "dial-redirect", env = "FORWARDER_DIAL_REDIRECT", value_delimiter = ',')]
	pub dial_redirects: Vec<String>,

	/// Address for the `/healthz` and `/metrics` HTTP surface. Unset disables it.
	#[arg(long, env = "FORWARDER_READINESS_ADDRESS")]
	pub readiness_address: Option<String>,

	/// Log filter, e.g. "info" or "forwarder=debug". Overridden by RUST_LOG.
	#[arg(long, env = "FORWARDER_LOG_LEVEL", default_value = "info")]
	pub log_level: String,

	/// Grace period given to in-flight connections after a shutdown signal.
	#[arg(long, env = "FORWARDER_SHUTDOWN_GRACE_PERIOD", default_value = "30s")]
	pub shutdown_grace_period: String,
}

#[derive(clap::Args, Debug)]
pub struct ServerArgs {
	#[arg(long, env = "FORWARDER_ADDRESS", default_value = "127.0.0.1:8080")]
	pub address: String,
	#[arg(long, env = "FORWARDER_PROTOCOL", default_value = "http")]
	pub protocol: String,
	#[arg(long = "tls-cert-file", env = "FORWARDER_TLS_CERT_FILE")]
	pub tls_cert_file: Option<FileOrInline>,
	#[arg(long = "tls-key-file", env = "FORWARDER_TLS_KEY_FILE")]
	pub tls_key_file: Option<FileOrInline>,
	#[arg(long, env = "FORWARDER_READ_HEADER_TIMEOUT")]
	pub read_header_timeout: Option<String>,
	#[arg(long, env = "FORWARDER_READ_LIMIT")]
	pub read_limit: Option<u64>,
	#[arg(long, env = "FORWARDER_WRITE_LIMIT")]
	pub write_limit: Option<u64>,
	#[arg(long, env = "FORWARDER_BASIC_AUTH")]
	pub basic_auth: Option<String>,
	#[arg(long, env = "FORWARDER_PROXY_PROTOCOL", default_value_t = false)]
	pub proxy_protocol: bool,
}

#[derive(clap::Args, Debug)]
pub struct ProxyArgs {
	/// A static upstream proxy URL. Mutually exclusive with `--pac`.
	#[arg(long, env = "FORWARDER_PROXY")]
	pub proxy: Option<String>,
	/// Path (or `-`/`data:base64,...`) to a PAC script. Mutually exclusive
	/// with `--proxy`. Remote (`http(s)://`) PAC URLs are not fetched.
	#[arg(long, env = "FORWARDER_PAC")]
	pub pac: Option<FileOrInline>,
	#[arg(long, env = "FORWARDER_CREDENTIALS", value_delimiter = ',')]
	pub credentials: Vec<String>,
	#[arg(long = "deny-domains", env = "FORWARDER_DENY_DOMAINS", value_delimiter = ',')]
	pub deny_domains: Vec<String>,
	#[arg(long = "direct-domains", env = "FORWARDER_DIRECT_DOMAINS", value_delimiter = ',')]
	pub direct_domains: Vec<String>,
	#[arg(long = "proxy-localhost", env = "FORWARDER_PROXY_LOCALHOST", default_value = "deny")]
	pub proxy_localhost: String,
	#[arg(long, env = "FORWARDER_HEADER", value_delimiter = ',')]
	pub header: Vec<String>,
	#[arg(long = "response-header", env = "FORWARDER_RESPONSE_HEADER", value_delimiter = ',')]
	pub response_header: Vec<String>,
	#[arg(long = "proxy-header", env = "FORWARDER_PROXY_HEADER", value_delimiter = ',')]
	pub proxy_header: Vec<String>,
}

#[derive(clap::Args, Debug)]
pub struct MitmArgs {
	#[arg(long, env = "FORWARDER_MITM", default_value_t = false)]
	pub mitm: bool,
	/// If unset while `--mitm` is set, a CA is self-signed at startup.
	#[arg(long = "mitm-cacert-file", env = "FORWARDER_MITM_CACERT_FILE")]
	pub mitm_cacert_file: Option<FileOrInline>,
	#[arg(long = "mitm-cakey-file", env = "FORWARDER_MITM_CAKEY_FILE")]
	pub mitm_cakey_file: Option<FileOrInline>,
	#[arg(long = "mitm-domains", env = "FORWARDER_MITM_DOMAINS", value_delimiter = ',')]
	pub mitm_domains: Vec<String>,
	#[arg(long = "mitm-org", env = "FORWARDER_MITM_ORG", default_value = "Forwarder")]
	pub mitm_org: String,
	#[arg(long = "mitm-validity", env = "FORWARDER_MITM_VALIDITY", default_value = "24h")]
	pub mitm_validity: String,
	#[arg(long = "mitm-cache-capacity", env = "FORWARDER_MITM_CACHE_CAPACITY", default_value_t = 4096)]
	pub mitm_cache_capacity: usize,
}

#[derive(clap::Args, Debug)]
pub struct DnsArgs {
	#[arg(long = "dns-server", env = "FORWARDER_DNS_SERVER", value_delimiter = ',')]
	pub dns_server: Vec<String>,
	#[arg(long = "dns-round-robin", env = "FORWARDER_DNS_ROUND_ROBIN", default_value_t = false)]
	pub dns_round_robin: bool,
	#[arg(long = "dns-timeout", env = "FORWARDER_DNS_TIMEOUT", default_value = "5s")]
	pub dns_timeout: String,
}

#[derive(clap::Args, Debug)]
pub struct ClientArgs {
	/// Additional trust root for origin/upstream TLS, beyond the platform's
	/// native root store.
	#[arg(long = "cacert-file", env = "FORWARDER_CACERT_FILE")]
	pub cacert_file: Option<FileOrInline>,
	#[arg(long = "http-dial-timeout", env = "FORWARDER_HTTP_DIAL_TIMEOUT", default_value = "25s")]
	pub http_dial_timeout: String,
	#[arg(long = "http-idle-conn-timeout", env = "FORWARDER_HTTP_IDLE_CONN_TIMEOUT", default_value = "90s")]
	pub http_idle_conn_timeout: String,
	#[arg(long = "http-response-header-timeout", env = "FORWARDER_HTTP_RESPONSE_HEADER_TIMEOUT", default_value = "30s")]
	pub http_response_header_timeout: String,
	#[arg(long = "http-tls-handshake-timeout", env = "FORWARDER_HTTP_TLS_HANDSHAKE_TIMEOUT", default_value = "10s")]
	pub http_tls_handshake_timeout: String,
	#[arg(long, env = "FORWARDER_INSECURE", default_value_t = false)]
	pub insecure: bool,
}

#[derive(clap::Args, Debug)]
pub struct ConnectArgs {
	#[arg(long = "connect-timeout", env = "FORWARDER_CONNECT_TIMEOUT", default_value = "60s")]
	pub connect_timeout: String,
	#[arg(long = "idle-timeout", env = "FORWARDER_IDLE_TIMEOUT", default_value = "300s")]
	pub idle_timeout: String,
}
