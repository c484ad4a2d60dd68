//! `forwarder`: the app-crate binary. Owns every collaborator spec.md §1
//! calls out of scope for the core (CLI parsing, the readiness/metrics
//! HTTP surface, PAC script evaluation, MITM CA generation, `/etc/hosts`
//! parsing, DNS resolver wiring) and assembles them into the library's
//! `ProxyRuntime`.

mod cli;
mod fileorinline;
mod hosts;
mod mitm_ca;
mod pac;
mod readiness;

use std::sync::Arc;

use clap::Parser;
use forwarder::telemetry::log;
use forwarder::telemetry::metrics::Metrics;
use forwarder::{ProxyRuntime, RawConfig};
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let logging_cfg = log::Config { filter: cli.log_level.clone(), fields: Default::default() };
	log::init(&logging_cfg)?;

	let build_info = forwarder_core::version::BuildInfo::new();
	tracing::info!(version = %build_info.version, rust_version = %build_info.rust_version, profile = build_info.profile, "starting forwarder");

	match run(cli).await {
		Ok(()) => Ok(()),
		Err(e) => {
			tracing::error!(error = %e, "fatal error");
			std::process::exit(1);
		},
	}
}

async fn run(cli: Cli) -> anyhow::Result<()> {
	// --http-response-header-timeout has no counterpart in the core client
	// yet (OriginClient drives a raw hyper handshake with no per-header
	// deadline); validate the value so a typo still fails fast at startup.
	go_parse_duration::parse_duration(&cli.client.http_response_header_timeout)?;

	let raw = build_raw_config(&cli).await?;
	let mut config = raw.try_into_config()?;

	if config.loopback_aliases.is_empty() {
		let mut aliases = hosts::system_loopback_aliases().await;
		aliases.extend(cli.server.address.split(':').next().map(str::to_string));
		config.loopback_aliases = Arc::from(aliases);
	}

	if let Some(pac_source) = &cli.proxy.pac {
		if cli.proxy.proxy.is_some() {
			anyhow::bail!("--proxy and --pac are mutually exclusive");
		}
		let script = pac_source.read_to_string().await?;
		let resolver = pac::load(&script)?;
		config = config.with_pac(resolver)?;
	}

	if cli.mitm.mitm && cli.mitm.mitm_cacert_file.is_none() {
		let generated = mitm_ca::generate(&cli.mitm.mitm_org)?;
		let ca = Arc::new(forwarder::mitm::CertificateAuthority::from_pem(&generated.cert_pem, &generated.key_pem)?);
		if let Some(mitm) = &mut config.mitm {
			mitm.ca = Some(ca);
		}
		tracing::warn!("no --mitm-cacert-file/--mitm-cakey-file supplied; generated a throwaway CA for this run");
	}

	let mut registry = Registry::default();
	let metrics = Metrics::new(&mut registry);
	let handle = tokio::runtime::Handle::current();
	forwarder_core::tokio_metrics::TokioCollector::register(&mut registry, &handle);
	let registry = Arc::new(registry);

	let runtime = Arc::new(ProxyRuntime::new(config, Some(metrics))?);
	if let Some(ca_der) = runtime.mitm_ca_cert_der() {
		tracing::info!(ca_der_len = ca_der.as_ref().len(), "MITM CA ready");
	}

	let shutdown = CancellationToken::new();
	let readiness = readiness::Readiness::new();

	let mut tasks = tokio::task::JoinSet::new();

	if let Some(addr) = &cli.readiness_address {
		let addr: std::net::SocketAddr = addr.parse()?;
		let readiness = readiness.clone();
		let registry = registry.clone();
		let shutdown = shutdown.clone();
		tasks.spawn(async move { readiness::serve(addr, readiness, registry, shutdown).await.map_err(anyhow::Error::from) });
	}

	let grace_period = go_parse_duration::parse_duration(&cli.shutdown_grace_period)
		.map(|nanos| std::time::Duration::from_nanos(nanos.max(0) as u64))
		.unwrap_or(std::time::Duration::from_secs(30));

	{
		let runtime = runtime.clone();
		let shutdown = shutdown.clone();
		readiness.mark_ready();
		tasks.spawn(async move { runtime.serve(shutdown, grace_period).await.map_err(anyhow::Error::from) });
	}

	tokio::select! {
		_ = wait_for_shutdown_signal() => {
			tracing::info!("shutdown signal received");
			shutdown.cancel();
		},
		Some(result) = tasks.join_next() => {
			shutdown.cancel();
			result??;
		},
	}

	while let Some(result) = tasks.join_next().await {
		if let Err(e) = result? {
			tracing::warn!(error = %e, "task exited with error during shutdown");
		}
	}

	Ok(())
}

async fn wait_for_shutdown_signal() {
	let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler") };

	#[cfg(unix)]
	let terminate = async {
		tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler")
			.recv()
			.await;
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}

/// Reads every `FileOrInline` field and assembles the core's `RawConfig`
/// from parsed CLI arguments.
async fn build_raw_config(cli: &Cli) -> anyhow::Result<RawConfig> {
	let tls_cert_pem = match &cli.server.tls_cert_file {
		Some(f) => Some(f.read_to_string().await?),
		None => None,
	};
	let tls_key_pem = match &cli.server.tls_key_file {
		Some(f) => Some(f.read_to_string().await?),
		None => None,
	};
	let mitm_cacert_pem = match &cli.mitm.mitm_cacert_file {
		Some(f) => Some(f.read_to_string().await?),
		None => None,
	};
	let mitm_cakey_pem = match &cli.mitm.mitm_cakey_file {
		Some(f) => Some(f.read_to_string().await?),
		None => None,
	};
	let cacert_pem = match &cli.client.cacert_file {
		Some(f) => Some(f.read_to_string().await?),
		None => None,
	};

	Ok(RawConfig {
		address: Some(cli.server.address.clone()),
		protocol: Some(cli.server.protocol.clone()),
		tls_cert_pem,
		tls_key_pem,
		read_header_timeout: cli.server.read_header_timeout.clone(),
		read_limit: cli.server.read_limit,
		write_limit: cli.server.write_limit,
		basic_auth: cli.server.basic_auth.clone(),
		proxy_protocol: Some(cli.server.proxy_protocol),

		proxy: cli.proxy.proxy.clone(),
		credentials: non_empty(&cli.proxy.credentials),
		deny_domains: non_empty(&cli.proxy.deny_domains),
		direct_domains: non_empty(&cli.proxy.direct_domains),
		proxy_localhost: Some(cli.proxy.proxy_localhost.clone()),
		header: non_empty(&cli.proxy.header),
		response_header: non_empty(&cli.proxy.response_header),
		proxy_header: non_empty(&cli.proxy.proxy_header),
		loopback_aliases: None,

		mitm: Some(cli.mitm.mitm),
		mitm_cacert_pem,
		mitm_cakey_pem,
		mitm_domains: non_empty(&cli.mitm.mitm_domains),
		mitm_org: Some(cli.mitm.mitm_org.clone()),
		mitm_validity: Some(cli.mitm.mitm_validity.clone()),
		mitm_cache_capacity: Some(cli.mitm.mitm_cache_capacity),

		dns_server: non_empty(&cli.dns.dns_server),
		dns_round_robin: Some(cli.dns.dns_round_robin),
		dns_timeout: Some(cli.dns.dns_timeout.clone()),

		http_dial_timeout: Some(cli.client.http_dial_timeout.clone()),
		http_keepalive: Some(cli.client.http_idle_conn_timeout.clone()),
		http_tls_handshake_timeout: Some(cli.client.http_tls_handshake_timeout.clone()),
		insecure: Some(cli.client.insecure),
		cacert_pem,

		connect_timeout: Some(cli.connect.connect_timeout.clone()),
		idle_timeout: Some(cli.connect.idle_timeout.clone()),

		dial_redirects: non_empty(&cli.dial_redirects),
	})
}

fn non_empty(v: &[String]) -> Option<Vec<String>> {
	if v.is_empty() { None } else { Some(v.to_vec()) }
}
