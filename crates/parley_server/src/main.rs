#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use hyper::header::HeaderValue;
use parley_util::endpoint::BindEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{MEMORY_DATABASE_URL, ServerConfig};
use crate::server::auth::TokenAuthority;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::hub::{Hub, HubConfig};
use crate::server::ingress;
use crate::server::state::AppState;
use crate::server::store::{InMemoryStore, MessageStore, SqlStore};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind http://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Bind endpoint (default: config `server.bind`, else 127.0.0.1:8080)\n\
\t          Format: http://host:port or host:port\n\
\t--config   Config file (default: ~/.parley/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<SocketAddr>,
	config: Option<PathBuf>,
}

fn parse_bind(v: &str) -> Result<SocketAddr, String> {
	BindEndpoint::parse(v)?.to_socket_addr()
}

fn parse_args() -> Args {
	let mut args = Args {
		bind: None,
		config: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let addr = parse_bind(&v).unwrap_or_else(|e| {
					eprintln!("{e}");
					usage_and_exit();
				});
				args.bind = Some(addr);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("parley_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match parse_bind(bind) {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn connect_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn MessageStore>> {
	let url = cfg.persistence.database_url.as_str();
	if url == MEMORY_DATABASE_URL {
		warn!("persistence: using in-memory store; messages are lost on restart");
		return Ok(Arc::new(InMemoryStore::new()));
	}

	let store = SqlStore::connect(url, cfg.persistence.max_connections, cfg.persistence.op_timeout)
		.await
		.context("connect message store")?;
	info!(
		max_connections = cfg.persistence.max_connections,
		op_timeout = ?cfg.persistence.op_timeout,
		"persistence: connected"
	);
	Ok(Arc::new(store))
}

async fn shutdown_signal() {
	if let Err(e) = tokio::signal::ctrl_c().await {
		warn!(error = %e, "failed to listen for ctrl-c");
		std::future::pending::<()>().await;
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(p) => p,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let Some(secret) = server_cfg.server.auth_secret.clone() else {
		return Err(anyhow!(
			"no auth secret configured (set server.auth_secret or PARLEY_AUTH_SECRET)"
		));
	};
	let cors_origin = HeaderValue::from_str(&server_cfg.server.cors_origin)
		.with_context(|| format!("invalid cors_origin {:?}", server_cfg.server.cors_origin))?;

	let bind_addr = match args.bind {
		Some(addr) => addr,
		None => parse_bind(&server_cfg.server.bind).map_err(|e| anyhow!(e).context("invalid server.bind"))?,
	};

	let store = connect_store(&server_cfg).await?;
	let hub = Hub::start(
		Arc::clone(&store),
		HubConfig {
			event_capacity: server_cfg.limits.hub_channel_capacity,
			debug_logs: server_cfg.server.hub_debug_logs,
		},
	);

	let health_state = HealthState::new(hub.clone());
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match parse_bind(bind) {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let connection = server_cfg.limits.connection_settings();
	info!(
		max_frame_bytes = connection.max_frame_bytes,
		outbound_queue_capacity = connection.outbound_queue_capacity,
		write_wait = ?connection.write_wait,
		pong_wait = ?connection.pong_wait,
		ping_period = ?connection.ping_period,
		"connection limits"
	);

	let state = AppState::new(
		hub.clone(),
		store,
		TokenAuthority::new(secret, server_cfg.server.token_ttl),
		connection,
		cors_origin,
	);

	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind_addr}"))?;
	info!(bind = %bind_addr, "parley_server: listening");

	health_state.mark_ready();

	ingress::serve(listener, state, server_cfg.server.header_read_timeout, shutdown_signal()).await?;

	if let Ok(members) = hub.member_count().await {
		info!(members, "closing hub");
	}
	hub.shutdown().await;
	info!("parley_server: stopped");

	Ok(())
}
