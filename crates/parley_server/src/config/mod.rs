#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::connection::ConnectionSettings;
use crate::util::secret::SecretString;

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:5173";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://parley.db?mode=rwc";

/// `database_url` value selecting the process-local store.
pub const MEMORY_DATABASE_URL: &str = "memory:";

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML and `PARLEY_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	cfg.limits.normalize();

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub limits: LimitSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Listen address for `/ws` and `/api/*` (host:port).
	pub bind: String,
	/// Value of `Access-Control-Allow-Origin`.
	pub cors_origin: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for access tokens. Required to start.
	pub auth_secret: Option<SecretString>,
	pub token_ttl: Duration,
	/// Deadline for a client to send a complete request head; idle connections are closed after it.
	pub header_read_timeout: Duration,
	/// Per-event hub logging at debug level.
	pub hub_debug_logs: bool,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: DEFAULT_BIND.to_string(),
			cors_origin: DEFAULT_CORS_ORIGIN.to_string(),
			metrics_bind: None,
			health_bind: None,
			auth_secret: None,
			token_ttl: Duration::from_secs(24 * 60 * 60),
			header_read_timeout: Duration::from_secs(10),
			hub_debug_logs: false,
		}
	}
}

#[derive(Debug, Clone)]
pub struct LimitSettings {
	pub max_frame_bytes: usize,
	pub outbound_queue_capacity: usize,
	pub hub_channel_capacity: usize,
	pub write_wait: Duration,
	pub pong_wait: Duration,
	/// Derived from `pong_wait` unless set explicitly.
	pub ping_period: Option<Duration>,
}

impl Default for LimitSettings {
	fn default() -> Self {
		let c = ConnectionSettings::default();
		Self {
			max_frame_bytes: c.max_frame_bytes,
			outbound_queue_capacity: c.outbound_queue_capacity,
			hub_channel_capacity: 128,
			write_wait: c.write_wait,
			pong_wait: c.pong_wait,
			ping_period: None,
		}
	}
}

impl LimitSettings {
	/// Clamp zero values back to defaults and keep the ping period below the pong wait.
	fn normalize(&mut self) {
		let defaults = LimitSettings::default();
		if self.max_frame_bytes == 0 {
			self.max_frame_bytes = defaults.max_frame_bytes;
		}
		if self.outbound_queue_capacity == 0 {
			self.outbound_queue_capacity = defaults.outbound_queue_capacity;
		}
		if self.hub_channel_capacity == 0 {
			self.hub_channel_capacity = defaults.hub_channel_capacity;
		}
		if self.write_wait.is_zero() {
			self.write_wait = defaults.write_wait;
		}
		if self.pong_wait.is_zero() {
			self.pong_wait = defaults.pong_wait;
		}
		if let Some(p) = self.ping_period
			&& (p.is_zero() || p >= self.pong_wait)
		{
			warn!(ping_period = ?p, pong_wait = ?self.pong_wait, "limits: ping_period must be below pong_wait; deriving it");
			self.ping_period = None;
		}
	}

	pub fn effective_ping_period(&self) -> Duration {
		self.ping_period.unwrap_or(self.pong_wait * 9 / 10)
	}

	pub fn connection_settings(&self) -> ConnectionSettings {
		ConnectionSettings {
			max_frame_bytes: self.max_frame_bytes,
			outbound_queue_capacity: self.outbound_queue_capacity,
			write_wait: self.write_wait,
			pong_wait: self.pong_wait,
			ping_period: self.effective_ping_period(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// Database URL (`sqlite:`, `postgres:` or `memory:`).
	pub database_url: String,
	pub max_connections: u32,
	/// Deadline applied to every store call.
	pub op_timeout: Duration,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: DEFAULT_DATABASE_URL.to_string(),
			max_connections: 10,
			op_timeout: Duration::from_secs(5),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	limits: FileLimitSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	cors_origin: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_secret: Option<String>,
	token_ttl_secs: Option<u64>,
	header_read_timeout_secs: Option<u64>,
	hub_debug_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLimitSettings {
	max_frame_bytes: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	hub_channel_capacity: Option<usize>,
	write_wait_secs: Option<u64>,
	pong_wait_secs: Option<u64>,
	ping_period_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
	max_connections: Option<u32>,
	op_timeout_secs: Option<u64>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let server_defaults = ServerSettings::default();
		let limit_defaults = LimitSettings::default();
		let persistence_defaults = PersistenceSettings::default();

		Self {
			server: ServerSettings {
				bind: non_empty(file.server.bind).unwrap_or(server_defaults.bind),
				cors_origin: non_empty(file.server.cors_origin).unwrap_or(server_defaults.cors_origin),
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
				auth_secret: non_empty(file.server.auth_secret).map(SecretString::new),
				token_ttl: file
					.server
					.token_ttl_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(server_defaults.token_ttl),
				header_read_timeout: file
					.server
					.header_read_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(server_defaults.header_read_timeout),
				hub_debug_logs: file.server.hub_debug_logs.unwrap_or(server_defaults.hub_debug_logs),
			},
			limits: LimitSettings {
				max_frame_bytes: file.limits.max_frame_bytes.unwrap_or(limit_defaults.max_frame_bytes),
				outbound_queue_capacity: file
					.limits
					.outbound_queue_capacity
					.unwrap_or(limit_defaults.outbound_queue_capacity),
				hub_channel_capacity: file
					.limits
					.hub_channel_capacity
					.unwrap_or(limit_defaults.hub_channel_capacity),
				write_wait: file
					.limits
					.write_wait_secs
					.map(Duration::from_secs)
					.unwrap_or(limit_defaults.write_wait),
				pong_wait: file
					.limits
					.pong_wait_secs
					.map(Duration::from_secs)
					.unwrap_or(limit_defaults.pong_wait),
				ping_period: file.limits.ping_period_secs.map(Duration::from_secs),
			},
			persistence: PersistenceSettings {
				database_url: non_empty(file.persistence.database_url).unwrap_or(persistence_defaults.database_url),
				max_connections: file
					.persistence
					.max_connections
					.filter(|v| *v > 0)
					.unwrap_or(persistence_defaults.max_connections),
				op_timeout: file
					.persistence
					.op_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(persistence_defaults.op_timeout),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides<F>(cfg: &mut ServerConfig, env: F)
where
	F: Fn(&str) -> Option<String>,
{
	let string = |key: &str| non_empty(env(key));

	if let Some(v) = string("PARLEY_BIND") {
		cfg.server.bind = v;
		info!("server config: bind overridden by env");
	}

	if let Some(v) = string("PARLEY_CORS_ORIGIN") {
		cfg.server.cors_origin = v;
		info!("server config: cors_origin overridden by env");
	}

	if let Some(v) = string("PARLEY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = string("PARLEY_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = string("PARLEY_AUTH_SECRET") {
		cfg.server.auth_secret = Some(SecretString::new(v));
		info!("server auth: auth_secret overridden by env");
	}

	if let Some(v) = string("PARLEY_TOKEN_TTL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.server.token_ttl = Duration::from_secs(secs);
		info!(secs, "server auth: token_ttl overridden by env");
	}

	if let Some(v) = string("PARLEY_HEADER_READ_TIMEOUT_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.server.header_read_timeout = Duration::from_secs(secs);
		info!(secs, "server config: header_read_timeout overridden by env");
	}

	if let Some(v) = string("PARLEY_HUB_DEBUG_LOGS") {
		cfg.server.hub_debug_logs = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
		info!(enabled = cfg.server.hub_debug_logs, "server config: hub_debug_logs overridden by env");
	}

	if let Some(v) = string("PARLEY_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.parse::<usize>()
	{
		cfg.limits.max_frame_bytes = bytes;
		info!(bytes, "limits: max_frame_bytes overridden by env");
	}

	if let Some(v) = string("PARLEY_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
	{
		cfg.limits.outbound_queue_capacity = capacity;
		info!(capacity, "limits: outbound_queue_capacity overridden by env");
	}

	if let Some(v) = string("PARLEY_DATABASE_URL") {
		cfg.persistence.database_url = v;
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = string("PARLEY_DB_MAX_CONNECTIONS")
		&& let Ok(max) = v.parse::<u32>()
		&& max > 0
	{
		cfg.persistence.max_connections = max;
		info!(max, "persistence: max_connections overridden by env");
	}

	if let Some(v) = string("PARLEY_DB_OP_TIMEOUT_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.persistence.op_timeout = Duration::from_secs(secs);
		info!(secs, "persistence: op_timeout overridden by env");
	}
}
