#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::http::{HttpResponse, empty, text};
use crate::server::hub::Hub;

/// Readiness flag plus the hub whose liveness gates `/readyz`.
#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	hub: Hub,
}

impl HealthState {
	pub fn new(hub: Hub) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			hub,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed) && !self.hub.is_closed()
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<HttpResponse, hyper::Error> {
	Ok(health_response(req.method(), req.uri().path(), &state))
}

fn health_response(method: &Method, path: &str, state: &HealthState) -> HttpResponse {
	if method != Method::GET {
		return empty(StatusCode::METHOD_NOT_ALLOWED);
	}

	match path {
		"/healthz" => text(StatusCode::OK, "ok"),
		"/readyz" if state.is_ready() => text(StatusCode::OK, "ready"),
		"/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "not-ready"),
		_ => empty(StatusCode::NOT_FOUND),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::server::hub::HubConfig;
	use crate::server::store::InMemoryStore;

	#[tokio::test]
	async fn ready_only_after_mark_and_while_hub_runs() {
		let hub = Hub::start(Arc::new(InMemoryStore::new()), HubConfig::default());
		let state = HealthState::new(hub.clone());

		let res = health_response(&Method::GET, "/readyz", &state);
		assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

		state.mark_ready();
		assert_eq!(health_response(&Method::GET, "/readyz", &state).status(), StatusCode::OK);
		assert_eq!(health_response(&Method::GET, "/healthz", &state).status(), StatusCode::OK);

		hub.shutdown().await;
		assert_eq!(
			health_response(&Method::GET, "/readyz", &state).status(),
			StatusCode::SERVICE_UNAVAILABLE
		);
	}

	#[tokio::test]
	async fn rejects_other_methods_and_paths() {
		let hub = Hub::start(Arc::new(InMemoryStore::new()), HubConfig::default());
		let state = HealthState::new(hub);
		assert_eq!(
			health_response(&Method::POST, "/healthz", &state).status(),
			StatusCode::METHOD_NOT_ALLOWED
		);
		assert_eq!(health_response(&Method::GET, "/nope", &state).status(), StatusCode::NOT_FOUND);
	}
}
