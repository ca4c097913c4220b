#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use hyper::body::Body;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use parley_domain::Identity;
use parley_protocol::version::{TOKEN_QUERY_PARAM, WS_PATH};
use tokio::net::TcpListener;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, info, warn};

use crate::server::api;
use crate::server::auth::AuthError;
use crate::server::connection::Connection;
use crate::server::http::{HttpResponse, empty, error, with_cors};
use crate::server::state::AppState;

/// Accept HTTP connections until `shutdown` resolves.
///
/// A connection that has not sent a complete request head within
/// `header_read_timeout` is closed, including idle keep-alive connections.
/// Connections already upgraded keep running; they end when the hub shuts down.
pub async fn serve<F>(
	listener: TcpListener,
	state: AppState,
	header_read_timeout: Duration,
	shutdown: F,
) -> anyhow::Result<()>
where
	F: Future<Output = ()>,
{
	tokio::pin!(shutdown);

	loop {
		let (stream, remote) = tokio::select! {
			_ = &mut shutdown => {
				info!("ingress: shutdown requested; no longer accepting");
				return Ok(());
			}
			res = listener.accept() => match res {
				Ok(v) => v,
				Err(e) => {
					warn!(error = %e, "ingress: accept failed");
					continue;
				}
			},
		};

		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| route(req, state.clone()));
			let mut builder = http1::Builder::new();
			builder.timer(TokioTimer::new()).header_read_timeout(header_read_timeout);
			if let Err(err) = builder
				.serve_connection(io, service)
				.with_upgrades()
				.await
			{
				debug!(%remote, error = %err, "ingress: http connection error");
			}
		});
	}
}

/// Dispatch one request: `/ws` upgrades, everything else goes to the JSON API.
pub async fn route<B>(req: Request<B>, state: AppState) -> Result<HttpResponse, Infallible>
where
	B: Body<Data = Bytes>,
	B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
	if req.uri().path() == WS_PATH {
		let res = if req.method() == Method::OPTIONS {
			empty(StatusCode::NO_CONTENT)
		} else {
			upgrade_websocket(req, &state)
		};
		return Ok(with_cors(res, &state.cors_origin));
	}

	Ok(api::handle(req, &state).await)
}

fn upgrade_websocket<B>(mut req: Request<B>, state: &AppState) -> HttpResponse {
	if req.method() != Method::GET {
		return error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
	}

	// Authenticate before anything else: a rejected request never upgrades.
	let identity = match authenticate(req.uri().query(), state) {
		Ok(identity) => identity,
		Err(e) => {
			metrics::counter!("parley_server_auth_rejected_total").increment(1);
			debug!(error = %e, "ingress: upgrade rejected");
			return error(StatusCode::UNAUTHORIZED, "unauthorized");
		}
	};

	let accept = match websocket_accept_key(req.headers()) {
		Ok(accept) => accept,
		Err(reason) => return error(StatusCode::BAD_REQUEST, reason),
	};

	let conn_id = state.next_connection_id();
	let on_upgrade = hyper::upgrade::on(&mut req);
	let state = state.clone();

	tokio::spawn(async move {
		let upgraded = match on_upgrade.await {
			Ok(u) => u,
			Err(e) => {
				warn!(%conn_id, error = %e, "ingress: upgrade failed");
				return;
			}
		};

		let ws = WebSocketStream::from_raw_socket(
			TokioIo::new(upgraded),
			Role::Server,
			Some(state.connection.websocket_config()),
		)
		.await;

		let connection = match Connection::register(&state.hub, conn_id, identity, &state.connection).await {
			Ok(c) => c,
			Err(e) => {
				warn!(%conn_id, error = %e, "ingress: register failed");
				return;
			}
		};

		connection.run(ws, state.hub.clone(), state.connection.clone()).await;
	});

	let mut res = empty(StatusCode::SWITCHING_PROTOCOLS);
	let headers = res.headers_mut();
	headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
	headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
	headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
	res
}

fn authenticate(query: Option<&str>, state: &AppState) -> Result<Identity, AuthError> {
	let token = query
		.and_then(|q| {
			url::form_urlencoded::parse(q.as_bytes())
				.find(|(k, _)| k == TOKEN_QUERY_PARAM)
				.map(|(_, v)| v.into_owned())
		})
		.filter(|t| !t.trim().is_empty())
		.ok_or(AuthError::Missing)?;

	state.verifier.verify(&token)
}

/// Validate the upgrade headers and derive `Sec-WebSocket-Accept`.
fn websocket_accept_key(headers: &HeaderMap) -> Result<HeaderValue, &'static str> {
	let upgrade_ok = headers
		.get(header::UPGRADE)
		.is_some_and(|v| header_contains_token(v, "websocket"));
	let connection_ok = headers
		.get(header::CONNECTION)
		.is_some_and(|v| header_contains_token(v, "upgrade"));
	if !upgrade_ok || !connection_ok {
		return Err("expected websocket upgrade");
	}

	if headers.get(header::SEC_WEBSOCKET_VERSION).map(HeaderValue::as_bytes) != Some(&b"13"[..]) {
		return Err("unsupported websocket version");
	}

	let key = headers
		.get(header::SEC_WEBSOCKET_KEY)
		.ok_or("missing sec-websocket-key")?;

	HeaderValue::from_str(&derive_accept_key(key.as_bytes())).map_err(|_| "invalid sec-websocket-key")
}

fn header_contains_token(value: &HeaderValue, token: &str) -> bool {
	value
		.to_str()
		.map(|raw| raw.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
		.unwrap_or(false)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn upgrade_headers() -> HeaderMap {
		let mut h = HeaderMap::new();
		h.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
		h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
		h.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
		h.insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="));
		h
	}

	#[test]
	fn derives_accept_key_for_valid_upgrade() {
		let accept = websocket_accept_key(&upgrade_headers()).unwrap();
		assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
	}

	#[test]
	fn rejects_incomplete_upgrades() {
		let mut h = upgrade_headers();
		h.remove(header::SEC_WEBSOCKET_KEY);
		assert!(websocket_accept_key(&h).is_err());

		let mut h = upgrade_headers();
		h.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
		assert!(websocket_accept_key(&h).is_err());

		let mut h = upgrade_headers();
		h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
		assert!(websocket_accept_key(&h).is_err());
	}
}
