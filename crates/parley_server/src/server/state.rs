#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hyper::header::HeaderValue;
use parley_domain::ConnectionId;

use crate::server::auth::{IdentityVerifier, TokenAuthority};
use crate::server::connection::ConnectionSettings;
use crate::server::hub::Hub;
use crate::server::store::MessageStore;

/// Shared state handed to every HTTP request.
#[derive(Clone)]
pub struct AppState {
	pub hub: Hub,
	pub store: Arc<dyn MessageStore>,
	pub tokens: Arc<TokenAuthority>,
	pub verifier: Arc<dyn IdentityVerifier>,
	pub connection: ConnectionSettings,
	pub cors_origin: HeaderValue,

	next_conn_id: Arc<AtomicU64>,
}

impl AppState {
	pub fn new(
		hub: Hub,
		store: Arc<dyn MessageStore>,
		tokens: TokenAuthority,
		connection: ConnectionSettings,
		cors_origin: HeaderValue,
	) -> Self {
		let tokens = Arc::new(tokens);
		Self {
			hub,
			store,
			verifier: tokens.clone(),
			tokens,
			connection,
			cors_origin,
			next_conn_id: Arc::new(AtomicU64::new(1)),
		}
	}

	pub fn next_connection_id(&self) -> ConnectionId {
		ConnectionId::new(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
	}
}
