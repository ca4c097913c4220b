#![forbid(unsafe_code)]

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use bytes::Bytes;
use http_body_util::{BodyExt as _, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{AUTHORIZATION, HeaderMap};
use hyper::{Method, Request, StatusCode};
use parley_domain::{DisplayName, Identity, UserId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::server::http::{HttpResponse, empty, error, json, with_cors};
use crate::server::state::AppState;
use crate::server::store::StoreError;

/// Upper bound on JSON request bodies.
pub const MAX_BODY_BYTES: usize = 16 * 1024;

pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 200;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
	#[serde(default)]
	email: String,
	#[serde(default)]
	password: String,
	#[serde(default)]
	display_name: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
	#[serde(default)]
	email: String,
	#[serde(default)]
	password: String,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
	id: UserId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
	token: String,
	display_name: DisplayName,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
	id: UserId,
	email: String,
	display_name: DisplayName,
}

/// Route one `/api/*` (or unknown) request; every response carries CORS headers.
pub async fn handle<B>(req: Request<B>, state: &AppState) -> HttpResponse
where
	B: Body<Data = Bytes>,
	B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
	let method = req.method().clone();
	let path = req.uri().path().to_owned();

	let res = if method == Method::OPTIONS {
		empty(StatusCode::NO_CONTENT)
	} else {
		match (path.as_str(), method) {
			("/api/register", Method::POST) => register(req, state).await,
			("/api/login", Method::POST) => login(req, state).await,
			("/api/me", Method::GET) => match bearer_identity(req.headers(), state) {
				Ok(identity) => me(identity, state).await,
				Err(res) => res,
			},
			("/api/messages", Method::GET) => match bearer_identity(req.headers(), state) {
				Ok(_) => messages(history_limit(req.uri().query()), state).await,
				Err(res) => res,
			},
			("/api/register" | "/api/login" | "/api/me" | "/api/messages", _) => {
				error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
			}
			_ => error(StatusCode::NOT_FOUND, "not found"),
		}
	};

	with_cors(res, &state.cors_origin)
}

async fn register<B>(req: Request<B>, state: &AppState) -> HttpResponse
where
	B: Body<Data = Bytes>,
	B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
	let input: RegisterRequest = match read_json(req.into_body()).await {
		Ok(v) => v,
		Err(res) => return res,
	};

	let email = input.email.trim().to_string();
	if email.is_empty() || input.password.is_empty() || input.display_name.trim().is_empty() {
		return error(StatusCode::BAD_REQUEST, "missing fields");
	}
	let display_name = match DisplayName::new(input.display_name) {
		Ok(n) => n,
		Err(e) => return error(StatusCode::BAD_REQUEST, &format!("invalid displayName: {e}")),
	};

	let password = input.password;
	let hash = match tokio::task::spawn_blocking(move || hash_password(&password)).await {
		Ok(Ok(h)) => h,
		Ok(Err(e)) => {
			warn!(error = %e, "password hashing failed");
			return error(StatusCode::INTERNAL_SERVER_ERROR, "hash");
		}
		Err(e) => {
			warn!(error = %e, "password hashing task failed");
			return error(StatusCode::INTERNAL_SERVER_ERROR, "hash");
		}
	};

	match state.store.create_user(&email, &display_name, &hash).await {
		Ok(id) => {
			info!(user_id = %id, "user registered");
			json(StatusCode::CREATED, &RegisterResponse { id })
		}
		Err(StoreError::Conflict(_)) => error(StatusCode::CONFLICT, "email exists"),
		Err(e) => {
			warn!(error = %e, "create user failed");
			error(StatusCode::INTERNAL_SERVER_ERROR, "db")
		}
	}
}

async fn login<B>(req: Request<B>, state: &AppState) -> HttpResponse
where
	B: Body<Data = Bytes>,
	B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
	let input: LoginRequest = match read_json(req.into_body()).await {
		Ok(v) => v,
		Err(res) => return res,
	};

	let user = match state.store.find_user_by_email(input.email.trim()).await {
		Ok(Some(u)) => u,
		Ok(None) => return error(StatusCode::UNAUTHORIZED, "invalid credentials"),
		Err(e) => {
			warn!(error = %e, "lookup user failed");
			return error(StatusCode::INTERNAL_SERVER_ERROR, "db");
		}
	};

	let password = input.password;
	let stored_hash = user.password_hash.clone();
	let ok = tokio::task::spawn_blocking(move || verify_password(&password, &stored_hash))
		.await
		.unwrap_or(false);
	if !ok {
		return error(StatusCode::UNAUTHORIZED, "invalid credentials");
	}

	let identity = Identity::new(user.id, user.display_name);
	match state.tokens.issue(&identity) {
		Ok(token) => json(
			StatusCode::OK,
			&LoginResponse {
				token,
				display_name: identity.display_name,
			},
		),
		Err(e) => {
			warn!(error = %e, "token issue failed");
			error(StatusCode::INTERNAL_SERVER_ERROR, "token")
		}
	}
}

async fn me(identity: Identity, state: &AppState) -> HttpResponse {
	match state.store.find_user_by_id(identity.user_id).await {
		Ok(Some(user)) => json(
			StatusCode::OK,
			&MeResponse {
				id: user.id,
				email: user.email,
				display_name: user.display_name,
			},
		),
		Ok(None) => error(StatusCode::NOT_FOUND, "not found"),
		Err(e) => {
			warn!(error = %e, "lookup user failed");
			error(StatusCode::INTERNAL_SERVER_ERROR, "db")
		}
	}
}

async fn messages(limit: u32, state: &AppState) -> HttpResponse {
	match state.store.recent_messages(limit).await {
		Ok(mut list) => {
			// Oldest first for display.
			list.reverse();
			json(StatusCode::OK, &list)
		}
		Err(e) => {
			warn!(error = %e, "list messages failed");
			error(StatusCode::INTERNAL_SERVER_ERROR, "db")
		}
	}
}

fn bearer_identity(headers: &HeaderMap, state: &AppState) -> Result<Identity, HttpResponse> {
	let token = headers
		.get(AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "));

	let Some(token) = token else {
		metrics::counter!("parley_server_auth_rejected_total").increment(1);
		return Err(error(StatusCode::UNAUTHORIZED, "missing bearer"));
	};

	state.verifier.verify(token).map_err(|e| {
		metrics::counter!("parley_server_auth_rejected_total").increment(1);
		debug!(error = %e, "bearer token rejected");
		error(StatusCode::UNAUTHORIZED, "invalid token")
	})
}

/// `limit` query parameter, falling back to the default outside `1..=MAX_HISTORY_LIMIT`.
pub fn history_limit(query: Option<&str>) -> u32 {
	query
		.and_then(|q| {
			url::form_urlencoded::parse(q.as_bytes())
				.find(|(k, _)| k == "limit")
				.and_then(|(_, v)| v.parse::<u32>().ok())
		})
		.filter(|n| (1..=MAX_HISTORY_LIMIT).contains(n))
		.unwrap_or(DEFAULT_HISTORY_LIMIT)
}

async fn read_json<B, T>(body: B) -> Result<T, HttpResponse>
where
	B: Body<Data = Bytes>,
	B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
	T: DeserializeOwned,
{
	let bytes = match Limited::new(body, MAX_BODY_BYTES).collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
			return Err(error(StatusCode::PAYLOAD_TOO_LARGE, "body too large"));
		}
		Err(e) => {
			debug!(error = %e, "failed to read request body");
			return Err(error(StatusCode::BAD_REQUEST, "bad body"));
		}
	};

	serde_json::from_slice(&bytes).map_err(|_| error(StatusCode::BAD_REQUEST, "bad json"))
}

fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
	let salt = SaltString::generate(&mut OsRng);
	Ok(Argon2::default().hash_password(password.as_bytes(), &salt)?.to_string())
}

fn verify_password(password: &str, hash: &str) -> bool {
	match PasswordHash::new(hash) {
		Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
		Err(_) => false,
	}
}
