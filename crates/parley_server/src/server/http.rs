#![forbid(unsafe_code)]

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{self, HeaderValue};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::warn;

pub type HttpResponse = Response<Full<Bytes>>;

pub fn empty(status: StatusCode) -> HttpResponse {
	let mut res = Response::new(Full::new(Bytes::new()));
	*res.status_mut() = status;
	res
}

pub fn text(status: StatusCode, body: &'static str) -> HttpResponse {
	let mut res = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
	*res.status_mut() = status;
	res
}

pub fn json<T: Serialize>(status: StatusCode, value: &T) -> HttpResponse {
	match serde_json::to_vec(value) {
		Ok(body) => {
			let mut res = Response::new(Full::new(Bytes::from(body)));
			*res.status_mut() = status;
			res.headers_mut()
				.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
			res
		}
		Err(e) => {
			warn!(error = %e, "failed to encode json response");
			empty(StatusCode::INTERNAL_SERVER_ERROR)
		}
	}
}

#[derive(Serialize)]
struct ErrorBody<'a> {
	error: &'a str,
}

/// `{"error": "..."}` with the given status.
pub fn error(status: StatusCode, message: &str) -> HttpResponse {
	json(status, &ErrorBody { error: message })
}

pub fn with_cors(mut res: HttpResponse, origin: &HeaderValue) -> HttpResponse {
	let headers = res.headers_mut();
	headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
	headers.insert(
		header::ACCESS_CONTROL_ALLOW_HEADERS,
		HeaderValue::from_static("Content-Type, Authorization"),
	);
	headers.insert(
		header::ACCESS_CONTROL_ALLOW_METHODS,
		HeaderValue::from_static("GET, POST, OPTIONS"),
	);
	res
}
