#![forbid(unsafe_code)]

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parley_domain::{DisplayName, Identity, UserId};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::util::secret::SecretString;
use crate::util::time::unix_secs_now;

const TOKEN_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("missing credential")]
	Missing,

	#[error("malformed token: {0}")]
	Malformed(String),

	#[error("invalid token signature")]
	BadSignature,

	#[error("token expired")]
	Expired,

	#[error("invalid signing key")]
	Key,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: i64,
	pub name: String,
	pub exp: u64,
}

/// Turns an opaque credential into a verified identity.
pub trait IdentityVerifier: Send + Sync {
	fn verify(&self, credential: &str) -> Result<Identity, AuthError>;
}

/// Issues and verifies `v1.<claims>.<sig>` HMAC-SHA256 tokens.
#[derive(Clone)]
pub struct TokenAuthority {
	secret: SecretString,
	ttl: Duration,
}

impl TokenAuthority {
	pub fn new(secret: SecretString, ttl: Duration) -> Self {
		Self { secret, ttl }
	}

	pub fn issue(&self, identity: &Identity) -> Result<String, AuthError> {
		self.issue_at(identity, unix_secs_now())
	}

	fn issue_at(&self, identity: &Identity, now: u64) -> Result<String, AuthError> {
		let claims = AuthClaims {
			sub: identity.user_id.get(),
			name: identity.display_name.as_str().to_string(),
			exp: now.saturating_add(self.ttl.as_secs()),
		};
		let payload = serde_json::to_vec(&claims).map_err(|e| AuthError::Malformed(e.to_string()))?;
		let payload_b64 = URL_SAFE_NO_PAD.encode(payload);

		let mut mac = self.mac()?;
		mac.update(payload_b64.as_bytes());
		let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

		Ok(format!("{TOKEN_VERSION}.{payload_b64}.{sig_b64}"))
	}

	fn verify_at(&self, token: &str, now: u64) -> Result<Identity, AuthError> {
		let token = token.trim();
		if token.is_empty() {
			return Err(AuthError::Missing);
		}

		let parts = token.split('.').collect::<Vec<_>>();
		if parts.len() != 3 || parts[0] != TOKEN_VERSION {
			return Err(AuthError::Malformed("invalid token format".to_string()));
		}

		let payload_b64 = parts[1];
		let provided_sig = URL_SAFE_NO_PAD
			.decode(parts[2])
			.map_err(|e| AuthError::Malformed(format!("decode token signature: {e}")))?;

		let mut mac = self.mac()?;
		mac.update(payload_b64.as_bytes());
		mac.verify_slice(&provided_sig).map_err(|_| AuthError::BadSignature)?;

		let payload = URL_SAFE_NO_PAD
			.decode(payload_b64)
			.map_err(|e| AuthError::Malformed(format!("decode token payload: {e}")))?;
		let claims: AuthClaims =
			serde_json::from_slice(&payload).map_err(|e| AuthError::Malformed(format!("parse token claims: {e}")))?;

		if claims.exp <= now {
			return Err(AuthError::Expired);
		}

		let user_id = UserId::new(claims.sub).map_err(|e| AuthError::Malformed(format!("sub: {e}")))?;
		let display_name = DisplayName::new(claims.name).map_err(|e| AuthError::Malformed(format!("name: {e}")))?;
		Ok(Identity::new(user_id, display_name))
	}

	fn mac(&self) -> Result<Hmac<Sha256>, AuthError> {
		Hmac::<Sha256>::new_from_slice(self.secret.expose().as_bytes()).map_err(|_| AuthError::Key)
	}
}

impl IdentityVerifier for TokenAuthority {
	fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
		self.verify_at(credential, unix_secs_now())
	}
}

impl std::fmt::Debug for TokenAuthority {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TokenAuthority")
			.field("secret", &self.secret)
			.field("ttl", &self.ttl)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn authority() -> TokenAuthority {
		TokenAuthority::new(SecretString::new("test-secret"), Duration::from_secs(60))
	}

	fn alice() -> Identity {
		Identity::new(UserId::new(7).unwrap(), DisplayName::new("Alice").unwrap())
	}

	#[test]
	fn issued_token_verifies_to_same_identity() {
		let auth = authority();
		let token = auth.issue(&alice()).unwrap();
		assert!(token.starts_with("v1."));
		assert_eq!(auth.verify(&token).unwrap(), alice());
	}

	#[test]
	fn rejects_token_signed_with_other_secret() {
		let other = TokenAuthority::new(SecretString::new("other"), Duration::from_secs(60));
		let token = other.issue(&alice()).unwrap();
		assert!(matches!(authority().verify(&token), Err(AuthError::BadSignature)));
	}

	#[test]
	fn rejects_tampered_claims() {
		let auth = authority();
		let token = auth.issue(&alice()).unwrap();
		let parts = token.split('.').collect::<Vec<_>>();
		let forged = URL_SAFE_NO_PAD.encode(br#"{"sub":1,"name":"Mallory","exp":99999999999}"#);
		let tampered = format!("{}.{}.{}", parts[0], forged, parts[2]);
		assert!(matches!(auth.verify(&tampered), Err(AuthError::BadSignature)));
	}

	#[test]
	fn rejects_expired_token() {
		let auth = authority();
		let token = auth.issue_at(&alice(), 1_000).unwrap();
		assert!(auth.verify_at(&token, 1_059).is_ok());
		assert!(matches!(auth.verify_at(&token, 1_060), Err(AuthError::Expired)));
	}

	#[test]
	fn rejects_missing_and_garbage() {
		let auth = authority();
		assert!(matches!(auth.verify(""), Err(AuthError::Missing)));
		assert!(matches!(auth.verify("not-a-token"), Err(AuthError::Malformed(_))));
		assert!(matches!(auth.verify("v2.a.b"), Err(AuthError::Malformed(_))));
	}
}
