#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use devchat_domain::ExtensionStates;
use devchat_util::secret::SecretString;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

/// Outcome of a successful token check.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedIdentity {
	pub user_id: String,
	pub nick: Option<String>,
	/// Prior extension state carried by the identity, fed to `restore_all`.
	pub extension_states: Option<ExtensionStates>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
	#[error("invalid token format")]
	Format,
	#[error("invalid token encoding")]
	Encoding,
	#[error("invalid token signature")]
	Signature,
	#[error("invalid token claims")]
	Claims,
	#[error("token expired")]
	Expired,
	#[error("identity verification timed out")]
	Timeout,
}

/// External identity collaborator: the join token is handed over unmodified.
#[async_trait::async_trait]
pub trait IdentityVerifier: Send + Sync {
	async fn verify(&self, token: &str) -> Result<VerifiedIdentity, IdentityError>;
}

/// Claims inside a `v1.<payload>.<signature>` token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
	pub sub: String,
	pub exp: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nick: Option<String>,
	#[serde(rename = "extensionStates", default, skip_serializing_if = "Option::is_none")]
	pub extension_states: Option<ExtensionStates>,
}

/// Stateless HMAC-SHA256 tokens shared with the identity provider.
#[derive(Debug, Clone)]
pub struct HmacIdentityVerifier {
	secret: SecretString,
}

impl HmacIdentityVerifier {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}

	/// Mint a token for `claims`.
	pub fn issue(&self, claims: &TokenClaims) -> Result<String, IdentityError> {
		let payload = serde_json::to_vec(claims).map_err(|_| IdentityError::Claims)?;
		let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
		let sig = sign(payload_b64.as_bytes(), self.secret.expose().as_bytes())?;
		Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
	}

	pub fn verify_token(&self, token: &str) -> Result<TokenClaims, IdentityError> {
		let parts = token.split('.').collect::<Vec<_>>();
		if parts.len() != 3 || parts[0] != "v1" {
			return Err(IdentityError::Format);
		}

		let payload_b64 = parts[1];
		let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| IdentityError::Encoding)?;
		let provided_sig = URL_SAFE_NO_PAD.decode(parts[2]).map_err(|_| IdentityError::Encoding)?;
		let expected_sig = sign(payload_b64.as_bytes(), self.secret.expose().as_bytes())?;

		if !constant_time_eq(&expected_sig, &provided_sig) {
			return Err(IdentityError::Signature);
		}

		let claims: TokenClaims = serde_json::from_slice(&payload).map_err(|_| IdentityError::Claims)?;
		if claims.sub.trim().is_empty() {
			return Err(IdentityError::Claims);
		}

		let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
		if claims.exp <= now {
			return Err(IdentityError::Expired);
		}

		Ok(claims)
	}
}

#[async_trait::async_trait]
impl IdentityVerifier for HmacIdentityVerifier {
	async fn verify(&self, token: &str) -> Result<VerifiedIdentity, IdentityError> {
		let claims = self.verify_token(token)?;
		Ok(VerifiedIdentity {
			user_id: claims.sub,
			nick: claims.nick.filter(|n| !n.trim().is_empty()),
			extension_states: claims.extension_states,
		})
	}
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Result<Vec<u8>, IdentityError> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| IdentityError::Signature)?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
