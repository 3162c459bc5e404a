#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `ws://host:port` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl WsEndpoint {
		pub fn new(host: impl Into<String>, port: u16) -> Self {
			Self {
				host: host.into(),
				port,
			}
		}

		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Client connect URL.
		pub fn url(&self) -> String {
			format!("ws://{}", self.hostport())
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse `ws://host:port`. A bare `host:port` is accepted as well.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
			}

			let rest = match s.split_once("://") {
				Some(("ws", rest)) => rest,
				Some((scheme, _)) => {
					return Err(format!("unsupported endpoint scheme {scheme:?} (expected ws://host:port): {s}"));
				}
				None => s,
			};

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected ws://host:port without path/query/fragment): {s}"
				));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected ws://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected ws://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like ws://[::1]:8080): {s}"
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_dns_hostname() {
			let e = WsEndpoint::parse("ws://chat.example.com:8080").unwrap();
			assert_eq!(e.host, "chat.example.com");
			assert_eq!(e.port, 8080);
			assert_eq!(e.url(), "ws://chat.example.com:8080");
		}

		#[test]
		fn parses_bare_hostport_and_bracketed_ipv6() {
			let e = WsEndpoint::parse("192.168.0.7:9000").unwrap();
			assert_eq!(e.hostport(), "192.168.0.7:9000");

			let e6 = WsEndpoint::parse("ws://[::1]:8080").unwrap();
			assert_eq!(e6.host, "[::1]");
			assert_eq!(e6.to_socket_addr_if_ip_literal().unwrap().to_string(), "[::1]:8080");
		}

		#[test]
		fn rejects_other_schemes_and_paths() {
			assert!(WsEndpoint::parse("wss://127.0.0.1:8080").is_err());
			assert!(WsEndpoint::parse("quic://127.0.0.1:8080").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1:8080/room").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1:8080?x=y").is_err());
		}

		#[test]
		fn rejects_port_zero_missing_port_and_unbracketed_ipv6() {
			assert!(WsEndpoint::parse("ws://127.0.0.1:0").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1").is_err());
			let err = WsEndpoint::parse("ws://::1:8080").unwrap_err();
			assert!(err.to_lowercase().contains("ipv6"));
		}

		#[test]
		fn dns_host_is_not_a_socket_addr() {
			let e = WsEndpoint::parse("ws://chat.example.com:443").unwrap();
			assert!(e.to_socket_addr_if_ip_literal().is_err());
		}
	}
}

pub mod invite {
	use base64::Engine as _;
	use base64::engine::general_purpose::URL_SAFE_NO_PAD;
	use serde::{Deserialize, Serialize};

	use crate::endpoint::WsEndpoint;

	/// Shareable join details, encoded as base64url JSON.
	#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
	pub struct Invite {
		pub host: String,
		pub port: u16,
		#[serde(rename = "roomName", default, skip_serializing_if = "Option::is_none")]
		pub room_name: Option<String>,
	}

	impl Invite {
		pub fn encode(&self) -> String {
			// Serializing a struct of strings and integers cannot fail.
			let json = serde_json::to_vec(self).unwrap_or_default();
			URL_SAFE_NO_PAD.encode(json)
		}

		pub fn decode(code: &str) -> Result<Self, String> {
			let code = code.trim().trim_end_matches('=');
			let raw = URL_SAFE_NO_PAD
				.decode(code)
				.map_err(|e| format!("invalid invite code (not base64url): {e}"))?;
			let invite: Invite =
				serde_json::from_slice(&raw).map_err(|e| format!("invalid invite code (bad payload): {e}"))?;
			if invite.host.trim().is_empty() || invite.port == 0 {
				return Err("invalid invite code (missing host or port)".to_string());
			}
			Ok(invite)
		}

		pub fn endpoint(&self) -> WsEndpoint {
			WsEndpoint::new(self.host.clone(), self.port)
		}
	}

}

pub mod secret {
	use std::fmt;

	/// Wrapper that redacts in logs.
	#[derive(Clone, PartialEq, Eq)]
	pub struct SecretString(String);

	impl SecretString {
		pub fn new(s: impl Into<String>) -> Self {
			Self(s.into())
		}

		/// Access the inner secret string.
		pub fn expose(&self) -> &str {
			&self.0
		}
	}

	impl fmt::Debug for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("SecretString(<redacted>)")
		}
	}

	impl fmt::Display for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("<redacted>")
		}
	}
}

pub mod time {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	/// Current Unix time in milliseconds.
	#[inline]
	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}
}
