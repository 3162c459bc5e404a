#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::{Envelope, EnvelopeKind, Payload};

/// Default maximum encoded envelope size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("malformed envelope: {0}")]
	Malformed(#[source] serde_json::Error),

	#[error("unknown envelope type: {0}")]
	UnknownKind(String),

	#[error("invalid {kind} payload: {source}")]
	InvalidPayload {
		kind: EnvelopeKind,
		#[source]
		source: serde_json::Error,
	},

	#[error("json encode error: {0}")]
	Encode(#[source] serde_json::Error),
}

/// On-the-wire shape: `{type, payload, timestamp}`.
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	payload: serde_json::Value,
	#[serde(default)]
	timestamp: i64,
}

/// Encode an envelope as a JSON text frame.
pub fn encode_envelope(env: &Envelope, max_frame_size: usize) -> Result<String, CodecError> {
	let payload = match &env.payload {
		Payload::Join(p) => serde_json::to_value(p),
		Payload::Chat(p) => serde_json::to_value(p),
		Payload::Extension(p) => serde_json::to_value(p),
		Payload::System(p) => serde_json::to_value(p),
		Payload::Roster(p) => serde_json::to_value(p),
		Payload::Error(p) | Payload::AuthError(p) => serde_json::to_value(p),
		Payload::AuthSuccess(p) => serde_json::to_value(p),
	}
	.map_err(CodecError::Encode)?;

	let wire = WireEnvelope {
		kind: env.kind().as_str().to_string(),
		payload,
		timestamp: env.timestamp,
	};

	let out = serde_json::to_string(&wire).map_err(CodecError::Encode)?;
	if out.len() > max_frame_size {
		return Err(CodecError::FrameTooLarge {
			len: out.len(),
			max: max_frame_size,
		});
	}
	Ok(out)
}

/// Encode using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_envelope_default(env: &Envelope) -> Result<String, CodecError> {
	encode_envelope(env, DEFAULT_MAX_FRAME_SIZE)
}

/// Decode one JSON text frame.
///
/// The outer shape is checked first, then the payload against the shape its `type` requires, so
/// callers can tell an unknown kind from a known kind with a bad payload.
pub fn decode_envelope(src: &str, max_frame_size: usize) -> Result<Envelope, CodecError> {
	if src.len() > max_frame_size {
		return Err(CodecError::FrameTooLarge {
			len: src.len(),
			max: max_frame_size,
		});
	}

	let wire: WireEnvelope = serde_json::from_str(src).map_err(CodecError::Malformed)?;
	decode_wire(wire)
}

/// Decode a binary frame carrying the same JSON; invalid UTF-8 is reported as malformed.
pub fn decode_envelope_bytes(src: &[u8], max_frame_size: usize) -> Result<Envelope, CodecError> {
	if src.len() > max_frame_size {
		return Err(CodecError::FrameTooLarge {
			len: src.len(),
			max: max_frame_size,
		});
	}

	let wire: WireEnvelope = serde_json::from_slice(src).map_err(CodecError::Malformed)?;
	decode_wire(wire)
}

fn decode_wire(wire: WireEnvelope) -> Result<Envelope, CodecError> {
	let kind = EnvelopeKind::from_wire(&wire.kind).ok_or_else(|| CodecError::UnknownKind(wire.kind.clone()))?;
	let bad = |source| CodecError::InvalidPayload { kind, source };

	let payload = match kind {
		EnvelopeKind::Join => Payload::Join(serde_json::from_value(wire.payload).map_err(bad)?),
		EnvelopeKind::Chat => Payload::Chat(serde_json::from_value(wire.payload).map_err(bad)?),
		EnvelopeKind::System => Payload::System(serde_json::from_value(wire.payload).map_err(bad)?),
		EnvelopeKind::Extension => Payload::Extension(serde_json::from_value(wire.payload).map_err(bad)?),
		EnvelopeKind::Roster => Payload::Roster(serde_json::from_value(wire.payload).map_err(bad)?),
		EnvelopeKind::Error => Payload::Error(serde_json::from_value(wire.payload).map_err(bad)?),
		EnvelopeKind::AuthSuccess => Payload::AuthSuccess(serde_json::from_value(wire.payload).map_err(bad)?),
		EnvelopeKind::AuthError => Payload::AuthError(serde_json::from_value(wire.payload).map_err(bad)?),
	};

	Ok(Envelope::new(payload, wire.timestamp))
}

/// Decode using `DEFAULT_MAX_FRAME_SIZE`.
pub fn decode_envelope_default(src: &str) -> Result<Envelope, CodecError> {
	decode_envelope(src, DEFAULT_MAX_FRAME_SIZE)
}
