#![forbid(unsafe_code)]

pub mod codec;
pub mod envelope;

pub use codec::{
	CodecError, DEFAULT_MAX_FRAME_SIZE, decode_envelope, decode_envelope_bytes, decode_envelope_default, encode_envelope,
	encode_envelope_default,
};
pub use envelope::{
	AuthSuccessPayload, AuthUser, ChatPayload, Envelope, EnvelopeKind, ErrorPayload, ExtensionPayload, JoinPayload,
	Payload, RosterPayload, SystemPayload,
};
