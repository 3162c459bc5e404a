use devchat_domain::{Participant, ParticipantId};
use devchat_protocol::{
	AuthUser, CodecError, DEFAULT_MAX_FRAME_SIZE, Envelope, EnvelopeKind, Payload, decode_envelope,
	decode_envelope_default, encode_envelope_default,
};
use proptest::prelude::*;
use serde_json::{Value, json};

fn to_json(env: &Envelope) -> Value {
	let text = encode_envelope_default(env).expect("encode");
	serde_json::from_str(&text).expect("valid json")
}

#[test]
fn decodes_join_from_browser_style_frame() {
	let env = decode_envelope_default(r#"{"type":"join","payload":{"nick":"Bob"},"timestamp":1700000000000}"#)
		.expect("decode join");

	assert_eq!(env.kind(), EnvelopeKind::Join);
	assert_eq!(env.timestamp, 1_700_000_000_000);
	match env.payload {
		Payload::Join(p) => {
			assert_eq!(p.nick, "Bob");
			assert_eq!(p.token, None);
		}
		other => panic!("expected join, got {other:?}"),
	}
}

#[test]
fn join_token_is_carried_unmodified() {
	let env = decode_envelope_default(r#"{"type":"join","payload":{"nick":"Bob","token":"v1.abc.def"}}"#)
		.expect("decode join");
	match env.payload {
		Payload::Join(p) => assert_eq!(p.token.as_deref(), Some("v1.abc.def")),
		other => panic!("expected join, got {other:?}"),
	}
	assert_eq!(env.timestamp, 0, "missing timestamp defaults to zero");
}

#[test]
fn chat_without_sender_is_accepted() {
	let env = decode_envelope_default(r#"{"type":"chat","payload":{"message":"hi"}}"#).expect("decode chat");
	match env.payload {
		Payload::Chat(p) => {
			assert_eq!(p.message, "hi");
			assert!(p.sender.is_empty());
		}
		other => panic!("expected chat, got {other:?}"),
	}
}

#[test]
fn unknown_kind_is_distinguished_from_bad_payload() {
	match decode_envelope_default(r#"{"type":"plugin","payload":{"message":"x","sender":"dice"}}"#) {
		Err(CodecError::UnknownKind(kind)) => assert_eq!(kind, "plugin"),
		other => panic!("expected UnknownKind, got {other:?}"),
	}

	match decode_envelope_default(r#"{"type":"chat","payload":{"text":"hi"}}"#) {
		Err(CodecError::InvalidPayload { kind, .. }) => assert_eq!(kind, EnvelopeKind::Chat),
		other => panic!("expected InvalidPayload, got {other:?}"),
	}

	match decode_envelope_default(r#"{"type":"join"}"#) {
		Err(CodecError::InvalidPayload { kind, .. }) => assert_eq!(kind, EnvelopeKind::Join),
		other => panic!("expected InvalidPayload, got {other:?}"),
	}
}

#[test]
fn garbage_is_malformed() {
	assert!(matches!(decode_envelope_default("not json"), Err(CodecError::Malformed(_))));
	assert!(matches!(
		decode_envelope_default(r#"{"payload":{"message":"hi"}}"#),
		Err(CodecError::Malformed(_))
	));
	assert!(matches!(decode_envelope_default("[1,2,3]"), Err(CodecError::Malformed(_))));
}

#[test]
fn welcome_carries_structured_assignment() {
	let bob = Participant::guest(ParticipantId::new("p2").unwrap(), "Bob_x7Qa");
	let v = to_json(&Envelope::welcome("Room A", bob, 5));

	assert_eq!(v["type"], "system");
	assert_eq!(v["timestamp"], 5);
	assert_eq!(v["payload"]["sender"], "System");
	assert_eq!(v["payload"]["message"], "Welcome to Room A! You are: Bob_x7Qa");
	assert_eq!(v["payload"]["assigned"], json!({"id": "p2", "nick": "Bob_x7Qa", "isHost": false}));

	let plain = to_json(&Envelope::system("Bob joined the room", 6));
	assert!(plain["payload"].get("assigned").is_none());
}

#[test]
fn roster_uses_users_list() {
	let users = vec![
		Participant::host(ParticipantId::new("h").unwrap(), "Alice"),
		Participant::guest(ParticipantId::new("g").unwrap(), "Bob"),
	];
	let v = to_json(&Envelope::roster(users, 9));
	assert_eq!(v["type"], "roster");
	assert_eq!(
		v["payload"]["users"],
		json!([
			{"id": "h", "nick": "Alice", "isHost": true},
			{"id": "g", "nick": "Bob", "isHost": false}
		])
	);
}

#[test]
fn auth_envelopes_use_hyphenated_types() {
	let mut states = devchat_domain::ExtensionStates::new();
	states.insert("poll".to_string(), json!({"closed": []}));

	let ok = to_json(&Envelope::auth_success(
		AuthUser {
			id: "u-1".to_string(),
			nick: Some("Bob".to_string()),
		},
		Some(states),
		1,
	));
	assert_eq!(ok["type"], "auth-success");
	assert_eq!(ok["payload"]["user"]["id"], "u-1");
	assert_eq!(ok["payload"]["extensionStates"]["poll"], json!({"closed": []}));

	let err = to_json(&Envelope::auth_error("token expired", 2));
	assert_eq!(err["type"], "auth-error");
	assert_eq!(err["payload"], json!({"message": "token expired"}));
}

#[test]
fn server_envelopes_decode_back() {
	let env = Envelope::extension("poll", "Poll closed: lunch? yes=2 no=1", 77);
	let text = encode_envelope_default(&env).expect("encode");
	let back = decode_envelope(&text, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	assert_eq!(back, env);
}

#[test]
fn extension_payload_keeps_unknown_fields() {
	let src = r#"{"type":"extension","payload":{"message":"hp 10","sender":"rpg","data":{"hp":10}},"timestamp":5}"#;
	let env = decode_envelope_default(src).expect("decode extension");
	match &env.payload {
		Payload::Extension(p) => {
			assert_eq!(p.message, "hp 10");
			assert_eq!(p.sender, "rpg");
			assert_eq!(p.extra.get("data"), Some(&json!({"hp": 10})));
		}
		other => panic!("expected extension, got {other:?}"),
	}

	let expected: Value = serde_json::from_str(src).expect("valid json");
	assert_eq!(to_json(&env), expected);
}

proptest! {
	#[test]
	fn decode_never_panics_on_arbitrary_text(s in ".{0,256}") {
		let _ = decode_envelope_default(&s);
	}

	#[test]
	fn chat_text_survives_the_wire(msg in "\\PC{0,200}", sender in "[A-Za-z0-9_]{1,16}") {
		let env = Envelope::chat(sender.clone(), msg.clone(), 1);
		let text = encode_envelope_default(&env).expect("encode");
		let back = decode_envelope_default(&text).expect("decode");
		match back.payload {
			Payload::Chat(p) => {
				prop_assert_eq!(p.message, msg);
				prop_assert_eq!(p.sender, sender);
			}
			other => prop_assert!(false, "expected chat, got {:?}", other),
		}
	}
}
