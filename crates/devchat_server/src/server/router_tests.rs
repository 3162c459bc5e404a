#![forbid(unsafe_code)]

use std::collections::HashSet;

use devchat_domain::{ExtensionStates, HistoryKind, SYSTEM_SENDER};
use devchat_protocol::{Envelope, EnvelopeKind, Payload, decode_envelope_default};
use tokio::sync::{mpsc, oneshot};

use crate::builtin::default_extensions;
use crate::server::history::HistoryBuffer;
use crate::server::identity::{IdentityError, VerifiedIdentity};
use crate::server::registry::ConnId;
use crate::server::room::RoomState;
use crate::server::router::{RoomServer, RouterEvent, RouterHandle};

struct Conn {
	id: ConnId,
	rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Conn {
	fn drain(&mut self) -> Vec<Envelope> {
		let mut out = Vec::new();
		while let Ok(env) = self.rx.try_recv() {
			out.push(env);
		}
		out
	}
}

fn server() -> RoomServer {
	RoomServer::new(
		RoomState::create("Room A", "Alice", 0),
		HistoryBuffer::new(100),
		default_extensions().expect("builtin extensions register"),
	)
}

fn attach(server: &mut RoomServer, id: ConnId) -> Conn {
	let (tx, rx) = mpsc::unbounded_channel();
	server.attach(id, None, tx);
	Conn { id, rx }
}

fn join(server: &mut RoomServer, conn: &Conn, nick: &str) {
	server.inbound(conn.id, Ok(Envelope::join(nick, None, 0)), None);
}

fn chat(server: &mut RoomServer, conn: &Conn, text: &str) {
	server.inbound(conn.id, Ok(Envelope::chat("", text, 0)), None);
}

fn joined(server: &mut RoomServer, id: ConnId, nick: &str) -> Conn {
	let mut conn = attach(server, id);
	join(server, &conn, nick);
	conn.drain();
	conn
}

fn messages(envs: &[Envelope]) -> Vec<(EnvelopeKind, String)> {
	envs.iter()
		.map(|env| {
			let text = match &env.payload {
				Payload::Chat(p) => format!("{}: {}", p.sender, p.message),
				Payload::Extension(p) => format!("{}: {}", p.sender, p.message),
				Payload::System(p) => p.message.clone(),
				Payload::Error(p) | Payload::AuthError(p) => p.message.clone(),
				Payload::Roster(p) => p
					.users
					.iter()
					.map(|u| u.display_name.as_str())
					.collect::<Vec<_>>()
					.join(","),
				Payload::AuthSuccess(p) => p.user.id.clone(),
				Payload::Join(p) => p.nick.clone(),
			};
			(env.kind(), text)
		})
		.collect()
}

#[test]
fn join_acknowledges_then_announces() {
	let mut s = server();
	let mut bob = attach(&mut s, 1);
	join(&mut s, &bob, "Bob");

	let got = bob.drain();
	assert_eq!(
		messages(&got),
		vec![
			(EnvelopeKind::System, "Welcome to Room A! You are: Bob".to_string()),
			(EnvelopeKind::Roster, "Alice,Bob".to_string()),
		],
		"joiner does not receive its own join notice"
	);
	let Payload::System(welcome) = &got[0].payload else {
		panic!("expected welcome");
	};
	let assigned = welcome.assigned.as_ref().expect("welcome carries the admitted participant");
	assert_eq!(assigned.display_name, "Bob");
	assert!(!assigned.is_host);
	assert_eq!(welcome.sender, SYSTEM_SENDER);

	let mut carol = attach(&mut s, 2);
	join(&mut s, &carol, "Carol");
	carol.drain();
	assert_eq!(
		messages(&bob.drain()),
		vec![
			(EnvelopeKind::System, "Carol joined the room".to_string()),
			(EnvelopeKind::Roster, "Alice,Bob,Carol".to_string()),
		]
	);
}

#[test]
fn chat_reaches_each_active_connection_exactly_once() {
	let mut s = server();
	let mut bob = joined(&mut s, 1, "Bob");
	let mut carol = joined(&mut s, 2, "Carol");
	bob.drain();
	let mut lurker = attach(&mut s, 3);

	chat(&mut s, &bob, "hi");

	let expected = vec![(EnvelopeKind::Chat, "Bob: hi".to_string())];
	assert_eq!(messages(&bob.drain()), expected);
	assert_eq!(messages(&carol.drain()), expected);
	assert!(lurker.drain().is_empty(), "joining connections receive no broadcasts");

	let last = s.history().snapshot(Some(1)).pop().unwrap();
	assert_eq!(last.kind, HistoryKind::Chat);
	assert_eq!(last.author, "Bob");
	assert_eq!(last.text, "hi");
}

#[test]
fn client_supplied_sender_is_replaced() {
	let mut s = server();
	let mut bob = joined(&mut s, 1, "Bob");
	s.inbound(bob.id, Ok(Envelope::chat("Alice", "spoof", 0)), None);
	assert_eq!(messages(&bob.drain()), vec![(EnvelopeKind::Chat, "Bob: spoof".to_string())]);
}

#[test]
fn colliding_joins_get_distinct_names() {
	let mut s = server();
	let mut first = attach(&mut s, 1);
	let mut second = attach(&mut s, 2);
	join(&mut s, &first, "Bob");
	join(&mut s, &second, "Bob");

	let assigned = |envs: Vec<Envelope>| {
		envs.into_iter()
			.find_map(|e| match e.payload {
				Payload::System(p) => p.assigned,
				_ => None,
			})
			.expect("welcome")
			.display_name
	};
	let a = assigned(first.drain());
	let b = assigned(second.drain());
	assert_eq!(a, "Bob");
	assert!(b.starts_with("Bob_"), "got {b}");

	let names: HashSet<_> = s.room().roster().iter().map(|p| p.display_name.clone()).collect();
	assert_eq!(names.len(), s.room().roster().len());
}

#[test]
fn protocol_errors_answer_the_sender_only_and_change_nothing() {
	let mut s = server();
	let mut bob = joined(&mut s, 1, "Bob");
	let mut dan = attach(&mut s, 2);
	let history_before = s.history().len();
	let roster_before = s.room().roster().to_vec();

	chat(&mut s, &dan, "too early");
	s.inbound(dan.id, decode_envelope_default("{not json"), None);
	s.inbound(dan.id, decode_envelope_default(r#"{"type":"shout","payload":{}}"#), None);
	s.inbound(dan.id, Ok(Envelope::roster(Vec::new(), 0)), None);
	join(&mut s, &dan, &"x".repeat(40));
	join(&mut s, &dan, "   ");

	let errors = dan.drain();
	assert_eq!(errors.len(), 6);
	assert!(errors.iter().all(|e| e.kind() == EnvelopeKind::Error));
	assert_eq!(messages(&errors[0..1])[0].1, "join before sending chat");
	assert_eq!(messages(&errors[3..4])[0].1, "unexpected roster envelope from client");

	join(&mut s, &bob, "Bob again");
	assert_eq!(messages(&bob.drain()), vec![(EnvelopeKind::Error, "already joined".to_string())]);

	assert_eq!(s.history().len(), history_before);
	assert_eq!(s.room().roster(), roster_before.as_slice());
	assert!(!s.registry().get(dan.id).unwrap().is_active());
}

#[test]
fn detach_of_a_joining_connection_leaves_no_trace() {
	let mut s = server();
	let mut bob = joined(&mut s, 1, "Bob");
	let dan = attach(&mut s, 2);
	let history_before = s.history().len();

	s.detach(dan.id);
	assert!(bob.drain().is_empty());
	assert_eq!(s.history().len(), history_before);
	assert!(s.registry().get(dan.id).is_none());
}

#[test]
fn detach_is_announced_once() {
	let mut s = server();
	let bob = joined(&mut s, 1, "Bob");
	let mut carol = joined(&mut s, 2, "Carol");
	carol.drain();

	s.handle(RouterEvent::Detach { conn_id: bob.id });
	s.handle(RouterEvent::Detach { conn_id: bob.id });

	assert_eq!(
		messages(&carol.drain()),
		vec![
			(EnvelopeKind::System, "Bob left the room".to_string()),
			(EnvelopeKind::Roster, "Alice,Carol".to_string()),
		]
	);
	assert!(!s.room().is_name_taken("Bob"));
}

#[test]
fn rejected_token_keeps_the_connection_joining() {
	let mut s = server();
	let mut bob = attach(&mut s, 1);

	s.inbound(bob.id, Ok(Envelope::join("Bob", Some("bad".into()), 0)), Some(Err(IdentityError::Signature)));
	assert_eq!(
		messages(&bob.drain()),
		vec![(EnvelopeKind::AuthError, "invalid token signature".to_string())]
	);
	assert!(!s.registry().get(bob.id).unwrap().is_active());
	assert!(!s.room().is_name_taken("Bob"));

	join(&mut s, &bob, "Bob");
	assert!(s.registry().get(bob.id).unwrap().is_active());
}

#[test]
fn verified_identity_restores_extension_state() {
	let mut s = server();
	let mut bob = attach(&mut s, 1);

	let mut states = ExtensionStates::new();
	states.insert(
		"poll".to_string(),
		serde_json::json!({"closed": [{"question": "lunch?", "tallies": [{"option": "yes", "votes": 2}, {"option": "no", "votes": 0}]}]}),
	);
	states.insert("gone".to_string(), serde_json::json!({"x": 1}));
	let identity = VerifiedIdentity {
		user_id: "user-7".to_string(),
		nick: Some("Zed".to_string()),
		extension_states: Some(states.clone()),
	};

	s.inbound(bob.id, Ok(Envelope::join("", Some("tok".into()), 0)), Some(Ok(identity)));

	let got = messages(&bob.drain());
	assert_eq!(got[0], (EnvelopeKind::AuthSuccess, "user-7".to_string()));
	assert_eq!(got[1], (EnvelopeKind::System, "Welcome to Room A! You are: Zed".to_string()));

	let captured = s.capture().extension_states;
	assert_eq!(captured.get("poll"), states.get("poll"));
	assert!(!captured.contains_key("gone"));
}

#[test]
fn token_join_mid_poll_leaves_the_open_poll_running() {
	let mut s = server();
	let mut bob = joined(&mut s, 1, "Bob");
	let mut carol = attach(&mut s, 2);

	chat(&mut s, &bob, "/poll lunch?");
	chat(&mut s, &bob, "/vote yes");
	bob.drain();

	let mut states = ExtensionStates::new();
	states.insert("poll".to_string(), serde_json::json!({"closed": []}));
	let identity = VerifiedIdentity {
		user_id: "user-9".to_string(),
		nick: Some("Carol".to_string()),
		extension_states: Some(states),
	};
	s.inbound(carol.id, Ok(Envelope::join("", Some("tok".into()), 0)), Some(Ok(identity)));
	carol.drain();
	bob.drain();

	chat(&mut s, &bob, "/endpoll");
	assert_eq!(
		messages(&bob.drain()),
		vec![
			(EnvelopeKind::Chat, "Bob: /endpoll".to_string()),
			(EnvelopeKind::Extension, "poll: Poll closed: lunch? yes=1 no=0".to_string()),
		]
	);
}

#[test]
fn extension_envelope_is_relayed_with_unknown_fields() {
	let mut s = server();
	let bob = joined(&mut s, 1, "Bob");
	let mut carol = joined(&mut s, 2, "Carol");

	let raw = r#"{"type":"extension","payload":{"message":"hp 10","sender":"rpg","data":{"hp":10}},"timestamp":5}"#;
	s.inbound(bob.id, decode_envelope_default(raw), None);

	let got = carol.drain();
	assert_eq!(got.len(), 1);
	assert_eq!(got[0].timestamp, 5);
	match &got[0].payload {
		Payload::Extension(ext) => {
			assert_eq!(ext.sender, "rpg");
			assert_eq!(ext.message, "hp 10");
			assert_eq!(ext.extra.get("data"), Some(&serde_json::json!({"hp": 10})));
		}
		other => panic!("expected extension, got {other:?}"),
	}
}

#[test]
fn extension_command_output_is_broadcast_after_the_chat() {
	let mut s = server();
	let mut bob = joined(&mut s, 1, "Bob");
	let mut carol = joined(&mut s, 2, "Carol");
	bob.drain();

	chat(&mut s, &bob, "/poll lunch?");

	for got in [messages(&bob.drain()), messages(&carol.drain())] {
		assert_eq!(got.len(), 2);
		assert_eq!(got[0], (EnvelopeKind::Chat, "Bob: /poll lunch?".to_string()));
		assert_eq!(got[1].0, EnvelopeKind::Extension);
		assert!(got[1].1.starts_with("poll: Bob asks: lunch?"), "got {}", got[1].1);
	}

	let last = s.history().snapshot(Some(1)).pop().unwrap();
	assert_eq!(last.kind, HistoryKind::Extension);
	assert_eq!(last.author, "poll");
}

#[test]
fn failing_extension_command_only_answers_the_invoker() {
	let mut s = server();
	let mut bob = joined(&mut s, 1, "Bob");
	let mut carol = joined(&mut s, 2, "Carol");
	bob.drain();

	chat(&mut s, &bob, "/poll");

	let got = messages(&bob.drain());
	assert_eq!(got.len(), 2);
	assert_eq!(got[1].0, EnvelopeKind::Error);
	assert!(got[1].1.starts_with("poll: usage"), "got {}", got[1].1);
	assert_eq!(messages(&carol.drain()), vec![(EnvelopeKind::Chat, "Bob: /poll".to_string())]);

	chat(&mut s, &bob, "still routing");
	assert_eq!(carol.drain().len(), 1);
}

#[test]
fn host_lines_are_broadcast_and_mirrored() {
	let (host_tx, mut host_rx) = mpsc::unbounded_channel();
	let mut s = server().with_host_observer(host_tx);
	let mut bob = joined(&mut s, 1, "Bob");
	while host_rx.try_recv().is_ok() {}

	s.handle(RouterEvent::HostInput {
		line: "  welcome all  ".to_string(),
	});
	s.handle(RouterEvent::HostInput { line: "   ".to_string() });

	let expected = vec![(EnvelopeKind::Chat, "Alice: welcome all".to_string())];
	assert_eq!(messages(&bob.drain()), expected);
	assert_eq!(messages(&[host_rx.try_recv().unwrap()]), expected);
	assert!(host_rx.try_recv().is_err());
}

#[test]
fn join_and_chat_are_recorded_in_order() {
	let mut s = server();
	let bob = joined(&mut s, 1, "Bob");
	chat(&mut s, &bob, "hi");

	let entries = s.history().snapshot(None);
	let got: Vec<_> = entries.iter().map(|e| (e.kind, e.author.as_str(), e.text.as_str())).collect();
	assert_eq!(
		got,
		vec![
			(HistoryKind::System, SYSTEM_SENDER, "Bob joined the room"),
			(HistoryKind::Chat, "Bob", "hi"),
		]
	);
}

#[test]
fn shutdown_event_captures_and_stops() {
	let mut s = server();
	let bob = joined(&mut s, 1, "Bob");
	chat(&mut s, &bob, "hi");

	let (reply, mut rx) = oneshot::channel();
	assert!(!s.handle(RouterEvent::Shutdown { reply }));
	let capture = rx.try_recv().unwrap();
	assert_eq!(capture.room_name, "Room A");
	assert_eq!(capture.host_name, "Alice");
	assert_eq!(capture.history.len(), 2);
}

#[tokio::test]
async fn router_task_serves_capture_requests() {
	let (router, task) = RouterHandle::spawn(server());
	let (tx, mut rx) = mpsc::unbounded_channel();
	assert!(router.send(RouterEvent::Attach {
		conn_id: 1,
		remote: None,
		outbound: tx,
	}));
	assert!(router.send(RouterEvent::Inbound {
		conn_id: 1,
		frame: Ok(Envelope::join("Bob", None, 0)),
		auth: None,
	}));

	let capture = router.capture().await.unwrap();
	assert_eq!(capture.history.len(), 1);
	assert_eq!(rx.recv().await.unwrap().kind(), EnvelopeKind::System);

	router.shutdown().await.unwrap();
	let server = task.await.unwrap();
	assert_eq!(server.registry().active_count(), 1);
	assert!(router.capture().await.is_err(), "stopped router refuses requests");
}
