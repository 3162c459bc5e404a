#![forbid(unsafe_code)]

use devchat_domain::{HistoryEntry, HistoryKind};
use proptest::prelude::*;

use crate::server::history::{DEFAULT_HISTORY_CAPACITY, HistoryBuffer};

fn chat(n: usize) -> HistoryEntry {
	HistoryEntry::new(HistoryKind::Chat, "Bob", format!("m{n}"), n as i64)
}

fn texts(entries: &[HistoryEntry]) -> Vec<String> {
	entries.iter().map(|e| e.text.clone()).collect()
}

#[test]
fn default_capacity_is_one_thousand() {
	let buf = HistoryBuffer::default();
	assert_eq!(buf.capacity(), DEFAULT_HISTORY_CAPACITY);
	assert_eq!(buf.capacity(), 1000);
	assert!(buf.is_empty());
}

#[test]
fn snapshot_limit_returns_most_recent_in_order() {
	let mut buf = HistoryBuffer::new(10);
	for n in 0..5 {
		buf.append(chat(n));
	}

	assert_eq!(texts(&buf.snapshot(Some(2))), vec!["m3", "m4"]);
	assert_eq!(texts(&buf.snapshot(Some(50))), vec!["m0", "m1", "m2", "m3", "m4"]);
	assert!(buf.snapshot(Some(0)).is_empty());
	assert_eq!(buf.snapshot(None).len(), 5);
}

#[test]
fn snapshot_is_a_defensive_copy() {
	let mut buf = HistoryBuffer::new(4);
	buf.append(chat(1));

	let mut copy = buf.snapshot(None);
	copy[0].text = "tampered".to_string();
	copy.clear();

	assert_eq!(texts(&buf.snapshot(None)), vec!["m1"]);
}

#[test]
fn replace_keeps_newest_capacity_entries() {
	let mut buf = HistoryBuffer::new(3);
	buf.append(chat(100));

	buf.replace((0..5).map(chat).collect());
	assert_eq!(texts(&buf.snapshot(None)), vec!["m2", "m3", "m4"]);

	buf.replace(vec![chat(9)]);
	assert_eq!(texts(&buf.snapshot(None)), vec!["m9"]);
}

#[test]
fn record_returns_the_appended_entry() {
	let mut buf = HistoryBuffer::new(2);
	let e = buf.record(HistoryKind::System, "System", "Bob joined the room", 5);
	assert_eq!(buf.snapshot(None), vec![e.clone()]);
	assert_eq!(e.kind, HistoryKind::System);
	assert_eq!(e.at, 5);
}

#[test]
fn zero_capacity_retains_nothing() {
	let mut buf = HistoryBuffer::new(0);
	buf.append(chat(1));
	assert!(buf.is_empty());
}

proptest! {
	#[test]
	fn eviction_keeps_exactly_the_newest(capacity in 1usize..64, extra in 1usize..64) {
		let mut buf = HistoryBuffer::new(capacity);
		let total = capacity + extra;
		for n in 0..total {
			buf.append(chat(n));
			prop_assert!(buf.len() <= capacity);
		}

		prop_assert_eq!(buf.len(), capacity);
		let expected: Vec<String> = (extra..total).map(|n| format!("m{n}")).collect();
		prop_assert_eq!(texts(&buf.snapshot(None)), expected);
	}
}
