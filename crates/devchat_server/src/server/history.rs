#![forbid(unsafe_code)]

use std::collections::VecDeque;

use devchat_domain::{HistoryEntry, HistoryKind};

/// Default number of retained entries.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Bounded, insertion-ordered message log with FIFO eviction.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
	entries: VecDeque<HistoryEntry>,
	capacity: usize,
}

impl Default for HistoryBuffer {
	fn default() -> Self {
		Self::new(DEFAULT_HISTORY_CAPACITY)
	}
}

impl HistoryBuffer {
	pub fn new(capacity: usize) -> Self {
		Self {
			entries: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
			capacity,
		}
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn append(&mut self, entry: HistoryEntry) {
		self.entries.push_back(entry);
		self.evict();
	}

	/// Build an entry stamped `at`, append it, and return a copy.
	pub fn record(&mut self, kind: HistoryKind, author: &str, text: &str, at: i64) -> HistoryEntry {
		let entry = HistoryEntry::new(kind, author, text, at);
		self.append(entry.clone());
		entry
	}

	/// Most recent `limit` entries (all when `None`), oldest first.
	pub fn snapshot(&self, limit: Option<usize>) -> Vec<HistoryEntry> {
		let take = limit.unwrap_or(self.entries.len()).min(self.entries.len());
		self.entries.iter().skip(self.entries.len() - take).cloned().collect()
	}

	/// Overwrite contents, keeping only the newest `capacity` entries.
	pub fn replace(&mut self, entries: Vec<HistoryEntry>) {
		self.entries = entries.into();
		self.evict();
	}

	fn evict(&mut self) {
		while self.entries.len() > self.capacity {
			self.entries.pop_front();
		}
	}
}
