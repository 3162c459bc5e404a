#![forbid(unsafe_code)]

//! Hold-to-reveal for the disguise view.
//!
//! Only discrete key presses are observable, so "held" is inferred: every press of the reveal
//! key keeps the chat visible for one expiry window, and the view falls back to the disguise
//! once a window passes without a press.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

/// Default expiry window.
pub const DEFAULT_REVEAL_EXPIRY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
	/// Disguise output visible.
	Hidden,
	/// Chat visible.
	Revealed,
}

/// Pure state machine; the caller supplies the clock.
#[derive(Debug, Clone)]
pub struct ViewToggleTimer {
	expiry: Duration,
	mode: ViewMode,
	deadline: Option<Instant>,
}

impl ViewToggleTimer {
	pub fn new(expiry: Duration) -> Self {
		Self {
			expiry,
			mode: ViewMode::Hidden,
			deadline: None,
		}
	}

	pub fn mode(&self) -> ViewMode {
		self.mode
	}

	pub fn expiry(&self) -> Duration {
		self.expiry
	}

	/// When the view drops back to `Hidden` unless pressed again.
	pub fn deadline(&self) -> Option<Instant> {
		self.deadline
	}

	/// Observe a reveal-key press. Returns true when this press switched the view.
	///
	/// A press while already revealed only rearms the window.
	pub fn press(&mut self, now: Instant) -> bool {
		self.deadline = Some(now + self.expiry);
		if self.mode == ViewMode::Revealed {
			return false;
		}
		self.mode = ViewMode::Revealed;
		true
	}

	/// Apply the clock. Returns true when the window lapsed and the view switched to `Hidden`.
	pub fn expire(&mut self, now: Instant) -> bool {
		match self.deadline {
			Some(deadline) if self.mode == ViewMode::Revealed && now >= deadline => {
				self.mode = ViewMode::Hidden;
				self.deadline = None;
				true
			}
			_ => false,
		}
	}
}

/// Feeds presses into a running toggle task.
#[derive(Debug, Clone)]
pub struct ViewToggleHandle {
	presses: mpsc::UnboundedSender<()>,
}

impl ViewToggleHandle {
	/// Returns false once the toggle task has stopped.
	pub fn press(&self) -> bool {
		self.presses.send(()).is_ok()
	}
}

/// Spawn a task that owns a [`ViewToggleTimer`] and publishes mode changes.
///
/// The task ends when every handle is dropped.
pub fn spawn_view_toggle(expiry: Duration) -> (ViewToggleHandle, watch::Receiver<ViewMode>) {
	let (press_tx, mut press_rx) = mpsc::unbounded_channel::<()>();
	let (mode_tx, mode_rx) = watch::channel(ViewMode::Hidden);

	tokio::spawn(async move {
		let mut timer = ViewToggleTimer::new(expiry);
		loop {
			let deadline = timer.deadline();
			tokio::select! {
				press = press_rx.recv() => {
					if press.is_none() {
						break;
					}
					if timer.press(Instant::now()) {
						debug!("view revealed");
						let _ = mode_tx.send(ViewMode::Revealed);
					}
				}
				_ = async {
					match deadline {
						Some(at) => tokio::time::sleep_until(at).await,
						None => std::future::pending::<()>().await,
					}
				} => {
					if timer.expire(Instant::now()) {
						debug!("view hidden");
						let _ = mode_tx.send(ViewMode::Hidden);
					}
				}
			}
		}
	});

	(ViewToggleHandle { presses: press_tx }, mode_rx)
}
