#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::server::extensions::{CommandContext, Extension, Lifecycle, StateExport, StateImport};

const COMMANDS: &[&str] = &["/poll", "/vote", "/endpoll", "/polls"];

/// Closed polls kept for `/polls` and persistence.
const MAX_CLOSED: usize = 20;

/// Room polls: one open poll at a time, closed results are kept.
///
/// An open poll is in-progress state and is never exported; a restored room starts with no poll open.
#[derive(Debug, Default)]
pub struct PollExtension {
	open: Option<OpenPoll>,
	closed: Vec<ClosedPoll>,
}

#[derive(Debug)]
struct OpenPoll {
	question: String,
	options: Vec<String>,
	/// Voter display name -> option index.
	votes: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedPoll {
	pub question: String,
	pub tallies: Vec<Tally>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
	pub option: String,
	pub votes: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PollState {
	closed: Vec<ClosedPoll>,
}

impl PollExtension {
	pub fn closed(&self) -> &[ClosedPoll] {
		&self.closed
	}

	pub fn is_open(&self) -> bool {
		self.open.is_some()
	}

	fn start(&mut self, args: &[&str], ctx: &mut CommandContext<'_>) -> anyhow::Result<()> {
		if let Some(open) = &self.open {
			ctx.broadcast(format!("A poll is already open: {}", open.question));
			return Ok(());
		}

		let line = args.join(" ");
		let mut parts = line.split('|').map(str::trim).filter(|s| !s.is_empty());
		let question = parts.next().ok_or_else(|| anyhow!("usage: /poll <question> [| option | option ...]"))?;
		let mut options: Vec<String> = parts.map(str::to_string).collect();
		if options.is_empty() {
			options = vec!["yes".to_string(), "no".to_string()];
		}
		if options.len() < 2 {
			return Err(anyhow!("a poll needs at least two options"));
		}

		let listing = options
			.iter()
			.enumerate()
			.map(|(i, o)| format!("{}) {o}", i + 1))
			.collect::<Vec<_>>()
			.join("  ");
		ctx.broadcast(format!("{} asks: {question}  {listing}  (vote with /vote <option>)", ctx.invoker.display_name));

		self.open = Some(OpenPoll {
			question: question.to_string(),
			options,
			votes: BTreeMap::new(),
		});
		Ok(())
	}

	fn vote(&mut self, args: &[&str], ctx: &mut CommandContext<'_>) -> anyhow::Result<()> {
		let Some(open) = self.open.as_mut() else {
			ctx.broadcast("There is no open poll.");
			return Ok(());
		};

		let choice = args.join(" ");
		let choice = choice.trim();
		let idx = match choice.parse::<usize>() {
			Ok(n) if (1..=open.options.len()).contains(&n) => n - 1,
			_ => open
				.options
				.iter()
				.position(|o| o.eq_ignore_ascii_case(choice))
				.ok_or_else(|| anyhow!("unknown option {choice:?}"))?,
		};

		let voter = ctx.invoker.display_name.clone();
		let changed = open.votes.insert(voter.clone(), idx).is_some();
		let verb = if changed { "changed their vote" } else { "voted" };
		ctx.broadcast(format!("{voter} {verb} ({} so far)", open.votes.len()));
		Ok(())
	}

	fn end(&mut self, ctx: &mut CommandContext<'_>) {
		let Some(open) = self.open.take() else {
			ctx.broadcast("There is no open poll.");
			return;
		};

		let mut counts = vec![0usize; open.options.len()];
		for idx in open.votes.values() {
			counts[*idx] += 1;
		}
		let tallies: Vec<Tally> = open
			.options
			.into_iter()
			.zip(counts)
			.map(|(option, votes)| Tally { option, votes })
			.collect();

		let closed = ClosedPoll {
			question: open.question,
			tallies,
		};
		ctx.broadcast(format!("Poll closed: {}", summarize(&closed)));

		self.closed.push(closed);
		self.trim_closed();
	}

	/// Keep the newest `MAX_CLOSED` results.
	fn trim_closed(&mut self) {
		if self.closed.len() > MAX_CLOSED {
			let excess = self.closed.len() - MAX_CLOSED;
			self.closed.drain(..excess);
		}
	}

	fn list(&self, ctx: &mut CommandContext<'_>) {
		if self.closed.is_empty() {
			ctx.broadcast("No polls have been closed yet.");
			return;
		}
		for poll in self.closed.iter().rev().take(5) {
			ctx.broadcast(summarize(poll));
		}
	}
}

fn summarize(poll: &ClosedPoll) -> String {
	let tallies = poll
		.tallies
		.iter()
		.map(|t| format!("{}={}", t.option, t.votes))
		.collect::<Vec<_>>()
		.join(" ");
	format!("{} {tallies}", poll.question)
}

impl Extension for PollExtension {
	fn name(&self) -> &str {
		"poll"
	}

	fn commands(&self) -> &[&str] {
		COMMANDS
	}

	fn run_command(&mut self, command: &str, args: &[&str], ctx: &mut CommandContext<'_>) -> anyhow::Result<()> {
		match command {
			"/poll" => self.start(args, ctx),
			"/vote" => self.vote(args, ctx),
			"/endpoll" => {
				self.end(ctx);
				Ok(())
			}
			"/polls" => {
				self.list(ctx);
				Ok(())
			}
			other => Err(anyhow!("unsupported command {other}")),
		}
	}

	fn as_state_export(&self) -> Option<&dyn StateExport> {
		Some(self)
	}

	fn as_state_import(&mut self) -> Option<&mut dyn StateImport> {
		Some(self)
	}

	fn as_lifecycle(&mut self) -> Option<&mut dyn Lifecycle> {
		Some(self)
	}
}

impl StateExport for PollExtension {
	fn export_state(&self) -> anyhow::Result<Option<Value>> {
		if self.closed.is_empty() {
			return Ok(None);
		}
		let state = PollState {
			closed: self.closed.clone(),
		};
		serde_json::to_value(state).map(Some).context("serialize poll state")
	}
}

impl StateImport for PollExtension {
	fn import_state(&mut self, state: Value) -> anyhow::Result<()> {
		let state: PollState = serde_json::from_value(state).context("parse poll state")?;

		// Imported results count as older than the room's own; a poll in progress is left alone.
		let mut merged: Vec<ClosedPoll> = state
			.closed
			.into_iter()
			.filter(|poll| !self.closed.contains(poll))
			.collect();
		let imported = merged.len();
		merged.append(&mut self.closed);
		self.closed = merged;
		self.trim_closed();

		debug!(imported, closed = self.closed.len(), "poll state imported");
		Ok(())
	}
}

impl Lifecycle for PollExtension {
	fn on_load(&mut self) -> anyhow::Result<()> {
		self.open = None;
		Ok(())
	}

	fn on_unload(&mut self) -> anyhow::Result<()> {
		if let Some(open) = self.open.take() {
			info!(question = %open.question, votes = open.votes.len(), "discarding open poll");
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use devchat_domain::{Participant, ParticipantId};

	use super::*;

	fn run(ext: &mut PollExtension, who: &Participant, command: &str, args: &[&str]) -> anyhow::Result<Vec<String>> {
		let roster = vec![who.clone()];
		let mut ctx = CommandContext::new(who, &roster, "Room A");
		ext.run_command(command, args, &mut ctx)?;
		Ok(ctx.into_output())
	}

	fn who(name: &str) -> Participant {
		Participant::guest(ParticipantId::generate(), name)
	}

	#[test]
	fn open_poll_is_not_exported_closed_poll_is() {
		let mut ext = PollExtension::default();
		let alice = who("Alice");
		let bob = who("Bob");

		run(&mut ext, &alice, "/poll", &["lunch?"]).unwrap();
		run(&mut ext, &bob, "/vote", &["yes"]).unwrap();
		assert!(ext.is_open());
		assert_eq!(ext.export_state().unwrap(), None, "in-progress poll is transient");

		let out = run(&mut ext, &alice, "/endpoll", &[]).unwrap();
		assert_eq!(out, vec!["Poll closed: lunch? yes=1 no=0".to_string()]);

		let exported = ext.export_state().unwrap().expect("closed poll is settled state");
		let mut restored = PollExtension::default();
		restored.import_state(exported).unwrap();
		assert_eq!(restored.closed(), ext.closed());
		assert!(!restored.is_open());
	}

	#[test]
	fn votes_by_number_and_revotes_replace() {
		let mut ext = PollExtension::default();
		let alice = who("Alice");
		run(&mut ext, &alice, "/poll", &["tabs", "or", "spaces?", "|", "tabs", "|", "spaces"]).unwrap();
		run(&mut ext, &alice, "/vote", &["2"]).unwrap();
		let out = run(&mut ext, &alice, "/vote", &["TABS"]).unwrap();
		assert_eq!(out, vec!["Alice changed their vote (1 so far)".to_string()]);

		run(&mut ext, &alice, "/endpoll", &[]).unwrap();
		let tallies = &ext.closed()[0].tallies;
		assert_eq!(tallies[0], Tally { option: "tabs".into(), votes: 1 });
		assert_eq!(tallies[1], Tally { option: "spaces".into(), votes: 0 });
	}

	#[test]
	fn bad_input_is_an_error() {
		let mut ext = PollExtension::default();
		let alice = who("Alice");
		assert!(run(&mut ext, &alice, "/poll", &[]).is_err());
		assert!(run(&mut ext, &alice, "/poll", &["q", "|", "only"]).is_err());
		run(&mut ext, &alice, "/poll", &["q"]).unwrap();
		assert!(run(&mut ext, &alice, "/vote", &["maybe"]).is_err());
	}

	fn closed_poll(question: &str, yes: usize) -> ClosedPoll {
		ClosedPoll {
			question: question.to_string(),
			tallies: vec![
				Tally { option: "yes".into(), votes: yes },
				Tally { option: "no".into(), votes: 0 },
			],
		}
	}

	#[test]
	fn import_keeps_open_poll_and_merges_closed_results() {
		let mut ext = PollExtension::default();
		let alice = who("Alice");
		run(&mut ext, &alice, "/poll", &["standup?"]).unwrap();
		run(&mut ext, &alice, "/endpoll", &[]).unwrap();
		run(&mut ext, &alice, "/poll", &["lunch?"]).unwrap();
		run(&mut ext, &alice, "/vote", &["yes"]).unwrap();

		let bundle = serde_json::to_value(PollState {
			closed: vec![closed_poll("retro?", 3), ext.closed()[0].clone()],
		})
		.unwrap();
		ext.import_state(bundle).unwrap();

		assert!(ext.is_open());
		let questions: Vec<&str> = ext.closed().iter().map(|p| p.question.as_str()).collect();
		assert_eq!(questions, vec!["retro?", "standup?"]);

		ext.import_state(serde_json::json!({"closed": []})).unwrap();
		assert_eq!(ext.closed().len(), 2);

		let out = run(&mut ext, &alice, "/endpoll", &[]).unwrap();
		assert_eq!(out, vec!["Poll closed: lunch? yes=1 no=0".to_string()]);
	}

	#[test]
	fn import_is_capped_to_newest_results() {
		let mut ext = PollExtension::default();
		let closed: Vec<ClosedPoll> = (0..MAX_CLOSED + 5).map(|n| closed_poll(&format!("q{n}"), n)).collect();
		ext.import_state(serde_json::to_value(PollState { closed }).unwrap()).unwrap();

		assert_eq!(ext.closed().len(), MAX_CLOSED);
		assert_eq!(ext.closed()[0].question, "q5");
		assert_eq!(ext.closed()[MAX_CLOSED - 1].question, format!("q{}", MAX_CLOSED + 4));
	}

	#[test]
	fn import_rejects_foreign_shapes() {
		let mut ext = PollExtension::default();
		assert!(ext.import_state(serde_json::json!({"closed": "nope"})).is_err());
		assert!(ext.closed().is_empty());
	}
}
