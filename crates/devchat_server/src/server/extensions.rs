#![forbid(unsafe_code)]

use devchat_domain::{ExtensionStates, Participant};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Registration failures. A rejected extension is never partially installed.
#[derive(Debug, Error)]
pub enum ExtensionError {
	#[error("extension name must be non-empty")]
	EmptyName,

	#[error("extension {0} is already registered")]
	Duplicate(String),

	#[error("extension {0} declares no commands")]
	NoCommands(String),

	#[error("extension {name}: command {command:?} must start with '/' and contain no spaces")]
	InvalidCommand {
		name: String,
		command: String,
	},

	#[error("command {command} is already claimed by extension {owner}")]
	CommandConflict {
		command: String,
		owner: String,
	},

	#[error("extension {name} failed to load: {source}")]
	Load {
		name: String,
		#[source]
		source: anyhow::Error,
	},
}

/// Settled state an extension wants persisted. `Ok(None)` means nothing worth saving.
pub trait StateExport {
	fn export_state(&self) -> anyhow::Result<Option<Value>>;
}

/// Accepts a previously exported blob.
pub trait StateImport {
	fn import_state(&mut self, state: Value) -> anyhow::Result<()>;
}

/// Load/unload hooks.
pub trait Lifecycle {
	fn on_load(&mut self) -> anyhow::Result<()>;

	fn on_unload(&mut self) -> anyhow::Result<()> {
		Ok(())
	}
}

/// Inputs and outputs of one command invocation.
pub struct CommandContext<'a> {
	pub invoker: &'a Participant,
	pub roster: &'a [Participant],
	pub room_name: &'a str,
	output: Vec<String>,
}

impl<'a> CommandContext<'a> {
	pub fn new(invoker: &'a Participant, roster: &'a [Participant], room_name: &'a str) -> Self {
		Self {
			invoker,
			roster,
			room_name,
			output: Vec::new(),
		}
	}

	/// Queue a message for the whole room.
	pub fn broadcast(&mut self, message: impl Into<String>) {
		self.output.push(message.into());
	}

	pub fn into_output(self) -> Vec<String> {
		self.output
	}
}

/// A command provider with optional state and lifecycle capabilities.
pub trait Extension: Send {
	fn name(&self) -> &str;

	/// Slash commands handled by this extension, e.g. `/poll`.
	fn commands(&self) -> &[&str];

	fn run_command(&mut self, command: &str, args: &[&str], ctx: &mut CommandContext<'_>) -> anyhow::Result<()>;

	fn as_state_export(&self) -> Option<&dyn StateExport> {
		None
	}

	fn as_state_import(&mut self) -> Option<&mut dyn StateImport> {
		None
	}

	fn as_lifecycle(&mut self) -> Option<&mut dyn Lifecycle> {
		None
	}
}

/// Capability tags recorded at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
	pub state_export: bool,
	pub state_import: bool,
	pub lifecycle: bool,
}

/// Result of offering a line to the registered extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
	/// No extension claims the line's command.
	Unclaimed,
	Ran {
		extension: String,
		output: Vec<String>,
	},
	Failed {
		extension: String,
		error: String,
	},
}

struct Registered {
	ext: Box<dyn Extension>,
	caps: Capabilities,
	commands: Vec<String>,
}

/// Registered extensions plus the per-extension state capture/restore bridge.
///
/// Every call into an extension is isolated: a failure is logged against that extension and never
/// reaches the caller or the other extensions.
#[derive(Default)]
pub struct ExtensionHost {
	registered: Vec<Registered>,
}

impl std::fmt::Debug for ExtensionHost {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_list().entries(self.names()).finish()
	}
}

impl ExtensionHost {
	/// Validate and install an extension, running its load hook if it has one.
	pub fn register(&mut self, mut ext: Box<dyn Extension>) -> Result<Capabilities, ExtensionError> {
		let name = ext.name().trim().to_string();
		if name.is_empty() {
			return Err(ExtensionError::EmptyName);
		}
		if self.registered.iter().any(|r| r.ext.name() == name) {
			return Err(ExtensionError::Duplicate(name));
		}

		let commands: Vec<String> = ext.commands().iter().map(|c| c.to_string()).collect();
		if commands.is_empty() {
			return Err(ExtensionError::NoCommands(name));
		}
		for command in &commands {
			if !command.starts_with('/') || command.len() < 2 || command.contains(char::is_whitespace) {
				return Err(ExtensionError::InvalidCommand {
					name,
					command: command.clone(),
				});
			}
			if let Some(owner) = self.owner_of(command) {
				return Err(ExtensionError::CommandConflict {
					command: command.clone(),
					owner: owner.to_string(),
				});
			}
		}

		let caps = Capabilities {
			state_export: ext.as_state_export().is_some(),
			state_import: ext.as_state_import().is_some(),
			lifecycle: ext.as_lifecycle().is_some(),
		};

		if let Some(lifecycle) = ext.as_lifecycle() {
			lifecycle
				.on_load()
				.map_err(|source| ExtensionError::Load { name: name.clone(), source })?;
		}

		info!(extension = %name, ?commands, ?caps, "extension registered");
		self.registered.push(Registered { ext, caps, commands });
		Ok(caps)
	}

	pub fn names(&self) -> Vec<&str> {
		self.registered.iter().map(|r| r.ext.name()).collect()
	}

	pub fn capabilities(&self, name: &str) -> Option<Capabilities> {
		self.registered.iter().find(|r| r.ext.name() == name).map(|r| r.caps)
	}

	pub fn owner_of(&self, command: &str) -> Option<&str> {
		self.registered
			.iter()
			.find(|r| r.commands.iter().any(|c| c == command))
			.map(|r| r.ext.name())
	}

	/// Run the extension owning the first word of `line`, if any.
	pub fn dispatch(&mut self, line: &str, invoker: &Participant, roster: &[Participant], room_name: &str) -> Dispatch {
		let mut words = line.split_whitespace();
		let Some(command) = words.next() else {
			return Dispatch::Unclaimed;
		};
		let args: Vec<&str> = words.collect();

		let Some(reg) = self.registered.iter_mut().find(|r| r.commands.iter().any(|c| c == command)) else {
			return Dispatch::Unclaimed;
		};

		let extension = reg.ext.name().to_string();
		let mut ctx = CommandContext::new(invoker, roster, room_name);
		match reg.ext.run_command(command, &args, &mut ctx) {
			Ok(()) => {
				debug!(%extension, command, invoker = %invoker.display_name, "extension command ran");
				Dispatch::Ran {
					extension,
					output: ctx.output,
				}
			}
			Err(e) => {
				warn!(%extension, command, error = %e, "extension command failed");
				Dispatch::Failed {
					extension,
					error: e.to_string(),
				}
			}
		}
	}

	/// Settled state of every exporting extension; empty exports are left out.
	pub fn capture_all(&self) -> ExtensionStates {
		let mut out = ExtensionStates::new();
		for reg in &self.registered {
			let Some(exporter) = reg.ext.as_state_export() else {
				continue;
			};
			match exporter.export_state() {
				Ok(Some(state)) if !state.is_null() => {
					out.insert(reg.ext.name().to_string(), state);
				}
				Ok(_) => {}
				Err(e) => warn!(extension = %reg.ext.name(), error = %e, "extension state capture failed"),
			}
		}
		out
	}

	/// Hand each blob to the matching importer. Unknown names and non-importing extensions are skipped.
	pub fn restore_all(&mut self, states: &ExtensionStates) {
		for (name, state) in states {
			let Some(reg) = self.registered.iter_mut().find(|r| r.ext.name() == name) else {
				debug!(extension = %name, "no such extension; state ignored");
				continue;
			};
			let Some(importer) = reg.ext.as_state_import() else {
				debug!(extension = %name, "extension does not import state; ignored");
				continue;
			};
			match importer.import_state(state.clone()) {
				Ok(()) => info!(extension = %name, "extension state restored"),
				Err(e) => warn!(extension = %name, error = %e, "extension state restore failed"),
			}
		}
	}

	/// Run unload hooks, in reverse registration order.
	pub fn unload_all(&mut self) {
		for reg in self.registered.iter_mut().rev() {
			let name = reg.ext.name().to_string();
			if let Some(lifecycle) = reg.ext.as_lifecycle()
				&& let Err(e) = lifecycle.on_unload()
			{
				warn!(extension = %name, error = %e, "extension unload failed");
			}
		}
	}
}
