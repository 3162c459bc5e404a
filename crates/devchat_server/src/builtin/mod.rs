#![forbid(unsafe_code)]

pub mod poll;

use crate::server::extensions::{ExtensionError, ExtensionHost};

/// Host with the bundled extensions registered.
pub fn default_extensions() -> Result<ExtensionHost, ExtensionError> {
	let mut host = ExtensionHost::default();
	host.register(Box::new(poll::PollExtension::default()))?;
	Ok(host)
}
