#![forbid(unsafe_code)]

pub mod connection;
pub mod extensions;
pub mod history;
pub mod identity;
pub mod listener;
pub mod registry;
pub mod room;
pub mod router;
pub mod shutdown;
pub mod snapshot;
pub mod startup;


#[cfg(test)]
mod history_tests;


#[cfg(test)]
mod router_tests;
