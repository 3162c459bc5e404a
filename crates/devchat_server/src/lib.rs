#![forbid(unsafe_code)]

pub mod builtin;
pub mod config;
pub mod server;
