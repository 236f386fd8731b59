//! CLI command implementations for the compile server.
//!
//! `serve` runs a server in the foreground; `send` is a minimal client.

pub mod send;
pub mod serve;
