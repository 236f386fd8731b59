//! Core of a local compile server.
//!
//! A long-lived process accepts build requests from short-lived clients over
//! a per-user local socket, runs them through a [`handler::RequestHandler`]
//! and replies with the result. Clients may raise the server's idle lifetime
//! through a keep-alive argument; the server exits once it has been idle for
//! that long.

pub mod client;
pub mod cmd;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod keep_alive;
pub mod protocol;
pub mod usock;

pub use error::{Error, Result};
