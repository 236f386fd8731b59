use std::io;

use thiserror::Error;

use crate::{protocol::ProtocolError, usock::SocketError};

/// Main error type for the compile server.
///
/// Transport, protocol and socket failures convert into this enum with `?`.
/// Only [`Error::HandlerFault`] and endpoint creation failures are fatal for
/// the server process; everything else is scoped to a single connection.
#[derive(Debug, Error)]
pub enum Error {
   /// I/O error occurred during file or socket operations.
   #[error("io error: {0}")]
   Io(#[from] io::Error),

   /// A frame could not be encoded or decoded.
   #[error("protocol error: {0}")]
   Protocol(#[from] ProtocolError),

   /// Socket communication error occurred.
   #[error("socket error: {0}")]
   Socket(#[from] SocketError),

   /// Configuration could not be loaded.
   #[error("config error: {0}")]
   Config(#[from] Box<figment::Error>),

   /// The request handler panicked while serving a connection.
   #[error("request handler faulted on {connection}: {message}")]
   HandlerFault { connection: String, message: String },

   /// Server error occurred during a specific operation.
   #[error("server error during {op}: {reason}")]
   Server { op: &'static str, reason: String },

   /// Unexpected response received from the server during an operation.
   #[error("unexpected response from server during {0}")]
   UnexpectedResponse(&'static str),
}

impl Error {
   pub fn exit_code(&self) -> i32 {
      match self {
         Self::HandlerFault { .. } => 70,
         Self::Socket(SocketError::Connect(_)) => 10,
         Self::Server { reason, .. } if reason.contains("timeout") => 11,
         Self::UnexpectedResponse(_) => 13,
         _ => 1,
      }
   }
}

impl From<figment::Error> for Error {
   fn from(e: figment::Error) -> Self {
      Self::Config(Box::new(e))
   }
}

/// Standard result type using [`enum@Error`] as the default error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
