//! A single accepted channel, served end to end.
//!
//! The request is read in full, then the handler runs on the blocking pool
//! while the channel is watched for the client hanging up. Whichever happens
//! first decides the outcome; the channel is always shut down afterwards.

use std::{any::Any, sync::Arc};

use tokio::{
   io::{AsyncRead, AsyncWrite, AsyncWriteExt},
   task::{self, JoinError},
};
use tokio_util::sync::CancellationToken;

use crate::{
   Result,
   error::Error,
   handler::RequestHandler,
   keep_alive::{KeepAlive, KeepAlivePolicy},
   protocol::{self, BuildRequest, BuildResponse, PROTOCOL_VERSION, ProtocolError},
};

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionReason {
   /// No valid request was read; the handler never ran.
   CompilationNotStarted,
   /// A response was written in full.
   Completed,
   /// The client went away before a response could be delivered.
   ClientDisconnect,
}

/// A bidirectional channel a [`Connection`] can be served on.
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin + 'static {
   /// Resolves once the peer has gone away entirely.
   ///
   /// A peer that only shut down its sending half is still waiting for the
   /// response and must not resolve this.
   fn hung_up(&mut self) -> impl Future<Output = ()> + Send + '_;
}

pub struct Connection {
   id:         String,
   handler:    Arc<dyn RequestHandler>,
   keep_alive: Arc<KeepAlivePolicy>,
}

impl Connection {
   pub fn new(
      id: impl Into<String>,
      handler: Arc<dyn RequestHandler>,
      keep_alive: Arc<KeepAlivePolicy>,
   ) -> Self {
      Self { id: id.into(), handler, keep_alive }
   }

   pub fn id(&self) -> &str {
      &self.id
   }

   /// Serves one request on `stream` and closes it.
   ///
   /// Transport and protocol failures are folded into the returned
   /// [`CompletionReason`]. An `Err` means the handler panicked, which the
   /// caller must treat as fatal.
   pub async fn serve<S: Channel>(self, mut stream: S) -> Result<CompletionReason> {
      let outcome = self.serve_on(&mut stream).await;

      if let Err(e) = stream.shutdown().await {
         tracing::debug!(connection = %self.id, "shutdown after serve failed: {e}");
      }
      drop(stream);

      if let Ok(reason) = &outcome {
         tracing::debug!(connection = %self.id, ?reason, "connection closed");
      }
      outcome
   }

   async fn serve_on<S: Channel>(&self, stream: &mut S) -> Result<CompletionReason> {
      let request = match protocol::read_request(stream).await {
         Ok(request) => request,
         Err(e) => {
            tracing::debug!(connection = %self.id, "no valid request: {e}");
            return Ok(CompletionReason::CompilationNotStarted);
         },
      };

      if request.protocol_version != PROTOCOL_VERSION {
         tracing::warn!(
            connection = %self.id,
            client = request.protocol_version,
            server = PROTOCOL_VERSION,
            "protocol version mismatch"
         );
         return Ok(self
            .write_response(stream, &BuildResponse::MismatchedVersion)
            .await);
      }

      tracing::debug!(
         connection = %self.id,
         language = %request.language,
         arguments = request.arguments.len(),
         "request received"
      );
      self.apply_keep_alive(&request);

      let cancel = CancellationToken::new();
      let handler = Arc::clone(&self.handler);
      let token = cancel.clone();
      let mut compile = task::spawn_blocking(move || handler.handle(request, &token));

      let response = tokio::select! {
         biased;
         joined = &mut compile => match joined {
            Ok(response) => response,
            Err(e) => return Err(self.fault(e)),
         },
         () = stream.hung_up() => {
            // The handler keeps its thread until it notices; its result is dropped.
            cancel.cancel();
            tracing::info!(connection = %self.id, "client disconnected before the build finished");
            return Ok(CompletionReason::ClientDisconnect);
         },
      };

      Ok(self.write_response(stream, &response).await)
   }

   fn apply_keep_alive(&self, request: &BuildRequest) {
      let Some(raw) = request.keep_alive() else {
         return;
      };
      match KeepAlive::parse(raw) {
         Some(value) => {
            let current = self.keep_alive.set_keep_alive(value);
            tracing::debug!(connection = %self.id, requested = %value, %current, "keep-alive applied");
         },
         None => tracing::debug!(connection = %self.id, "ignoring keep-alive value {raw:?}"),
      }
   }

   async fn write_response<W>(&self, writer: &mut W, response: &BuildResponse) -> CompletionReason
   where
      W: AsyncWrite + Unpin,
   {
      match protocol::write_response(writer, response).await {
         Ok(()) => CompletionReason::Completed,
         Err(ProtocolError::Write(e)) => {
            tracing::debug!(connection = %self.id, "client gone while writing response: {e}");
            CompletionReason::ClientDisconnect
         },
         Err(e) => {
            tracing::error!(connection = %self.id, "failed to encode response: {e}");
            CompletionReason::ClientDisconnect
         },
      }
   }

   fn fault(&self, e: JoinError) -> Error {
      let message = if e.is_panic() {
         panic_message(e.into_panic())
      } else {
         e.to_string()
      };
      tracing::error!(connection = %self.id, "request handler faulted: {message}");
      Error::HandlerFault { connection: self.id.clone(), message }
   }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
   if let Some(s) = payload.downcast_ref::<&str>() {
      (*s).to_string()
   } else if let Some(s) = payload.downcast_ref::<String>() {
      s.clone()
   } else {
      "non-string panic payload".to_string()
   }
}
