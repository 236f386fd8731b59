//! Named pipe implementation for Windows

use std::{
   io,
   path::{Path, PathBuf},
   pin::Pin,
   task::{self, Poll},
   time::Duration,
};

use tokio::{
   io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf},
   net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions},
};

use super::SocketError;
use crate::{Result, connection::Channel};

const ERROR_PIPE_BUSY: i32 = 231;
const PIPE_BUSY_RETRY: Duration = Duration::from_millis(50);

/// Named pipe listener. Each accepted client consumes the waiting server
/// instance and a fresh one is created in its place, so clients never find
/// the pipe missing while the server runs.
pub struct Listener {
   path: PathBuf,
   next: NamedPipeServer,
}

impl Listener {
   /// Creates the first instance of the pipe at `path`.
   ///
   /// The pipe keeps the default security descriptor, which grants write
   /// access only to the creating user, administrators and LocalSystem.
   /// Clients open pipes read-write, so other users are refused by the OS
   /// before they reach [`Listener::accept`]. Remote clients are refused too.
   pub async fn bind(path: &Path) -> Result<Self> {
      let next = server_options(true).create(path).map_err(|e| {
         if e.kind() == io::ErrorKind::PermissionDenied {
            SocketError::AlreadyRunning
         } else {
            SocketError::Bind(e)
         }
      })?;
      Ok(Self { path: path.to_path_buf(), next })
   }

   /// Waits for a client on the current instance and hands it out
   pub async fn accept(&mut self) -> Result<Stream> {
      self.next.connect().await.map_err(SocketError::Accept)?;
      let fresh = server_options(false)
         .create(&self.path)
         .map_err(SocketError::Accept)?;
      let connected = std::mem::replace(&mut self.next, fresh);
      Ok(Stream { inner: Pipe::Server(connected) })
   }

   /// Returns the pipe path as a string
   pub fn local_addr(&self) -> String {
      self.path.display().to_string()
   }
}

fn server_options(first: bool) -> ServerOptions {
   let mut options = ServerOptions::new();
   options.first_pipe_instance(first).reject_remote_clients(true);
   options
}

enum Pipe {
   Server(NamedPipeServer),
   Client(NamedPipeClient),
}

/// Either end of a connected named pipe
pub struct Stream {
   inner: Pipe,
}

impl Stream {
   /// Opens the pipe at `path`, waiting while every instance is busy
   pub async fn connect(path: &Path) -> Result<Self> {
      loop {
         match ClientOptions::new().open(path) {
            Ok(client) => return Ok(Self { inner: Pipe::Client(client) }),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
               tokio::time::sleep(PIPE_BUSY_RETRY).await;
            },
            Err(e) => return Err(SocketError::Connect(e).into()),
         }
      }
   }

   /// Access to the pipe is decided by its security descriptor when the
   /// client opens it (see [`Listener::bind`]); every client that got this
   /// far already passed that check.
   pub const fn is_same_user(&self) -> bool {
      true
   }
}

impl Channel for Stream {
   /// Named pipes have no half-close: a client's shutdown is a no-op, so
   /// end of stream means the client closed its handle.
   fn hung_up(&mut self) -> impl Future<Output = ()> + Send + '_ {
      async move {
         let mut scratch = [0u8; 64];
         loop {
            match self.read(&mut scratch).await {
               Ok(0) | Err(_) => return,
               Ok(_) => {},
            }
         }
      }
   }
}

impl AsyncRead for Stream {
   fn poll_read(
      mut self: Pin<&mut Self>,
      cx: &mut task::Context<'_>,
      buf: &mut ReadBuf<'_>,
   ) -> Poll<io::Result<()>> {
      match &mut self.inner {
         Pipe::Server(pipe) => Pin::new(pipe).poll_read(cx, buf),
         Pipe::Client(pipe) => Pin::new(pipe).poll_read(cx, buf),
      }
   }
}

impl AsyncWrite for Stream {
   fn poll_write(
      mut self: Pin<&mut Self>,
      cx: &mut task::Context<'_>,
      buf: &[u8],
   ) -> Poll<io::Result<usize>> {
      match &mut self.inner {
         Pipe::Server(pipe) => Pin::new(pipe).poll_write(cx, buf),
         Pipe::Client(pipe) => Pin::new(pipe).poll_write(cx, buf),
      }
   }

   fn poll_flush(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
      match &mut self.inner {
         Pipe::Server(pipe) => Pin::new(pipe).poll_flush(cx),
         Pipe::Client(pipe) => Pin::new(pipe).poll_flush(cx),
      }
   }

   fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
      match &mut self.inner {
         Pipe::Server(pipe) => Pin::new(pipe).poll_shutdown(cx),
         Pipe::Client(pipe) => Pin::new(pipe).poll_shutdown(cx),
      }
   }
}
