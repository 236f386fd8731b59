//! Unix domain socket implementation for Unix platforms

use std::{
   fs, io,
   path::{Path, PathBuf},
   pin::Pin,
   task::{self, Poll},
};

use tokio::{
   io::{Interest, ReadBuf},
   net::{UnixListener as TokioUnixListener, UnixStream as TokioUnixStream},
};

use super::{SocketError, current_uid, prepare_dir};
use crate::{Result, connection::Channel};

/// Unix domain socket listener
pub struct Listener {
   inner: TokioUnixListener,
   path:  PathBuf,
}

impl Listener {
   /// Binds a socket at `path`, readable and writable by the owner only.
   pub async fn bind(path: &Path) -> Result<Self> {
      prepare_dir(path)?;

      if path.exists() {
         // A live listener owns this path; only a stale file may be removed.
         if Stream::connect(path).await.is_ok() {
            return Err(SocketError::AlreadyRunning.into());
         }
         fs::remove_file(path).map_err(SocketError::RemoveStale)?;
      }

      let inner = TokioUnixListener::bind(path).map_err(SocketError::Bind)?;
      {
         use std::os::unix::fs::PermissionsExt;
         fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(SocketError::Bind)?;
      }
      Ok(Self { inner, path: path.to_path_buf() })
   }

   /// Accepts an incoming connection
   pub async fn accept(&mut self) -> Result<Stream> {
      let (stream, _) = self.inner.accept().await.map_err(SocketError::Accept)?;
      Ok(Stream { inner: stream })
   }

   /// Returns the socket path as a string
   pub fn local_addr(&self) -> String {
      self.path.display().to_string()
   }
}

impl Drop for Listener {
   fn drop(&mut self) {
      let _ = fs::remove_file(&self.path);
   }
}

/// Unix domain socket stream implementing async I/O
#[repr(transparent)]
pub struct Stream {
   inner: TokioUnixStream,
}

impl Stream {
   /// Connects to the socket at `path`
   pub async fn connect(path: &Path) -> Result<Self> {
      let inner = TokioUnixStream::connect(path)
         .await
         .map_err(SocketError::Connect)?;
      Ok(Self { inner })
   }

   /// Whether the peer process runs as the same effective user as us.
   pub fn is_same_user(&self) -> bool {
      match self.inner.peer_cred() {
         Ok(cred) => cred.uid() == current_uid(),
         Err(e) => {
            tracing::warn!("failed to read peer credentials: {e}");
            false
         },
      }
   }
}

impl tokio::io::AsyncRead for Stream {
   fn poll_read(
      mut self: Pin<&mut Self>,
      cx: &mut task::Context<'_>,
      buf: &mut ReadBuf<'_>,
   ) -> Poll<io::Result<()>> {
      Pin::new(&mut self.inner).poll_read(cx, buf)
   }
}

impl tokio::io::AsyncWrite for Stream {
   fn poll_write(
      mut self: Pin<&mut Self>,
      cx: &mut task::Context<'_>,
      buf: &[u8],
   ) -> Poll<io::Result<usize>> {
      Pin::new(&mut self.inner).poll_write(cx, buf)
   }

   fn poll_flush(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
      Pin::new(&mut self.inner).poll_flush(cx)
   }

   fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
      Pin::new(&mut self.inner).poll_shutdown(cx)
   }
}

impl Channel for Stream {
   fn hung_up(&mut self) -> impl Future<Output = ()> + Send + '_ {
      wait_for_hangup(&self.inner)
   }
}

impl Channel for TokioUnixStream {
   fn hung_up(&mut self) -> impl Future<Output = ()> + Send + '_ {
      wait_for_hangup(self)
   }
}

/// Waits for the kernel to report a hang-up on `socket`.
///
/// A peer that called `shutdown(SHUT_WR)` only makes the socket read-closed;
/// the hang-up, surfaced by tokio as write-closed readiness, arrives once the
/// peer has released the socket entirely.
async fn wait_for_hangup(socket: &TokioUnixStream) {
   loop {
      match socket.ready(Interest::WRITABLE).await {
         Ok(ready) if ready.is_write_closed() => return,
         Ok(_) => {
            // Writable readiness sticks until an operation would block. Clear
            // it so the next wakeup reflects a new event on the socket.
            let _ = socket.try_io(Interest::WRITABLE, || {
               Err::<(), _>(io::Error::from(io::ErrorKind::WouldBlock))
            });
         },
         Err(e) => {
            tracing::debug!("socket readiness failed: {e}");
            return;
         },
      }
   }
}
