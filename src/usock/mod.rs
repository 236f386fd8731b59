//! Channel endpoints between clients and the server.
//!
//! Unix platforms use a Unix domain socket in a directory only the current
//! user can enter. Windows uses a local named pipe, one instance per client.

use std::{
   io,
   path::{Path, PathBuf},
};

#[cfg(unix)]
use sha2::{Digest, Sha256};

/// Errors that can occur during socket operations
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
   #[error("server already running")]
   AlreadyRunning,

   #[error("failed to connect: {0}")]
   Connect(#[source] io::Error),

   #[error("failed to bind: {0}")]
   Bind(#[source] io::Error),

   #[error("accept failed: {0}")]
   Accept(#[source] io::Error),

   #[error("failed to create socket directory: {0}")]
   CreateDir(#[source] io::Error),

   #[error("failed to remove stale socket: {0}")]
   RemoveStale(#[source] io::Error),
}

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::*;

#[cfg(unix)]
const MAX_SOCKET_PATH_LEN: usize = 100;
#[cfg(unix)]
const SOCKET_HASH_LEN: usize = 12;

/// Name of the endpoint a server process listens on: `<base><pid>`.
pub fn endpoint_name(base: &str, pid: u32) -> String {
   format!("{base}{pid}")
}

/// Filesystem location of the endpoint `name` inside `dir`.
///
/// `sockaddr_un` paths are short; when `dir/name` is too long the name is
/// replaced by a hash, first under a per-user temp directory and otherwise
/// under `dir`. Clients and servers compute the same path from the same
/// inputs.
#[cfg(unix)]
pub fn endpoint_path(dir: &Path, name: &str) -> PathBuf {
   let candidate = dir.join(name);
   if candidate.as_os_str().len() <= MAX_SOCKET_PATH_LEN {
      return candidate;
   }

   let short_name = format!("cs-{}", short_hash(&candidate.to_string_lossy()));
   let tmp_candidate = temp_socket_dir().join(&short_name);
   if tmp_candidate.as_os_str().len() <= MAX_SOCKET_PATH_LEN {
      return tmp_candidate;
   }

   dir.join(short_name)
}

/// Pipe path of the endpoint `name`. Named pipes live in their own
/// namespace, so `dir` plays no part.
#[cfg(windows)]
pub fn endpoint_path(_dir: &Path, name: &str) -> PathBuf {
   PathBuf::from(format!(r"\\.\pipe\{name}"))
}

#[cfg(unix)]
fn temp_socket_dir() -> PathBuf {
   PathBuf::from(format!("/tmp/compile-server-{}", current_uid()))
}

#[cfg(unix)]
fn current_uid() -> u32 {
   // SAFETY: geteuid has no preconditions and cannot fail.
   unsafe { libc::geteuid() }
}

#[cfg(unix)]
fn short_hash(input: &str) -> String {
   let mut hasher = Sha256::new();
   hasher.update(input.as_bytes());
   let digest = hex::encode(hasher.finalize());
   digest[..SOCKET_HASH_LEN.min(digest.len())].to_string()
}

/// Creates the directory holding an endpoint, private to the current user.
#[cfg(unix)]
fn prepare_dir(path: &Path) -> crate::Result<()> {
   use std::{fs, os::unix::fs::PermissionsExt};

   let Some(parent) = path.parent() else {
      return Ok(());
   };
   fs::create_dir_all(parent).map_err(SocketError::CreateDir)?;
   fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
      .map_err(SocketError::CreateDir)?;
   Ok(())
}
