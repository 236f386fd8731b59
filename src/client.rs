//! Client side of the channel: locate a server, send one request, wait for
//! the answer.

use std::{
   path::{Path, PathBuf},
   time::Duration,
};

use tokio::{io::AsyncWriteExt, time};

use crate::{
   Result, config,
   error::Error,
   protocol::{self, BuildRequest, BuildResponse},
   usock,
};

/// Endpoint of the server process `pid` using the configured socket
/// directory.
pub fn endpoint_for_pid(pipe_name_base: &str, pid: u32) -> PathBuf {
   usock::endpoint_path(config::socket_dir(), &usock::endpoint_name(pipe_name_base, pid))
}

/// Connects to the endpoint at `path`, giving up after `timeout`.
pub async fn connect(path: &Path, timeout: Duration) -> Result<usock::Stream> {
   match time::timeout(timeout, usock::Stream::connect(path)).await {
      Ok(result) => result,
      Err(_) => Err(Error::Server {
         op:     "connect",
         reason: format!("timeout after {}ms", timeout.as_millis()),
      }),
   }
}

/// Sends `request` and waits up to `timeout` for the response.
///
/// The stream is shut down afterwards; the server serves one request per
/// connection.
pub async fn send(
   stream: &mut usock::Stream,
   request: &BuildRequest,
   timeout: Duration,
) -> Result<BuildResponse> {
   match time::timeout(timeout, protocol::write_request(stream, request)).await {
      Ok(Ok(())) => {},
      Ok(Err(e)) => return Err(e.into()),
      Err(_) => {
         return Err(Error::Server { op: "send", reason: "timeout sending request".to_string() });
      },
   }

   let response = match time::timeout(timeout, protocol::read_response(stream)).await {
      Ok(Ok(r)) => r,
      Ok(Err(e)) => return Err(e.into()),
      Err(_) => {
         return Err(Error::Server {
            op:     "send",
            reason: "timeout receiving response".to_string(),
         });
      },
   };

   let _ = stream.shutdown().await;
   Ok(response)
}

/// Connects to `path`, sends `request` and returns the response.
pub async fn request(
   path: &Path,
   request: &BuildRequest,
   connect_timeout: Duration,
   response_timeout: Duration,
) -> Result<BuildResponse> {
   let mut stream = connect(path, connect_timeout).await?;
   send(&mut stream, request, response_timeout).await
}
