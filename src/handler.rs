//! Request handlers: the compiler behind the server.
//!
//! The server core only needs [`RequestHandler`]. [`ExecHandler`] is the
//! default used by the binary; it runs a configured compiler executable per
//! request and captures its output.

use std::{
   io::{self, Read},
   path::{Path, PathBuf},
   process::{Child, Command, ExitStatus, Stdio},
   thread,
   time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{
   config::Config,
   protocol::{BuildRequest, BuildResponse, CommandLine, MAX_MESSAGE_BYTES, RequestLanguage},
};

/// Turns a decoded request into a response.
///
/// Called on a blocking thread and may take arbitrarily long. `cancel` fires
/// when the client disconnects; honoring it is optional, the result is
/// discarded either way. A panic is treated as fatal by the server.
pub trait RequestHandler: Send + Sync + 'static {
   fn handle(&self, request: BuildRequest, cancel: &CancellationToken) -> BuildResponse;
}

impl<F> RequestHandler for F
where
   F: Fn(BuildRequest, &CancellationToken) -> BuildResponse + Send + Sync + 'static,
{
   fn handle(&self, request: BuildRequest, cancel: &CancellationToken) -> BuildResponse {
      self(request, cancel)
   }
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Per-stream cap (in UTF-16 code units) so that a `Completed` response with
/// both streams at the cap still fits in one frame.
const MAX_STREAM_UNITS: usize = (MAX_MESSAGE_BYTES - 64) / 4;

/// Runs an external compiler executable for each request.
#[derive(Debug, Clone, Default)]
pub struct ExecHandler {
   csharp:       Option<PathBuf>,
   visual_basic: Option<PathBuf>,
}

impl ExecHandler {
   pub const fn new(csharp: Option<PathBuf>, visual_basic: Option<PathBuf>) -> Self {
      Self { csharp, visual_basic }
   }

   pub fn from_config(cfg: &Config) -> Self {
      Self::new(cfg.csharp_compiler.clone(), cfg.visual_basic_compiler.clone())
   }

   fn compiler_for(&self, language: RequestLanguage) -> Option<&Path> {
      match language {
         RequestLanguage::CSharpCompile => self.csharp.as_deref(),
         RequestLanguage::VisualBasicCompile => self.visual_basic.as_deref(),
      }
   }
}

impl RequestHandler for ExecHandler {
   fn handle(&self, request: BuildRequest, cancel: &CancellationToken) -> BuildResponse {
      let cmd = request.command_line();
      for raw in &cmd.unknown {
         tracing::warn!("ignoring unknown argument id {raw:#x}");
      }

      let Some(compiler) = self.compiler_for(request.language) else {
         return BuildResponse::completed(
            1,
            "",
            format!("no compiler configured for {}", request.language),
         );
      };

      tracing::debug!(compiler = %compiler.display(), args = cmd.args.len(), "running compiler");
      match run_compiler(compiler, &cmd, cancel) {
         Ok(response) => response,
         Err(e) => {
            BuildResponse::completed(1, "", format!("failed to run {}: {e}", compiler.display()))
         },
      }
   }
}

fn run_compiler(
   compiler: &Path,
   cmd: &CommandLine,
   cancel: &CancellationToken,
) -> io::Result<BuildResponse> {
   let mut command = Command::new(compiler);
   command
      .args(&cmd.args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());
   if let Some(dir) = cmd.current_directory.as_deref().filter(|d| !d.is_empty()) {
      command.current_dir(dir);
   }
   if let Some(lib) = &cmd.lib_env {
      command.env("LIB", lib);
   }

   let mut child = command.spawn()?;
   let stdout = child.stdout.take();
   let stderr = child.stderr.take();

   thread::scope(|scope| {
      let out = scope.spawn(move || drain(stdout));
      let err = scope.spawn(move || drain(stderr));

      let status = wait_or_kill(&mut child, cancel);

      let output = out.join().unwrap_or_default();
      let error_output = err.join().unwrap_or_default();
      let status = status?;

      Ok(BuildResponse::Completed {
         return_code: status.code().unwrap_or(-1),
         output,
         error_output,
      })
   })
}

fn wait_or_kill(child: &mut Child, cancel: &CancellationToken) -> io::Result<ExitStatus> {
   loop {
      match child.try_wait() {
         Ok(Some(status)) => return Ok(status),
         Ok(None) => {},
         Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
         },
      }
      if cancel.is_cancelled() {
         tracing::debug!("client gone, killing compiler");
         let _ = child.kill();
         return child.wait();
      }
      thread::sleep(POLL_INTERVAL);
   }
}

fn drain(pipe: Option<impl Read>) -> String {
   let mut bytes = Vec::new();
   if let Some(mut pipe) = pipe {
      let _ = pipe.read_to_end(&mut bytes);
   }
   let mut text = String::from_utf8_lossy(&bytes).into_owned();
   truncate_utf16(&mut text, MAX_STREAM_UNITS);
   text
}

/// Truncates `text` to at most `max_units` UTF-16 code units on a char
/// boundary.
fn truncate_utf16(text: &mut String, max_units: usize) {
   let mut units = 0;
   for (idx, ch) in text.char_indices() {
      units += ch.len_utf16();
      if units > max_units {
         text.truncate(idx);
         return;
      }
   }
}
