//! Send a single build request to a running server.

use std::{io::Write, path::PathBuf};

use console::style;

use crate::{
   Result, client, config,
   error::Error,
   protocol::{BuildRequest, BuildResponse, RequestLanguage},
};

/// Options for the send command.
#[derive(Debug, Clone)]
pub struct SendOptions {
   pub pid:        u32,
   pub language:   RequestLanguage,
   pub cwd:        Option<PathBuf>,
   pub keep_alive: Option<i64>,
   pub lib_env:    Option<String>,
   pub pipe_name:  Option<String>,
   pub args:       Vec<String>,
}

/// Parses the `--language` flag.
pub fn parse_language(s: &str) -> std::result::Result<RequestLanguage, String> {
   match s.to_ascii_lowercase().as_str() {
      "csharp" | "cs" | "c#" => Ok(RequestLanguage::CSharpCompile),
      "vb" | "visual-basic" | "visualbasic" => Ok(RequestLanguage::VisualBasicCompile),
      other => Err(format!("unknown language '{other}' (expected csharp or vb)")),
   }
}

/// Executes the send command, returning the compiler's exit code.
pub async fn execute(opts: SendOptions) -> Result<i32> {
   let cfg = config::get();
   let base = opts.pipe_name.as_deref().unwrap_or(&cfg.pipe_name_base);
   let endpoint = client::endpoint_for_pid(base, opts.pid);

   let cwd = match opts.cwd {
      Some(dir) => dir,
      None => std::env::current_dir()?,
   };

   let mut request = BuildRequest::new(opts.language, cwd.to_string_lossy(), opts.args);
   if let Some(secs) = opts.keep_alive {
      request = request.with_keep_alive(secs);
   }
   if let Some(lib) = opts.lib_env {
      request = request.with_lib_env(lib);
   }

   tracing::debug!(endpoint = %endpoint.display(), "sending request");
   let response = client::request(
      &endpoint,
      &request,
      cfg.connect_timeout(),
      cfg.response_timeout(),
   )
   .await?;

   match response {
      BuildResponse::Completed { return_code, output, error_output } => {
         if !output.is_empty() {
            print!("{output}");
         }
         if !error_output.is_empty() {
            eprint!("{error_output}");
         }
         let _ = std::io::stdout().flush();
         Ok(return_code)
      },
      BuildResponse::MismatchedVersion => {
         eprintln!("{}", style("Server speaks a different protocol version").red());
         Err(Error::UnexpectedResponse("send"))
      },
   }
}
