use std::path::PathBuf;

use clap::{Parser, Subcommand};
use compile_server::{
   Result,
   cmd::{self, send::SendOptions},
   protocol::RequestLanguage,
};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the compile server
#[derive(Parser)]
#[command(name = "compile-server")]
#[command(about = "Long-lived local compiler server")]
#[command(version)]
struct Cli {
   #[command(subcommand)]
   command: Cmd,
}

/// Available subcommands
#[derive(Subcommand)]
enum Cmd {
   #[command(about = "Run a compile server in the foreground")]
   Serve {
      #[arg(
         long,
         allow_negative_numbers = true,
         help = "Idle lifetime in seconds (0 = exit after one connection, negative = forever)"
      )]
      keep_alive: Option<i64>,

      #[arg(long, help = "Endpoint name prefix; the process id is appended")]
      pipe_name: Option<String>,
   },

   #[command(about = "Send one build request to a running server")]
   Send {
      #[arg(long, help = "Process id of the server")]
      pid: u32,

      #[arg(
         long,
         default_value = "csharp",
         value_parser = cmd::send::parse_language,
         help = "Compiler to run (csharp or vb)"
      )]
      language: RequestLanguage,

      #[arg(long, help = "Working directory for the build (default: cwd)")]
      cwd: Option<PathBuf>,

      #[arg(long, allow_negative_numbers = true, help = "Keep-alive to request, in seconds")]
      keep_alive: Option<i64>,

      #[arg(long, env = "LIB", help = "Value of the LIB environment variable for the compiler")]
      lib: Option<String>,

      #[arg(long, help = "Endpoint name prefix (default from config)")]
      pipe_name: Option<String>,

      #[arg(trailing_var_arg = true, allow_hyphen_values = true, help = "Compiler arguments")]
      args: Vec<String>,
   },
}

#[tokio::main]
async fn main() {
   tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::from_default_env().add_directive(Level::WARN.into()))
      .init();

   let cli = Cli::parse();
   match run(cli).await {
      Ok(code) => std::process::exit(code),
      Err(err) => {
         eprintln!("{err}");
         std::process::exit(err.exit_code());
      },
   }
}

async fn run(cli: Cli) -> Result<i32> {
   match cli.command {
      Cmd::Serve { keep_alive, pipe_name } => {
         cmd::serve::execute(keep_alive, pipe_name).await?;
         Ok(0)
      },
      Cmd::Send { pid, language, cwd, keep_alive, lib, pipe_name, args } => {
         cmd::send::execute(SendOptions {
            pid,
            language,
            cwd,
            keep_alive,
            lib_env: lib,
            pipe_name,
            args,
         })
         .await
      },
   }
}
