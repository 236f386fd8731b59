//! Compile server command.
//!
//! Runs the dispatcher in the foreground with the configured compilers until
//! the keep-alive expires, the single-shot connection finishes, or Ctrl+C.

use std::sync::Arc;

use console::style;
use tokio::signal;

use crate::{
   Result, config,
   dispatcher::{DispatcherOptions, ServerDispatcher},
   handler::ExecHandler,
   keep_alive::KeepAlive,
};

/// Executes the serve command.
pub async fn execute(keep_alive: Option<i64>, pipe_name: Option<String>) -> Result<()> {
   let cfg = config::get();

   let mut options = DispatcherOptions::from_config(cfg);
   if let Some(secs) = keep_alive {
      options.keep_alive = KeepAlive::from_secs(secs);
   }
   if let Some(base) = pipe_name {
      options.pipe_name_base = base;
   }

   println!("{}", style("Starting compile server...").green().bold());
   println!("Listening: {}", style(options.endpoint_path().display()).cyan());
   println!("PID: {}", style(std::process::id()).cyan());
   println!("Keep-alive: {}", style(options.keep_alive).dim());

   let handler = Arc::new(ExecHandler::from_config(cfg));
   let dispatcher = ServerDispatcher::new(handler, options);
   let state = dispatcher.state();

   println!("{}", style("Press Ctrl+C to stop").dim());

   let run = dispatcher.run();
   tokio::pin!(run);
   let result = tokio::select! {
      result = &mut run => result,
      _ = signal::ctrl_c() => {
         println!("\n{}", style("Shutting down...").yellow());
         state.close_listener();
         run.await
      }
   };

   if result.is_ok() {
      println!("{}", style("Server stopped").green());
   }
   result
}
