//! Accept loop, admission control and the server's lifetime.
//!
//! The dispatcher listens on `<pipe_name_base><pid>` and hands every
//! admitted channel to its own [`Connection`] task. Shutdown always works by
//! closing the listening endpoint: the idle timer, a single-shot server
//! finishing its connection, and a handler fault all end up in
//! [`ServerState::close_listener`].

use std::{
   path::PathBuf,
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
   },
};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
   Result,
   config::{self, Config},
   connection::{CompletionReason, Connection},
   error::Error,
   handler::RequestHandler,
   keep_alive::{KeepAlive, KeepAlivePolicy},
   usock,
};

/// Reports whether the host has enough memory to take on another build.
///
/// Only consulted by 32-bit server processes, where address space runs out
/// long before physical memory does.
pub trait MemoryProbe: Send + Sync + 'static {
   fn is_memory_available(&self) -> bool;
}

/// Probe that never refuses.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeAvailable;

impl MemoryProbe for AssumeAvailable {
   fn is_memory_available(&self) -> bool {
      true
   }
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
   pub pipe_name_base: String,
   pub keep_alive:     KeepAlive,
   pub socket_dir:     PathBuf,
   /// Address width the memory gate assumes; below 64 the probe is consulted.
   pub pointer_width:  u32,
}

impl DispatcherOptions {
   pub fn from_config(cfg: &Config) -> Self {
      Self {
         pipe_name_base: cfg.pipe_name_base.clone(),
         keep_alive:     KeepAlive::from_secs(cfg.keep_alive_secs),
         socket_dir:     config::socket_dir().clone(),
         pointer_width:  usize::BITS,
      }
   }

   /// Endpoint this process listens on.
   pub fn endpoint_path(&self) -> PathBuf {
      let name = usock::endpoint_name(&self.pipe_name_base, std::process::id());
      usock::endpoint_path(&self.socket_dir, &name)
   }
}

/// Process-wide server state shared between the accept loop, connection
/// tasks and the idle timer.
#[derive(Debug)]
pub struct ServerState {
   active:           AtomicUsize,
   keep_alive:       Arc<KeepAlivePolicy>,
   first_connection: AtomicBool,
   next_id:          AtomicU64,
   listener_closed:  CancellationToken,
   fault:            Mutex<Option<Error>>,
}

impl ServerState {
   pub fn new(keep_alive: KeepAlive) -> Self {
      Self {
         active:           AtomicUsize::new(0),
         keep_alive:       Arc::new(KeepAlivePolicy::new(keep_alive)),
         first_connection: AtomicBool::new(false),
         next_id:          AtomicU64::new(0),
         listener_closed:  CancellationToken::new(),
         fault:            Mutex::new(None),
      }
   }

   pub fn active_connections(&self) -> usize {
      self.active.load(Ordering::Acquire)
   }

   pub const fn keep_alive(&self) -> &Arc<KeepAlivePolicy> {
      &self.keep_alive
   }

   pub fn received_first_connection(&self) -> bool {
      self.first_connection.load(Ordering::Acquire)
   }

   /// Stops the accept loop. Connections already dispatched run to
   /// completion.
   pub fn close_listener(&self) {
      self.listener_closed.cancel();
   }

   pub fn is_closed(&self) -> bool {
      self.listener_closed.is_cancelled()
   }

   pub async fn closed(&self) {
      self.listener_closed.cancelled().await;
   }

   fn next_connection_id(&self) -> String {
      format!("conn-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
   }

   /// Arms the idle timer if the policy has a finite lifetime and nothing is
   /// connected. The connection count is checked under the policy lock, so a
   /// concurrent accept either sees the armed timer and cancels it, or is
   /// seen here and prevents arming.
   fn arm_idle_timer(self: &Arc<Self>) {
      if self.is_closed() {
         return;
      }
      let Some(timer) = self
         .keep_alive
         .arm_when(|| self.active.load(Ordering::Acquire) == 0)
      else {
         return;
      };

      let state = Arc::clone(self);
      tokio::spawn(async move {
         if timer.elapsed().await {
            state.on_idle_timer_elapsed(timer.id());
         }
      });
   }

   fn on_idle_timer_elapsed(&self, timer_id: u64) {
      if self
         .keep_alive
         .expire(timer_id, || self.active.load(Ordering::Acquire) == 0)
      {
         tracing::info!(keep_alive = %self.keep_alive.current(), "idle timeout elapsed, shutting down");
         self.close_listener();
      } else {
         tracing::debug!(timer = timer_id, "ignoring stale idle timer");
      }
   }

   fn connection_accepted(&self) {
      self.first_connection.store(true, Ordering::Release);
      self.active.fetch_add(1, Ordering::AcqRel);
      self.keep_alive.cancel();
   }

   fn connection_rejected(self: &Arc<Self>) {
      if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
         self.arm_idle_timer();
      }
   }

   fn connection_completed(self: &Arc<Self>, outcome: Result<CompletionReason>) {
      let remaining = self.active.fetch_sub(1, Ordering::AcqRel) - 1;

      let reason = match outcome {
         Ok(reason) => reason,
         Err(e) => {
            tracing::error!("shutting down after fatal connection error: {e}");
            self.fault.lock().get_or_insert(e);
            self.close_listener();
            return;
         },
      };
      tracing::debug!(?reason, remaining, "connection finished");

      if self.keep_alive.current().stop_after_first_connection() {
         tracing::info!("single-shot server finished its connection, shutting down");
         self.close_listener();
      } else if remaining == 0 {
         self.arm_idle_timer();
      }
   }

   fn take_fault(&self) -> Option<Error> {
      self.fault.lock().take()
   }
}

pub struct ServerDispatcher {
   handler: Arc<dyn RequestHandler>,
   memory:  Arc<dyn MemoryProbe>,
   options: DispatcherOptions,
   state:   Arc<ServerState>,
}

impl ServerDispatcher {
   pub fn new(handler: Arc<dyn RequestHandler>, options: DispatcherOptions) -> Self {
      let state = Arc::new(ServerState::new(options.keep_alive));
      Self { handler, memory: Arc::new(AssumeAvailable), options, state }
   }

   pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
      self.memory = probe;
      self
   }

   /// Shared state, e.g. to close the listener from a signal handler.
   pub fn state(&self) -> Arc<ServerState> {
      Arc::clone(&self.state)
   }

   /// Listens and dispatches until the endpoint is closed.
   ///
   /// Returns an error if the endpoint cannot be created or a handler
   /// faulted. In-flight connections are awaited before returning.
   pub async fn run(self) -> Result<()> {
      let path = self.options.endpoint_path();
      let mut listener = match usock::Listener::bind(&path).await {
         Ok(listener) => listener,
         Err(e) => {
            tracing::error!("failed to create endpoint {}: {e}", path.display());
            return Err(e);
         },
      };
      tracing::info!(
         endpoint = %listener.local_addr(),
         keep_alive = %self.state.keep_alive.current(),
         "listening"
      );

      let tracker = TaskTracker::new();
      self.state.arm_idle_timer();

      loop {
         let stream = tokio::select! {
            biased;
            () = self.state.closed() => break,
            accepted = listener.accept() => match accepted {
               Ok(stream) => stream,
               Err(e) => {
                  tracing::warn!("accept failed, shutting down: {e}");
                  break;
               },
            },
         };

         self.state.connection_accepted();
         if !self.admit(&stream) {
            self.state.connection_rejected();
            drop(stream);
            continue;
         }

         let connection = Connection::new(
            self.state.next_connection_id(),
            Arc::clone(&self.handler),
            Arc::clone(&self.state.keep_alive),
         );
         tracing::debug!(connection = connection.id(), "accepted");

         let state = Arc::clone(&self.state);
         let (done_tx, done_rx) = oneshot::channel();
         tracker.spawn(async move {
            let outcome = connection.serve(stream).await;
            state.connection_completed(outcome);
            let _ = done_tx.send(());
         });

         // A single-shot server must not take a second client while the
         // first is still running.
         if self.state.keep_alive.current().stop_after_first_connection() {
            let _ = done_rx.await;
         }
      }

      self.state.close_listener();
      drop(listener);

      tracker.close();
      tracker.wait().await;
      self.state.keep_alive.cancel();
      tracing::info!("server stopped");

      match self.state.take_fault() {
         Some(e) => Err(e),
         None => Ok(()),
      }
   }

   fn admit(&self, stream: &usock::Stream) -> bool {
      if !stream.is_same_user() {
         tracing::warn!("rejecting connection from another user");
         return false;
      }
      if self.options.pointer_width < 64 && !self.memory.is_memory_available() {
         tracing::warn!("rejecting connection: not enough memory available");
         return false;
      }
      true
   }
}
