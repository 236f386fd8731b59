#![cfg(unix)]

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicUsize, Ordering},
   },
   time::Duration,
};

use compile_server::{
   Error,
   connection::{CompletionReason, Connection},
   handler::RequestHandler,
   keep_alive::{KeepAlive, KeepAlivePolicy},
   protocol::{self, BuildRequest, BuildResponse, RequestLanguage},
};
use tokio::{io::AsyncWriteExt, net::UnixStream};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

fn connection(handler: impl RequestHandler) -> (Connection, Arc<KeepAlivePolicy>) {
   let policy = Arc::new(KeepAlivePolicy::new(KeepAlive::Idle(Duration::from_secs(600))));
   let handler: Arc<dyn RequestHandler> = Arc::new(handler);
   (Connection::new("test-conn", handler, Arc::clone(&policy)), policy)
}

fn request() -> BuildRequest {
   BuildRequest::new(RequestLanguage::CSharpCompile, "/tmp", ["a.cs"])
}

#[tokio::test]
async fn test_completed_request_gets_response() {
   let (conn, _) = connection(|req: BuildRequest, _: &CancellationToken| {
      let cmd = req.command_line();
      BuildResponse::completed(0, cmd.args.join(" "), "")
   });
   let (mut client, server) = UnixStream::pair().unwrap();
   let task = tokio::spawn(conn.serve(server));

   protocol::write_request(&mut client, &request()).await.unwrap();
   let response = protocol::read_response(&mut client).await.unwrap();
   assert_eq!(response, BuildResponse::completed(0, "a.cs", ""));
   drop(client);

   let outcome = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
   assert_eq!(outcome.unwrap(), CompletionReason::Completed);
}

#[tokio::test]
async fn test_keep_alive_argument_is_applied() {
   let (conn, policy) =
      connection(|_: BuildRequest, _: &CancellationToken| BuildResponse::completed(0, "", ""));
   let (mut client, server) = UnixStream::pair().unwrap();
   let task = tokio::spawn(conn.serve(server));

   protocol::write_request(&mut client, &request().with_keep_alive(42))
      .await
      .unwrap();
   protocol::read_response(&mut client).await.unwrap();

   tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
   assert_eq!(policy.current(), KeepAlive::Idle(Duration::from_secs(42)));
   assert!(!policy.is_default());
}

#[tokio::test]
async fn test_unparseable_keep_alive_is_ignored() {
   let (conn, policy) =
      connection(|_: BuildRequest, _: &CancellationToken| BuildResponse::completed(0, "", ""));
   let (mut client, server) = UnixStream::pair().unwrap();
   let task = tokio::spawn(conn.serve(server));

   let mut req = request();
   req.arguments.push(protocol::Argument::new(
      protocol::ArgumentId::KeepAlive,
      0,
      "a while",
   ));
   protocol::write_request(&mut client, &req).await.unwrap();
   protocol::read_response(&mut client).await.unwrap();

   tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
   assert!(policy.is_default());
}

#[tokio::test]
async fn test_client_disconnect_cancels_handler() {
   let saw_cancel = Arc::new(AtomicBool::new(false));
   let flag = Arc::clone(&saw_cancel);
   let (conn, _) = connection(move |_: BuildRequest, cancel: &CancellationToken| {
      while !cancel.is_cancelled() {
         std::thread::sleep(Duration::from_millis(5));
      }
      flag.store(true, Ordering::SeqCst);
      BuildResponse::completed(0, "too late", "")
   });
   let (mut client, server) = UnixStream::pair().unwrap();
   let task = tokio::spawn(conn.serve(server));

   protocol::write_request(&mut client, &request()).await.unwrap();
   tokio::time::sleep(Duration::from_millis(50)).await;
   drop(client);

   let outcome = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
   assert_eq!(outcome.unwrap(), CompletionReason::ClientDisconnect);

   let deadline = std::time::Instant::now() + WAIT;
   while !saw_cancel.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
      tokio::time::sleep(Duration::from_millis(5)).await;
   }
   assert!(saw_cancel.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_half_closed_client_still_gets_response() {
   let (conn, _) = connection(|_: BuildRequest, _: &CancellationToken| {
      std::thread::sleep(Duration::from_millis(100));
      BuildResponse::completed(0, "delivered", "")
   });
   let (mut client, server) = UnixStream::pair().unwrap();
   let task = tokio::spawn(conn.serve(server));

   protocol::write_request(&mut client, &request()).await.unwrap();
   client.shutdown().await.unwrap();

   let response = protocol::read_response(&mut client).await.unwrap();
   assert_eq!(response, BuildResponse::completed(0, "delivered", ""));
   let outcome = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
   assert_eq!(outcome.unwrap(), CompletionReason::Completed);
}

#[tokio::test]
async fn test_hang_up_after_half_close_cancels_handler() {
   let (conn, _) = connection(|_: BuildRequest, cancel: &CancellationToken| {
      while !cancel.is_cancelled() {
         std::thread::sleep(Duration::from_millis(5));
      }
      BuildResponse::completed(0, "too late", "")
   });
   let (mut client, server) = UnixStream::pair().unwrap();
   let task = tokio::spawn(conn.serve(server));

   protocol::write_request(&mut client, &request()).await.unwrap();
   client.shutdown().await.unwrap();
   tokio::time::sleep(Duration::from_millis(50)).await;
   assert!(!task.is_finished());
   drop(client);

   let outcome = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
   assert_eq!(outcome.unwrap(), CompletionReason::ClientDisconnect);
}

#[tokio::test]
async fn test_malformed_request_never_reaches_handler() {
   let calls = Arc::new(AtomicUsize::new(0));
   let counter = Arc::clone(&calls);
   let (conn, _) = connection(move |_: BuildRequest, _: &CancellationToken| {
      counter.fetch_add(1, Ordering::SeqCst);
      BuildResponse::completed(0, "", "")
   });
   let (mut client, server) = UnixStream::pair().unwrap();
   let task = tokio::spawn(conn.serve(server));

   client.write_all(&8u32.to_le_bytes()).await.unwrap();
   client.write_all(&[0xff; 8]).await.unwrap();
   drop(client);

   let outcome = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
   assert_eq!(outcome.unwrap(), CompletionReason::CompilationNotStarted);
   assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_immediate_eof_is_compilation_not_started() {
   let (conn, _) =
      connection(|_: BuildRequest, _: &CancellationToken| BuildResponse::completed(0, "", ""));
   let (client, server) = UnixStream::pair().unwrap();
   drop(client);

   let outcome = tokio::time::timeout(WAIT, conn.serve(server)).await.unwrap();
   assert_eq!(outcome.unwrap(), CompletionReason::CompilationNotStarted);
}

#[tokio::test]
async fn test_version_mismatch_is_answered_without_handler() {
   let calls = Arc::new(AtomicUsize::new(0));
   let counter = Arc::clone(&calls);
   let (conn, policy) = connection(move |_: BuildRequest, _: &CancellationToken| {
      counter.fetch_add(1, Ordering::SeqCst);
      BuildResponse::completed(0, "", "")
   });
   let (mut client, server) = UnixStream::pair().unwrap();
   let task = tokio::spawn(conn.serve(server));

   let mut req = request().with_keep_alive(99);
   req.protocol_version = 2;
   protocol::write_request(&mut client, &req).await.unwrap();
   let response = protocol::read_response(&mut client).await.unwrap();
   assert_eq!(response, BuildResponse::MismatchedVersion);

   let outcome = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
   assert_eq!(outcome.unwrap(), CompletionReason::Completed);
   assert_eq!(calls.load(Ordering::SeqCst), 0);
   assert!(policy.is_default());
}

#[tokio::test]
async fn test_handler_panic_is_reported_as_fault() {
   let (conn, _) = connection(|_: BuildRequest, _: &CancellationToken| -> BuildResponse {
      panic!("compiler exploded")
   });
   let (mut client, server) = UnixStream::pair().unwrap();
   let task = tokio::spawn(conn.serve(server));

   protocol::write_request(&mut client, &request()).await.unwrap();

   let outcome = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
   let err = outcome.unwrap_err();
   assert!(matches!(err, Error::HandlerFault { .. }));
   assert!(err.to_string().contains("compiler exploded"));
   assert!(err.to_string().contains("test-conn"));

   // The channel was closed without a response.
   assert!(protocol::read_response(&mut client).await.is_err());
}
