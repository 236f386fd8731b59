use std::time::Duration;

use compile_server::protocol::{
   self, BuildRequest, BuildResponse, FrameBuffer, MAX_MESSAGE_BYTES, RequestLanguage,
};
use tokio::io::AsyncWriteExt;

/// Response payload overhead around the output string: type, return code,
/// output length and an empty error string.
const RESPONSE_OVERHEAD: usize = 16;

/// `Completed` payload with the given raw bytes in place of the strings.
fn completed_payload(strings: &[u8]) -> Vec<u8> {
   let mut payload = Vec::new();
   payload.extend_from_slice(&0u32.to_le_bytes());
   payload.extend_from_slice(&7i32.to_le_bytes());
   payload.extend_from_slice(strings);
   payload
}

async fn send_raw(payload: &[u8]) -> tokio::io::DuplexStream {
   let (mut client, server) = tokio::io::duplex(payload.len() + 4);
   client
      .write_all(&(payload.len() as u32).to_le_bytes())
      .await
      .unwrap();
   client.write_all(payload).await.unwrap();
   server
}

#[tokio::test]
async fn test_length_prefix_split_across_writes() {
   let request = BuildRequest::new(RequestLanguage::VisualBasicCompile, "/src", ["a.vb"]);
   let frame = protocol::encode_request(&request).unwrap();
   let (mut client, mut server) = tokio::io::duplex(256);

   let writer = tokio::spawn(async move {
      client.write_all(&frame[..2]).await.unwrap();
      client.flush().await.unwrap();
      tokio::time::sleep(Duration::from_millis(20)).await;
      client.write_all(&frame[2..]).await.unwrap();
      client
   });

   let decoded = protocol::read_request(&mut server).await.unwrap();
   assert_eq!(decoded, request);
   writer.await.unwrap();
}

#[tokio::test]
async fn test_payload_of_exactly_max_bytes_is_accepted() {
   let output = "a".repeat((MAX_MESSAGE_BYTES - RESPONSE_OVERHEAD) / 2);
   let response = BuildResponse::completed(0, output, "");
   let frame = protocol::encode_response(&response).unwrap();
   assert_eq!(frame.len(), 4 + MAX_MESSAGE_BYTES);

   let (mut client, mut server) = tokio::io::duplex(64 * 1024);
   let mut out = FrameBuffer::new();
   let mut inp = FrameBuffer::new();
   let (sent, received) = tokio::join!(
      out.send(&mut server, &response),
      inp.recv::<_, BuildResponse>(&mut client)
   );
   sent.unwrap();
   assert_eq!(received.unwrap(), response);
}

#[test]
fn test_one_unit_over_max_is_refused_on_send() {
   let output = "a".repeat((MAX_MESSAGE_BYTES - RESPONSE_OVERHEAD) / 2 + 1);
   let err = protocol::encode_response(&BuildResponse::completed(0, output, "")).unwrap_err();
   assert!(err.to_string().contains("message too large"));
}

#[tokio::test]
async fn test_negative_string_length_is_rejected() {
   let mut strings = Vec::new();
   strings.extend_from_slice(&(-2i32).to_le_bytes());
   strings.extend_from_slice(&0i32.to_le_bytes());
   let mut server = send_raw(&completed_payload(&strings)).await;

   let err = FrameBuffer::new()
      .recv::<_, BuildResponse>(&mut server)
      .await
      .unwrap_err();
   assert!(err.to_string().contains("invalid string length"));
}

#[tokio::test]
async fn test_null_string_marker_reads_as_empty() {
   let mut strings = Vec::new();
   strings.extend_from_slice(&(-1i32).to_le_bytes());
   strings.extend_from_slice(&1i32.to_le_bytes());
   strings.extend_from_slice(&u16::from(b'w').to_le_bytes());
   let mut server = send_raw(&completed_payload(&strings)).await;

   let response: BuildResponse = FrameBuffer::new().recv(&mut server).await.unwrap();
   assert_eq!(response, BuildResponse::completed(7, "", "w"));
}

#[tokio::test]
async fn test_string_length_past_end_of_frame_is_truncation() {
   let mut strings = Vec::new();
   strings.extend_from_slice(&4i32.to_le_bytes());
   strings.extend_from_slice(&u16::from(b'x').to_le_bytes());
   let mut server = send_raw(&completed_payload(&strings)).await;

   let err = FrameBuffer::new()
      .recv::<_, BuildResponse>(&mut server)
      .await
      .unwrap_err();
   assert!(err.to_string().contains("truncated"));
}

#[tokio::test]
async fn test_frame_limit_is_clamped_to_protocol_maximum() {
   let (mut client, mut server) = tokio::io::duplex(32);
   let len = (MAX_MESSAGE_BYTES as u32) + 1;
   client.write_all(&len.to_le_bytes()).await.unwrap();
   drop(client);

   let mut buffer = FrameBuffer::new();
   let err = buffer
      .recv_with_limit::<_, BuildResponse>(&mut server, usize::MAX)
      .await
      .unwrap_err();
   assert!(err.to_string().contains("message too large"));
}

#[tokio::test]
async fn test_oversized_send_writes_nothing() {
   let (mut client, mut server) = tokio::io::duplex(64);
   let response = BuildResponse::completed(0, "z".repeat(MAX_MESSAGE_BYTES), "");

   let mut buffer = FrameBuffer::new();
   let err = buffer.send(&mut server, &response).await.unwrap_err();
   assert!(err.to_string().contains("message too large"));
   drop(server);

   let mut rest = Vec::new();
   tokio::io::AsyncReadExt::read_to_end(&mut client, &mut rest)
      .await
      .unwrap();
   assert!(rest.is_empty());
}

#[tokio::test]
async fn test_buffer_is_reusable_after_error() {
   let (mut client, mut server) = tokio::io::duplex(256);
   client.write_all(&4u32.to_le_bytes()).await.unwrap();
   client.write_all(&9u32.to_le_bytes()).await.unwrap();

   let mut buffer = FrameBuffer::new();
   let err = buffer
      .recv::<_, BuildResponse>(&mut server)
      .await
      .unwrap_err();
   assert!(err.to_string().contains("unknown response type"));

   buffer
      .send(&mut client, &BuildResponse::completed(5, "a", "b"))
      .await
      .unwrap();
   let response: BuildResponse = buffer.recv(&mut server).await.unwrap();
   assert_eq!(response, BuildResponse::completed(5, "a", "b"));
}
