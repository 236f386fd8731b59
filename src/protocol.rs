//! Binary wire protocol between build clients and the server.
//!
//! Every message travels as `[payload_len: u32 LE][payload]`. Strings are
//! length-prefixed little-endian UTF-16 code unit sequences, so values are
//! transcoded from and to Rust's UTF-8 strings at this boundary.

use std::{fmt, io, string::FromUtf16Error};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version spoken by this server.
pub const PROTOCOL_VERSION: u32 = 1;

/// Hard cap on a frame payload, enforced on both read and write.
pub const MAX_MESSAGE_BYTES: usize = 0x10_0000;

/// Largest argument count a request may carry.
pub const MAX_ARGUMENTS: usize = u16::MAX as usize;

const LENGTH_PREFIX_BYTES: usize = 4;
const NULL_STRING_LENGTH: i32 = -1;

const RESPONSE_COMPLETED: u32 = 0;
const RESPONSE_MISMATCHED_VERSION: u32 = 1;

/// Errors produced while framing, encoding or decoding messages.
///
/// Any of these means "no valid message"; callers never see a partially
/// decoded value.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
   /// The payload exceeds [`MAX_MESSAGE_BYTES`] (or a smaller caller limit).
   #[error("message too large: {0} bytes")]
   MessageTooLarge(usize),

   /// A request carries more than [`MAX_ARGUMENTS`] arguments.
   #[error("too many arguments: {0}")]
   TooManyArguments(usize),

   /// The buffer ended before a field was complete.
   #[error("truncated message: needed {needed} bytes, {remaining} remaining")]
   Truncated { needed: usize, remaining: usize },

   #[error("unknown request language: {0:#x}")]
   UnknownLanguage(u32),

   #[error("unknown response type: {0}")]
   UnknownResponseType(u32),

   #[error("invalid string length: {0}")]
   InvalidStringLength(i32),

   /// A string contained an unpaired surrogate.
   #[error("invalid utf-16 string: {0}")]
   InvalidUtf16(#[source] FromUtf16Error),

   #[error("{0} trailing bytes after message")]
   TrailingBytes(usize),

   /// Failed to read from the channel, including end-of-stream mid-frame.
   #[error("failed to read: {0}")]
   Read(#[source] io::Error),

   /// Failed to write to the channel.
   #[error("failed to write: {0}")]
   Write(#[source] io::Error),
}

/// Compiler front-end a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestLanguage {
   CSharpCompile,
   VisualBasicCompile,
}

impl RequestLanguage {
   const fn to_wire(self) -> u32 {
      match self {
         Self::CSharpCompile => 0x4453_2521,
         Self::VisualBasicCompile => 0x4453_2522,
      }
   }

   fn from_wire(raw: u32) -> Result<Self, ProtocolError> {
      match raw {
         0x4453_2521 => Ok(Self::CSharpCompile),
         0x4453_2522 => Ok(Self::VisualBasicCompile),
         other => Err(ProtocolError::UnknownLanguage(other)),
      }
   }
}

impl fmt::Display for RequestLanguage {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::CSharpCompile => f.write_str("csharp"),
         Self::VisualBasicCompile => f.write_str("visual-basic"),
      }
   }
}

/// Identifies what an [`Argument`] carries.
///
/// Ids this server does not know decode as [`ArgumentId::Unknown`] so newer
/// clients can add fields without breaking older servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgumentId {
   /// The client's working directory.
   CurrentDirectory,
   /// One positional command-line argument; `index` gives its position.
   CommandLineArgument,
   /// The client's `LIB` environment variable.
   LibEnvVariable,
   /// Requested server keep-alive, in whole seconds.
   KeepAlive,
   Unknown(u32),
}

impl ArgumentId {
   const fn to_wire(self) -> u32 {
      match self {
         Self::CurrentDirectory => 0x5114_7221,
         Self::CommandLineArgument => 0x5114_7222,
         Self::LibEnvVariable => 0x5114_7223,
         Self::KeepAlive => 0x5114_7224,
         Self::Unknown(raw) => raw,
      }
   }

   const fn from_wire(raw: u32) -> Self {
      match raw {
         0x5114_7221 => Self::CurrentDirectory,
         0x5114_7222 => Self::CommandLineArgument,
         0x5114_7223 => Self::LibEnvVariable,
         0x5114_7224 => Self::KeepAlive,
         other => Self::Unknown(other),
      }
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
   pub id:    ArgumentId,
   pub index: u32,
   pub value: String,
}

impl Argument {
   pub fn new(id: ArgumentId, index: u32, value: impl Into<String>) -> Self {
      Self { id, index, value: value.into() }
   }
}

/// A single compilation request sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
   pub protocol_version: u32,
   pub language:         RequestLanguage,
   pub arguments:        Vec<Argument>,
}

impl BuildRequest {
   /// Builds a request for the current protocol version from a working
   /// directory and an argv list.
   pub fn new<I, S>(
      language: RequestLanguage,
      current_directory: impl Into<String>,
      args: I,
   ) -> Self
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      let mut arguments = vec![Argument::new(ArgumentId::CurrentDirectory, 0, current_directory)];
      arguments.extend(
         args
            .into_iter()
            .enumerate()
            .map(|(i, arg)| Argument::new(ArgumentId::CommandLineArgument, i as u32, arg)),
      );
      Self { protocol_version: PROTOCOL_VERSION, language, arguments }
   }

   pub fn with_keep_alive(mut self, seconds: i64) -> Self {
      self
         .arguments
         .push(Argument::new(ArgumentId::KeepAlive, 0, seconds.to_string()));
      self
   }

   pub fn with_lib_env(mut self, value: impl Into<String>) -> Self {
      self
         .arguments
         .push(Argument::new(ArgumentId::LibEnvVariable, 0, value));
      self
   }

   /// Raw value of the first keep-alive argument, if any.
   pub fn keep_alive(&self) -> Option<&str> {
      self
         .arguments
         .iter()
         .find(|arg| arg.id == ArgumentId::KeepAlive)
         .map(|arg| arg.value.as_str())
   }

   /// Reassembles the client's command line from the argument list.
   ///
   /// Missing positional indices become empty strings. Indices past
   /// [`MAX_ARGUMENTS`] cannot come from a well-formed client and are dropped.
   pub fn command_line(&self) -> CommandLine {
      let mut cmd = CommandLine::default();
      for arg in &self.arguments {
         match arg.id {
            ArgumentId::CurrentDirectory => cmd.current_directory = Some(arg.value.clone()),
            ArgumentId::LibEnvVariable => cmd.lib_env = Some(arg.value.clone()),
            ArgumentId::KeepAlive => cmd.keep_alive = Some(arg.value.clone()),
            ArgumentId::CommandLineArgument => {
               let index = arg.index as usize;
               if index >= MAX_ARGUMENTS {
                  tracing::debug!("dropping argument with out-of-range index {index}");
                  continue;
               }
               if cmd.args.len() <= index {
                  cmd.args.resize(index + 1, String::new());
               }
               cmd.args[index].clone_from(&arg.value);
            },
            ArgumentId::Unknown(raw) => cmd.unknown.push(raw),
         }
      }
      cmd
   }
}

/// Decoded view of a request's arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
   pub current_directory: Option<String>,
   pub args:              Vec<String>,
   pub lib_env:           Option<String>,
   pub keep_alive:        Option<String>,
   /// Raw ids of arguments this server does not understand.
   pub unknown:           Vec<u32>,
}

/// Server reply to a [`BuildRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildResponse {
   Completed { return_code: i32, output: String, error_output: String },
   MismatchedVersion,
}

impl BuildResponse {
   pub fn completed(
      return_code: i32,
      output: impl Into<String>,
      error_output: impl Into<String>,
   ) -> Self {
      Self::Completed { return_code, output: output.into(), error_output: error_output.into() }
   }
}

/// A message with a binary payload encoding.
pub trait WireMessage: Sized {
   fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), ProtocolError>;

   /// Decodes from the front of `buf`, advancing it past the consumed bytes.
   fn decode_payload(buf: &mut &[u8]) -> Result<Self, ProtocolError>;
}

impl WireMessage for BuildRequest {
   fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
      if self.arguments.len() > MAX_ARGUMENTS {
         return Err(ProtocolError::TooManyArguments(self.arguments.len()));
      }
      buf.put_u32_le(self.protocol_version);
      buf.put_u32_le(self.language.to_wire());
      buf.put_u32_le(self.arguments.len() as u32);
      for arg in &self.arguments {
         buf.put_u32_le(arg.id.to_wire());
         buf.put_u32_le(arg.index);
         put_string(buf, &arg.value)?;
      }
      Ok(())
   }

   fn decode_payload(buf: &mut &[u8]) -> Result<Self, ProtocolError> {
      let protocol_version = take_u32(buf)?;
      let language = RequestLanguage::from_wire(take_u32(buf)?)?;
      let count = take_u32(buf)? as usize;
      if count > MAX_ARGUMENTS {
         return Err(ProtocolError::TooManyArguments(count));
      }

      // Each argument needs at least 12 bytes; don't trust the count for
      // preallocation beyond what the buffer can hold.
      let mut arguments = Vec::with_capacity(count.min(buf.len() / 12));
      for _ in 0..count {
         let id = ArgumentId::from_wire(take_u32(buf)?);
         let index = take_u32(buf)?;
         let value = take_string(buf)?;
         arguments.push(Argument { id, index, value });
      }

      Ok(Self { protocol_version, language, arguments })
   }
}

impl WireMessage for BuildResponse {
   fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
      match self {
         Self::Completed { return_code, output, error_output } => {
            buf.put_u32_le(RESPONSE_COMPLETED);
            buf.put_i32_le(*return_code);
            put_string(buf, output)?;
            put_string(buf, error_output)?;
         },
         Self::MismatchedVersion => buf.put_u32_le(RESPONSE_MISMATCHED_VERSION),
      }
      Ok(())
   }

   fn decode_payload(buf: &mut &[u8]) -> Result<Self, ProtocolError> {
      match take_u32(buf)? {
         RESPONSE_COMPLETED => {
            let return_code = take_i32(buf)?;
            let output = take_string(buf)?;
            let error_output = take_string(buf)?;
            Ok(Self::Completed { return_code, output, error_output })
         },
         RESPONSE_MISMATCHED_VERSION => Ok(Self::MismatchedVersion),
         other => Err(ProtocolError::UnknownResponseType(other)),
      }
   }
}

pub fn encode_request(request: &BuildRequest) -> Result<Bytes, ProtocolError> {
   encode_frame(request)
}

pub fn decode_request(frame: &[u8]) -> Result<BuildRequest, ProtocolError> {
   decode_frame(frame)
}

pub fn encode_response(response: &BuildResponse) -> Result<Bytes, ProtocolError> {
   encode_frame(response)
}

pub fn decode_response(frame: &[u8]) -> Result<BuildResponse, ProtocolError> {
   decode_frame(frame)
}

/// Encodes `msg` as a complete frame, length prefix included.
pub fn encode_frame<M: WireMessage>(msg: &M) -> Result<Bytes, ProtocolError> {
   let mut buf = BytesMut::with_capacity(256);
   write_frame(&mut buf, msg)?;
   Ok(buf.freeze())
}

/// Decodes a complete frame. The frame must hold exactly one message.
pub fn decode_frame<M: WireMessage>(frame: &[u8]) -> Result<M, ProtocolError> {
   let mut buf = frame;
   let len = take_u32(&mut buf)? as usize;
   if len > MAX_MESSAGE_BYTES {
      return Err(ProtocolError::MessageTooLarge(len));
   }
   ensure(buf, len)?;
   if buf.len() > len {
      return Err(ProtocolError::TrailingBytes(buf.len() - len));
   }
   decode_exact(buf)
}

fn write_frame<M: WireMessage>(buf: &mut BytesMut, msg: &M) -> Result<(), ProtocolError> {
   buf.clear();
   buf.put_u32_le(0);
   msg.encode_payload(buf)?;
   let payload_len = buf.len() - LENGTH_PREFIX_BYTES;
   if payload_len > MAX_MESSAGE_BYTES {
      buf.clear();
      return Err(ProtocolError::MessageTooLarge(payload_len));
   }
   buf[..LENGTH_PREFIX_BYTES].copy_from_slice(&(payload_len as u32).to_le_bytes());
   Ok(())
}

fn decode_exact<M: WireMessage>(payload: &[u8]) -> Result<M, ProtocolError> {
   let mut cursor = payload;
   let msg = M::decode_payload(&mut cursor)?;
   if !cursor.is_empty() {
      return Err(ProtocolError::TrailingBytes(cursor.len()));
   }
   Ok(msg)
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
   let units = value.encode_utf16().count();
   // Bail before buffering anything that can never fit in one frame.
   if units > MAX_MESSAGE_BYTES / 2 {
      return Err(ProtocolError::MessageTooLarge(units * 2));
   }
   buf.reserve(4 + units * 2);
   buf.put_i32_le(units as i32);
   for unit in value.encode_utf16() {
      buf.put_u16_le(unit);
   }
   if buf.len() - LENGTH_PREFIX_BYTES > MAX_MESSAGE_BYTES {
      return Err(ProtocolError::MessageTooLarge(buf.len() - LENGTH_PREFIX_BYTES));
   }
   Ok(())
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), ProtocolError> {
   if buf.len() < needed {
      return Err(ProtocolError::Truncated { needed, remaining: buf.len() });
   }
   Ok(())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, ProtocolError> {
   ensure(buf, 4)?;
   Ok(buf.get_u32_le())
}

fn take_i32(buf: &mut &[u8]) -> Result<i32, ProtocolError> {
   ensure(buf, 4)?;
   Ok(buf.get_i32_le())
}

fn take_string(buf: &mut &[u8]) -> Result<String, ProtocolError> {
   let len = take_i32(buf)?;
   if len == NULL_STRING_LENGTH {
      return Ok(String::new());
   }
   let units = usize::try_from(len).map_err(|_| ProtocolError::InvalidStringLength(len))?;
   let byte_len = units
      .checked_mul(2)
      .ok_or(ProtocolError::InvalidStringLength(len))?;
   ensure(buf, byte_len)?;

   let mut code_units = Vec::with_capacity(units);
   for _ in 0..units {
      code_units.push(buf.get_u16_le());
   }
   String::from_utf16(&code_units).map_err(ProtocolError::InvalidUtf16)
}

/// Reusable buffer for framed reads and writes on a channel.
#[derive(Debug, Default)]
pub struct FrameBuffer {
   buf: BytesMut,
}

impl FrameBuffer {
   pub fn new() -> Self {
      Self { buf: BytesMut::new() }
   }

   /// Encodes and sends a message with its length prefix.
   ///
   /// Nothing is written when the message exceeds the frame limit.
   pub async fn send<W, M>(&mut self, writer: &mut W, msg: &M) -> Result<(), ProtocolError>
   where
      W: AsyncWrite + Unpin,
      M: WireMessage,
   {
      write_frame(&mut self.buf, msg)?;
      writer
         .write_all(&self.buf)
         .await
         .map_err(ProtocolError::Write)?;
      writer.flush().await.map_err(ProtocolError::Write)?;
      Ok(())
   }

   /// Receives and decodes one length-prefixed message.
   pub async fn recv<R, M>(&mut self, reader: &mut R) -> Result<M, ProtocolError>
   where
      R: AsyncRead + Unpin,
      M: WireMessage,
   {
      self.recv_with_limit(reader, MAX_MESSAGE_BYTES).await
   }

   /// Like [`FrameBuffer::recv`] with a tighter payload limit. Limits above
   /// [`MAX_MESSAGE_BYTES`] are clamped to it.
   pub async fn recv_with_limit<R, M>(
      &mut self,
      reader: &mut R,
      max_len: usize,
   ) -> Result<M, ProtocolError>
   where
      R: AsyncRead + Unpin,
      M: WireMessage,
   {
      let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
      reader
         .read_exact(&mut len_buf)
         .await
         .map_err(ProtocolError::Read)?;
      let len = u32::from_le_bytes(len_buf) as usize;

      if len > max_len.min(MAX_MESSAGE_BYTES) {
         return Err(ProtocolError::MessageTooLarge(len));
      }

      self.buf.clear();
      self.buf.resize(len, 0);
      reader
         .read_exact(&mut self.buf[..])
         .await
         .map_err(ProtocolError::Read)?;
      decode_exact(&self.buf)
   }
}

pub async fn read_request<R>(reader: &mut R) -> Result<BuildRequest, ProtocolError>
where
   R: AsyncRead + Unpin,
{
   FrameBuffer::new().recv(reader).await
}

pub async fn write_request<W>(writer: &mut W, request: &BuildRequest) -> Result<(), ProtocolError>
where
   W: AsyncWrite + Unpin,
{
   FrameBuffer::new().send(writer, request).await
}

pub async fn read_response<R>(reader: &mut R) -> Result<BuildResponse, ProtocolError>
where
   R: AsyncRead + Unpin,
{
   FrameBuffer::new().recv(reader).await
}

pub async fn write_response<W>(writer: &mut W, response: &BuildResponse) -> Result<(), ProtocolError>
where
   W: AsyncWrite + Unpin,
{
   FrameBuffer::new().send(writer, response).await
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn command_line_fills_gaps_with_empty_strings() {
      let request = BuildRequest {
         protocol_version: PROTOCOL_VERSION,
         language:         RequestLanguage::CSharpCompile,
         arguments:        vec![
            Argument::new(ArgumentId::CommandLineArgument, 2, "c.cs"),
            Argument::new(ArgumentId::CurrentDirectory, 0, "/src"),
            Argument::new(ArgumentId::CommandLineArgument, 0, "a.cs"),
         ],
      };

      let cmd = request.command_line();
      assert_eq!(cmd.current_directory.as_deref(), Some("/src"));
      assert_eq!(cmd.args, vec!["a.cs".to_string(), String::new(), "c.cs".to_string()]);
   }

   #[test]
   fn command_line_collects_unknown_ids() {
      let mut request = BuildRequest::new(RequestLanguage::CSharpCompile, "/src", ["a.cs"]);
      request
         .arguments
         .push(Argument::new(ArgumentId::Unknown(0x5114_7299), 0, "future"));

      let cmd = request.command_line();
      assert_eq!(cmd.unknown, vec![0x5114_7299]);
      assert_eq!(cmd.args, vec!["a.cs".to_string()]);
   }

   #[test]
   fn null_string_marker_decodes_as_empty() {
      let mut payload = BytesMut::new();
      payload.put_u32_le(RESPONSE_COMPLETED);
      payload.put_i32_le(0);
      payload.put_i32_le(NULL_STRING_LENGTH);
      payload.put_i32_le(NULL_STRING_LENGTH);

      let mut cursor = &payload[..];
      let response = BuildResponse::decode_payload(&mut cursor).unwrap();
      assert_eq!(response, BuildResponse::completed(0, "", ""));
   }

   #[test]
   fn negative_string_length_is_rejected() {
      let mut payload = BytesMut::new();
      payload.put_i32_le(-2);
      let mut cursor = &payload[..];
      assert!(matches!(take_string(&mut cursor), Err(ProtocolError::InvalidStringLength(-2))));
   }

   #[test]
   fn unknown_argument_ids_survive_decoding() {
      assert_eq!(ArgumentId::from_wire(7), ArgumentId::Unknown(7));
      assert_eq!(ArgumentId::Unknown(7).to_wire(), 7);
      assert_eq!(ArgumentId::from_wire(ArgumentId::KeepAlive.to_wire()), ArgumentId::KeepAlive);
   }
}
