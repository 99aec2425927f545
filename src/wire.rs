//! Wire protocol for the request/reply and publish/subscribe fabric.
//!
//! Every message is built from length-prefixed frames (u32 little-endian
//! length followed by the bytes). A call is two frames `[kind, payload]`
//! where `kind` is a single tag byte and `payload` is a UTF-8 JSON
//! [`AttributeRequest`]. A reply is a single body frame. A publication is
//! two frames `[topic, payload]`.
//!
//! Request body conventions:
//! - `RunCommand`: `attribute` is the command name, `args`/`kwargs` are the
//!   command parameters.
//! - `GetProperties`: `attribute` is `"properties"`, `args` lists the
//!   property names to read (empty list means all).
//! - `SetProperties`: `attribute` is `"properties"`, `kwargs` carries the
//!   name → value pairs to write.
//! - `GetInterface`: `attribute` is `"interface"`, args and kwargs empty.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::capability::DeviceInterface;

/// Upper bound on a single frame, matching the serving side's buffer budget.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RequestKind {
    RunCommand = 0,
    GetProperties = 1,
    SetProperties = 2,
    GetInterface = 3,
}

impl RequestKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RequestKind::RunCommand),
            1 => Some(RequestKind::GetProperties),
            2 => Some(RequestKind::SetProperties),
            3 => Some(RequestKind::GetInterface),
            _ => None,
        }
    }
}

/// Body of every call on the request socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeRequest {
    pub device: String,
    pub attribute: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// Reply body for `RunCommand` calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandResponse {
    Success { value: Value },
    Error { message: String },
}

/// Reply body for property reads and writes, and the payload published on
/// every `{uid}/properties` change batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PropsResponse {
    Success { props: Map<String, Value> },
    Error { message: String },
}

/// Reply body for `GetInterface`: either the interface snapshot or an error
/// in `CommandResponse` shape (e.g., unknown device).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum InterfaceReply {
    Error(CommandResponse),
    Interface(DeviceInterface),
}

/// Topic carrying property-change batches for a device.
pub fn properties_topic(uid: &str) -> String {
    format!("{uid}/properties")
}

/// Topic carrying an opaque named byte-stream for a device.
pub fn stream_topic(uid: &str, stream: &str) -> String {
    format!("{uid}/{stream}")
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    let len = u32::try_from(frame.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(frame).await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit"),
        ));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

/// Write a two-frame call `[kind, payload]` and flush.
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: RequestKind,
    payload: &[u8],
) -> io::Result<()> {
    write_frame(writer, &[kind as u8]).await?;
    write_frame(writer, payload).await?;
    writer.flush().await
}

/// Read a two-frame call, validating the kind tag.
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> io::Result<(RequestKind, Vec<u8>)> {
    let kind_frame = read_frame(reader).await?;
    if kind_frame.len() != 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "kind frame must be a single byte",
        ));
    }
    let kind = RequestKind::from_u8(kind_frame[0])
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid request kind"))?;
    let payload = read_frame(reader).await?;
    Ok((kind, payload))
}

/// Write a single-frame reply body and flush.
pub async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    write_frame(writer, payload).await?;
    writer.flush().await
}

/// Read a single-frame reply body.
pub async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    read_frame(reader).await
}

/// Write a two-frame publication `[topic, payload]` and flush.
pub async fn write_publication<W: AsyncWrite + Unpin>(
    writer: &mut W,
    topic: &str,
    payload: &[u8],
) -> io::Result<()> {
    write_frame(writer, topic.as_bytes()).await?;
    write_frame(writer, payload).await?;
    writer.flush().await
}

/// Read a two-frame publication.
pub async fn read_publication<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> io::Result<(String, Vec<u8>)> {
    let topic_frame = read_frame(reader).await?;
    let topic = String::from_utf8(topic_frame)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let payload = read_frame(reader).await?;
    Ok((topic, payload))
}
