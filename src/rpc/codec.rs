//! Frame codec for the RPC wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ kind(1B) │   encoded payload      │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! Length = sizeof(kind byte) + sizeof(payload), NOT including the 4-byte prefix.
//!
//! A request or response is a header frame immediately followed by a body
//! frame, both encoded with the codec negotiated during the handshake.

use crate::types::{Error, Result};
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

/// Default cap on a single frame.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 5 * 1024 * 1024;

/// Frame kind: handshake options (always JSON).
pub const FRAME_OPTIONS: u8 = 0x00;
/// Frame kind: encoded [`Header`].
pub const FRAME_HEADER: u8 = 0x01;
/// Frame kind: encoded body value.
pub const FRAME_BODY: u8 = 0x02;

/// Per-frame metadata of a request or response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    /// `"Service.Method"`.
    pub service_method: String,
    /// Client-assigned sequence number.
    pub seq: u64,
    /// Empty on success.
    pub error: String,
}

/// Wire encoding, identified on the wire by its tag.
///
/// The binary codec is MessagePack and announces itself as
/// `application/msgpack`. Peers that offer `application/gob` are rejected
/// during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CodecType {
    /// Compact binary encoding (MessagePack with named fields).
    #[default]
    #[serde(rename = "application/msgpack")]
    MsgPack,
    /// Textual encoding.
    #[serde(rename = "application/json")]
    Json,
}

impl CodecType {
    pub const ALL: [CodecType; 2] = [CodecType::MsgPack, CodecType::Json];

    /// Codec tag carried in the handshake.
    pub fn as_str(self) -> &'static str {
        match self {
            CodecType::MsgPack => "application/msgpack",
            CodecType::Json => "application/json",
        }
    }

    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecType::MsgPack => {
                rmp_serde::to_vec_named(value).map_err(|e| Error::encode(e.to_string()))
            }
            CodecType::Json => serde_json::to_vec(value).map_err(|e| Error::encode(e.to_string())),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, payload: &[u8]) -> Result<T> {
        match self {
            CodecType::MsgPack => {
                rmp_serde::from_slice(payload).map_err(|e| Error::decode(e.to_string()))
            }
            CodecType::Json => {
                serde_json::from_slice(payload).map_err(|e| Error::decode(e.to_string()))
            }
        }
    }
}

impl FromStr for CodecType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CodecType::ALL
            .into_iter()
            .find(|codec| codec.as_str() == s)
            .ok_or_else(|| Error::handshake(format!("invalid codec type {}", s)))
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read one frame from the stream.
///
/// Returns `(kind, payload)`. Returns `None` on clean EOF.
/// `max_frame_bytes` caps the maximum accepted frame size.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<(u8, Bytes)>> {
    // Only a stream that ends before the first prefix byte is a clean EOF.
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream ended inside frame length ({} of 4 bytes)", filled),
            ));
        }
        filled += n;
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes", frame_len),
        ));
    }
    if frame_len < 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Frame too short: missing kind byte",
        ));
    }

    let mut frame = BytesMut::zeroed(frame_len as usize);
    reader.read_exact(&mut frame).await?;

    let kind = frame[0];
    let payload = frame.split_off(1).freeze();

    Ok(Some((kind, payload)))
}

/// Append one frame to the writer. Does not flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let frame_len = u32::try_from(payload.len() + 1).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Frame too large: {} bytes", payload.len()),
        )
    })?;
    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(&[kind]).await?;
    writer.write_all(payload).await?;
    Ok(())
}

fn body_eof() -> Error {
    std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "stream ended before body frame",
    )
    .into()
}

/// Read side of a connection's codec.
///
/// Exactly one task owns the reader of a connection, so header/body pairs are
/// never interleaved.
pub struct CodecReader<R> {
    reader: R,
    codec: CodecType,
    max_frame_bytes: u32,
}

impl<R> fmt::Debug for CodecReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecReader")
            .field("codec", &self.codec)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish_non_exhaustive()
    }
}

impl<R: AsyncRead + Unpin> CodecReader<R> {
    pub fn new(reader: R, codec: CodecType, max_frame_bytes: u32) -> Self {
        Self {
            reader,
            codec,
            max_frame_bytes,
        }
    }

    pub fn codec_type(&self) -> CodecType {
        self.codec
    }

    async fn expect_frame(&mut self, kind: u8) -> Result<Option<Bytes>> {
        match read_frame(&mut self.reader, self.max_frame_bytes).await? {
            None => Ok(None),
            Some((actual, payload)) if actual == kind => Ok(Some(payload)),
            Some((actual, _)) => Err(Error::decode(format!(
                "expected frame kind 0x{:02X}, got 0x{:02X}",
                kind, actual
            ))),
        }
    }

    /// Read the next header. `None` means the peer closed the stream cleanly.
    pub async fn read_header(&mut self) -> Result<Option<Header>> {
        match self.expect_frame(FRAME_HEADER).await? {
            Some(payload) => self.codec.decode(&payload).map(Some),
            None => Ok(None),
        }
    }

    /// Read the body frame without decoding it.
    pub async fn read_body_raw(&mut self) -> Result<Bytes> {
        self.expect_frame(FRAME_BODY).await?.ok_or_else(body_eof)
    }

    /// Read the body frame and decode it into `T`. The frame is consumed even
    /// when decoding fails.
    pub async fn read_body<T: DeserializeOwned>(&mut self) -> Result<T> {
        let payload = self.read_body_raw().await?;
        self.codec.decode(&payload)
    }

    /// Consume the body frame and drop it.
    pub async fn discard_body(&mut self) -> Result<()> {
        self.read_body_raw().await.map(drop)
    }
}

/// Write side of a connection's codec.
///
/// Each `write` buffers a header frame and a body frame and flushes once, so a
/// reader sees both or neither. Any failure shuts the stream down without
/// flushing what is left in the buffer.
pub struct CodecWriter<W: AsyncWrite> {
    writer: BufWriter<W>,
    codec: CodecType,
    closed: bool,
}

impl<W: AsyncWrite> fmt::Debug for CodecWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecWriter")
            .field("codec", &self.codec)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<W: AsyncWrite + Unpin> CodecWriter<W> {
    pub fn new(writer: W, codec: CodecType) -> Self {
        Self {
            writer: BufWriter::new(writer),
            codec,
            closed: false,
        }
    }

    pub fn codec_type(&self) -> CodecType {
        self.codec
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Encode `body` and write it with `header` as one frame pair.
    pub async fn write<B: Serialize>(&mut self, header: &Header, body: &B) -> Result<()> {
        if self.closed {
            return Err(Error::Shutdown);
        }
        match self.codec.encode(body) {
            Ok(body) => self.write_encoded(header, &body).await,
            Err(e) => {
                tracing::error!("rpc: error encoding body for seq {}: {}", header.seq, e);
                self.abort().await;
                Err(e)
            }
        }
    }

    /// Write `header` followed by an already encoded body.
    pub async fn write_encoded(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Shutdown);
        }
        let result = self.write_frames(header, body).await;
        if let Err(e) = &result {
            tracing::warn!("rpc: write of seq {} failed, closing stream: {}", header.seq, e);
            self.abort().await;
        }
        result
    }

    async fn write_frames(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header = self.codec.encode(header)?;
        write_frame(&mut self.writer, FRAME_HEADER, &header).await?;
        write_frame(&mut self.writer, FRAME_BODY, body).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut the stream down, discarding anything still buffered.
    async fn abort(&mut self) {
        self.closed = true;
        if let Err(e) = self.writer.get_mut().shutdown().await {
            tracing::debug!("rpc: shutdown after failed write: {}", e);
        }
    }

    /// Flush and shut down the stream. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.shutdown().await?;
        Ok(())
    }
}
