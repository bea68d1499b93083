//! Connection handshake.
//!
//! The client opens every connection with one options frame. It is always
//! JSON, independent of the codec it announces, so the server can parse it
//! before any codec exists.

use crate::rpc::codec::{read_frame, write_frame, CodecType, FRAME_OPTIONS};
use crate::types::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Protocol identifier every options frame must carry.
pub const MAGIC_NUMBER: u64 = 0x3bef5c;

/// Handshake record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Options {
    pub magic_number: u64,
    pub codec_type: CodecType,
}

impl Options {
    pub fn new(codec_type: CodecType) -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type,
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new(CodecType::default())
    }
}

/// Options as they arrive, before the codec tag is checked.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawOptions {
    magic_number: u64,
    codec_type: String,
}

/// Send the options frame and flush it.
pub async fn write_options<W: AsyncWrite + Unpin>(writer: &mut W, options: &Options) -> Result<()> {
    let payload = serde_json::to_vec(options).map_err(|e| Error::encode(e.to_string()))?;
    write_frame(writer, FRAME_OPTIONS, &payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and validate the options frame. The magic number is checked before
/// the codec tag.
pub async fn read_options<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> Result<Options> {
    let (kind, payload) = read_frame(reader, max_frame_bytes)
        .await?
        .ok_or_else(|| Error::handshake("connection closed before options"))?;
    if kind != FRAME_OPTIONS {
        return Err(Error::handshake(format!(
            "expected options frame, got kind 0x{:02X}",
            kind
        )));
    }

    let raw: RawOptions = serde_json::from_slice(&payload)
        .map_err(|e| Error::handshake(format!("options error: {}", e)))?;
    if raw.magic_number != MAGIC_NUMBER {
        return Err(Error::handshake(format!(
            "invalid magic number {:x}",
            raw.magic_number
        )));
    }
    let codec_type = raw.codec_type.parse()?;

    Ok(Options {
        magic_number: raw.magic_number,
        codec_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn wire_for(payload: &[u8]) -> Cursor<Vec<u8>> {
        let mut wire = Vec::new();
        write_frame(&mut wire, FRAME_OPTIONS, payload).await.unwrap();
        Cursor::new(wire)
    }

    #[tokio::test]
    async fn test_options_accepted() {
        let mut wire = Vec::new();
        write_options(&mut wire, &Options::new(CodecType::Json)).await.unwrap();

        let options = read_options(&mut Cursor::new(wire), 1024).await.unwrap();
        assert_eq!(options, Options::new(CodecType::Json));
    }

    #[tokio::test]
    async fn test_options_wire_format() {
        let mut wire = Vec::new();
        write_options(&mut wire, &Options::default()).await.unwrap();
        assert_eq!(wire[4], FRAME_OPTIONS);
        assert_eq!(
            &wire[5..],
            br#"{"MagicNumber":3927900,"CodecType":"application/msgpack"}"#
        );
    }

    #[tokio::test]
    async fn test_bad_magic_rejected() {
        let mut wire =
            wire_for(br#"{"MagicNumber":1,"CodecType":"application/json"}"#).await;
        let err = read_options(&mut wire, 1024).await.unwrap_err();
        assert!(err.to_string().contains("invalid magic number 1"));
    }

    #[tokio::test]
    async fn test_magic_checked_before_codec() {
        let mut wire = wire_for(br#"{"MagicNumber":2,"CodecType":"application/xml"}"#).await;
        let err = read_options(&mut wire, 1024).await.unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[tokio::test]
    async fn test_unknown_codec_rejected() {
        let mut wire =
            wire_for(br#"{"MagicNumber":3927900,"CodecType":"application/xml"}"#).await;
        let err = read_options(&mut wire, 1024).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(ref msg) if msg.contains("application/xml")));
    }

    #[tokio::test]
    async fn test_eof_before_options() {
        let err = read_options(&mut Cursor::new(Vec::new()), 1024).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }
}
