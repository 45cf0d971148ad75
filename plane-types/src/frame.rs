//! Length-prefixed framing for shareplane records.
//!
//! Each record is one frame: a 4-byte big-endian body length followed by the
//! body. The first body byte is a tag selecting the body encoding:
//!
//! | Tag    | Body                                                        |
//! |--------|-------------------------------------------------------------|
//! | `0x01` | MessagePack-encoded [`Record`]                              |
//! | `0x02` | Compact [`ObjectUpdate`]: action `u8`, id length `u16`, id bytes, `x y width height` as `f64` |
//!
//! Because every frame carries its own length, a body that fails to decode
//! never disturbs the boundaries of the frames after it.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Action, ObjectUpdate, Record, WireError};

/// Maximum frame body size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Body tag for MessagePack records.
pub const TAG_RECORD: u8 = 0x01;

/// Body tag for compact object updates.
pub const TAG_OBJECT_UPDATE: u8 = 0x02;

/// Fixed part of a compact update: tag, action, id length, four coordinates.
const COMPACT_HEADER_LEN: usize = 1 + 1 + 2;
const COMPACT_COORDS_LEN: usize = 4 * 8;

/// How record bodies are encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Everything as MessagePack.
    MessagePack,
    /// [`ObjectUpdate`] in the compact binary layout, everything else as
    /// MessagePack.
    #[default]
    Compact,
}

/// Encode a record body (tag + payload), without the length prefix.
pub fn encode_body(record: &Record, encoding: Encoding) -> Result<Vec<u8>, WireError> {
    match (encoding, record) {
        (Encoding::Compact, Record::ObjectUpdate(update)) => encode_compact(update),
        _ => {
            let payload = rmp_serde::to_vec_named(record).map_err(WireError::Serialization)?;
            let mut body = Vec::with_capacity(1 + payload.len());
            body.push(TAG_RECORD);
            body.extend_from_slice(&payload);
            Ok(body)
        }
    }
}

/// Decode a record body produced by [`encode_body`].
pub fn decode_body(body: &[u8]) -> Result<Record, WireError> {
    let (&tag, payload) = body.split_first().ok_or(WireError::EmptyFrame)?;
    match tag {
        TAG_RECORD => rmp_serde::from_slice(payload).map_err(WireError::Deserialization),
        TAG_OBJECT_UPDATE => decode_compact(body).map(Record::ObjectUpdate),
        other => Err(WireError::UnknownTag(other)),
    }
}

/// Encode a full frame (length prefix + body).
pub fn encode_frame(record: &Record, encoding: Encoding) -> Result<Vec<u8>, WireError> {
    let body = encode_body(record, encoding)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: body.len(),
            limit: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn encode_compact(update: &ObjectUpdate) -> Result<Vec<u8>, WireError> {
    let id = update.id.as_bytes();
    let id_len = u16::try_from(id.len()).map_err(|_| WireError::IdTooLong(id.len()))?;

    let mut body = Vec::with_capacity(COMPACT_HEADER_LEN + id.len() + COMPACT_COORDS_LEN);
    body.push(TAG_OBJECT_UPDATE);
    body.push(update.action as u8);
    body.extend_from_slice(&id_len.to_be_bytes());
    body.extend_from_slice(id);
    for value in [update.x, update.y, update.width, update.height] {
        body.extend_from_slice(&value.to_be_bytes());
    }
    Ok(body)
}

fn decode_compact(body: &[u8]) -> Result<ObjectUpdate, WireError> {
    if body.len() < COMPACT_HEADER_LEN {
        return Err(WireError::Truncated {
            expected: COMPACT_HEADER_LEN,
            actual: body.len(),
        });
    }

    let action = Action::try_from(body[1])?;
    let id_len = u16::from_be_bytes([body[2], body[3]]) as usize;
    let expected = COMPACT_HEADER_LEN + id_len + COMPACT_COORDS_LEN;
    if body.len() < expected {
        return Err(WireError::Truncated {
            expected,
            actual: body.len(),
        });
    }
    if body.len() > expected {
        return Err(WireError::TrailingBytes(body.len() - expected));
    }

    let id_end = COMPACT_HEADER_LEN + id_len;
    let id = std::str::from_utf8(&body[COMPACT_HEADER_LEN..id_end])
        .map_err(|_| WireError::InvalidUtf8)?
        .to_string();

    let mut coords = [0f64; 4];
    for (i, chunk) in body[id_end..].chunks_exact(8).enumerate() {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        coords[i] = f64::from_be_bytes(raw);
    }

    Ok(ObjectUpdate {
        id,
        x: coords[0],
        y: coords[1],
        width: coords[2],
        height: coords[3],
        action,
    })
}

/// Result of reading one frame from a stream.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete frame body.
    Frame(Vec<u8>),
    /// A frame whose declared length exceeded the limit. Its body has been
    /// drained so the stream is positioned at the next frame.
    Oversized {
        /// Declared body length.
        len: usize,
    },
    /// The stream ended cleanly on a frame boundary.
    Eof,
}

/// Read one length-prefixed frame.
///
/// Uses `read_exact`, so a frame split across any number of underlying
/// reads is reassembled intact. EOF in the middle of a frame is an error.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> std::io::Result<ReadOutcome>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(ReadOutcome::Eof),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        let drained = tokio::io::copy(&mut reader.take(len as u64), &mut tokio::io::sink()).await?;
        if drained < len as u64 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        return Ok(ReadOutcome::Oversized { len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(ReadOutcome::Frame(body))
}

/// Write one pre-encoded frame and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}
