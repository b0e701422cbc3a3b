//! # WebSocket Framing
//!
//! The subset of RFC 6455 framing used by the capture client: unfragmented
//! frames, client-to-server masking, and the three payload length encodings.
//!
//! ## Header layout:
//! - byte 0: `FIN | opcode`
//! - byte 1: `MASK | len7` where `len7` is the length, or 126 / 127 markers
//! - 126 → 16-bit big-endian length follows; 127 → 64-bit big-endian length
//! - 4-byte mask key when `MASK` is set
//!
//! ## Memory:
//! [`write_frame`] never copies the payload; it masks through a fixed
//! [`MASK_CHUNK_BYTES`] scratch buffer, so sending costs O(chunk) memory
//! regardless of payload size.

use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

pub const MASK_CHUNK_BYTES: usize = 256;

/// Largest possible header: 2 + 8 (length) + 4 (mask).
pub const MAX_HEADER_BYTES: usize = 14;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn is_control(&self) -> bool {
        (*self as u8) & 0x8 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask_key: Option<[u8; 4]>,
    /// Unmasked payload
    pub payload: Vec<u8>,
}

impl WireFrame {
    /// Close code carried in the first two payload bytes, if any.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode == Opcode::Close && self.payload.len() >= 2 {
            Some(BigEndian::read_u16(&self.payload[..2]))
        } else {
            None
        }
    }
}

/// Write a FIN frame header into `out`, returning the header length.
pub fn encode_header(
    opcode: Opcode,
    payload_len: usize,
    mask_key: Option<[u8; 4]>,
    out: &mut [u8; MAX_HEADER_BYTES],
) -> usize {
    let mask_bit = if mask_key.is_some() { MASK_BIT } else { 0 };
    out[0] = FIN_BIT | opcode as u8;

    let mut n = 2;
    if payload_len < 126 {
        out[1] = mask_bit | payload_len as u8;
    } else if payload_len < 65536 {
        out[1] = mask_bit | 126;
        BigEndian::write_u16(&mut out[2..4], payload_len as u16);
        n = 4;
    } else {
        out[1] = mask_bit | 127;
        BigEndian::write_u64(&mut out[2..10], payload_len as u64);
        n = 10;
    }

    if let Some(key) = mask_key {
        out[n..n + 4].copy_from_slice(&key);
        n += 4;
    }
    n
}

/// XOR `data` with the mask key, where `data[0]` is payload byte `offset`.
pub fn apply_mask(data: &mut [u8], key: [u8; 4], offset: usize) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[(offset + i) & 3];
    }
}

/// Write one masked FIN frame, masking in [`MASK_CHUNK_BYTES`] pieces.
pub async fn write_frame<W>(
    writer: &mut W,
    opcode: Opcode,
    payload: &[u8],
    mask_key: [u8; 4],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; MAX_HEADER_BYTES];
    let n = encode_header(opcode, payload.len(), Some(mask_key), &mut header);
    writer.write_all(&header[..n]).await?;

    let mut scratch = [0u8; MASK_CHUNK_BYTES];
    for (i, piece) in payload.chunks(MASK_CHUNK_BYTES).enumerate() {
        let out = &mut scratch[..piece.len()];
        out.copy_from_slice(piece);
        apply_mask(out, mask_key, i * MASK_CHUNK_BYTES);
        writer.write_all(out).await?;
    }
    writer.flush().await
}

/// Encode a complete frame into a new buffer.
pub fn encode_frame(opcode: Opcode, payload: &[u8], mask_key: Option<[u8; 4]>) -> Vec<u8> {
    let mut header = [0u8; MAX_HEADER_BYTES];
    let n = encode_header(opcode, payload.len(), mask_key, &mut header);

    let mut out = Vec::with_capacity(n + payload.len());
    out.extend_from_slice(&header[..n]);
    let start = out.len();
    out.extend_from_slice(payload);
    if let Some(key) = mask_key {
        apply_mask(&mut out[start..], key, 0);
    }
    out
}

/// Parse one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame, otherwise
/// the frame (unmasked) and the number of bytes it occupied.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(WireFrame, usize)>, TransportError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & FIN_BIT != 0;
    if buf[0] & 0x70 != 0 {
        return Err(TransportError::Protocol("reserved bits set".into()));
    }
    let opcode = Opcode::from_u8(buf[0] & 0x0F)
        .ok_or_else(|| TransportError::Protocol(format!("unknown opcode {:#x}", buf[0] & 0x0F)))?;

    let masked = buf[1] & MASK_BIT != 0;
    let (len, mut pos) = match buf[1] & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (BigEndian::read_u16(&buf[2..4]) as u64, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            (BigEndian::read_u64(&buf[2..10]), 10)
        }
        n => (n as u64, 2),
    };

    let mask_key = if masked {
        if buf.len() < pos + 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[pos..pos + 4]);
        pos += 4;
        Some(key)
    } else {
        None
    };

    let len = usize::try_from(len)
        .map_err(|_| TransportError::Protocol("frame length exceeds address space".into()))?;
    if buf.len() - pos < len {
        return Ok(None);
    }

    let mut payload = buf[pos..pos + len].to_vec();
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key, 0);
    }

    Ok(Some((
        WireFrame {
            fin,
            opcode,
            mask_key,
            payload,
        },
        pos + len,
    )))
}

/// Read one frame from a stream, rejecting payloads above `max_payload`.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<WireFrame, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await.map_err(link_down)?;

    if head[0] & 0x70 != 0 {
        return Err(TransportError::Protocol("reserved bits set".into()));
    }
    let fin = head[0] & FIN_BIT != 0;
    let opcode = Opcode::from_u8(head[0] & 0x0F)
        .ok_or_else(|| TransportError::Protocol(format!("unknown opcode {:#x}", head[0] & 0x0F)))?;

    let len = match head[1] & 0x7F {
        126 => reader.read_u16().await.map_err(link_down)? as u64,
        127 => reader.read_u64().await.map_err(link_down)?,
        n => n as u64,
    };
    if len > max_payload as u64 {
        return Err(TransportError::Protocol(format!(
            "frame of {len} bytes exceeds limit of {max_payload}"
        )));
    }

    let mask_key = if head[1] & MASK_BIT != 0 {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key).await.map_err(link_down)?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(link_down)?;
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key, 0);
    }

    Ok(WireFrame {
        fin,
        opcode,
        mask_key,
        payload,
    })
}

fn link_down(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::LinkDown("peer closed the connection".into())
    } else {
        TransportError::Io(e)
    }
}
