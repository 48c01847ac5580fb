//! Collector wire protocol
//!
//! Every message is one length-prefixed frame:
//!
//! ```text
//! 0       4        5         6        7       8            12          16
//! +-------+--------+---------+--------+-------+------------+-----------+---------+
//! | "TLMF"| version| frame   | signal | flags | payload len| crc32     | payload |
//! |       |  (1)   | type    | kind   |  (0)  | u32 BE     | u32 BE    | bincode |
//! +-------+--------+---------+--------+-------+------------+-----------+---------+
//! ```
//!
//! The exporter sends one `ExportRequest` frame per batch and waits for one
//! `ExportResponse` frame. The request carries the [`Resource`] once, followed
//! by the batch's records. Payloads are `bincode`; the CRC-32 covers the
//! payload only.

use crate::signal::{Resource, SignalKind, SignalRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MAGIC: [u8; 4] = *b"TLMF";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 16;
/// Largest payload accepted in either direction (16 MiB).
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Errors produced while encoding or decoding frames
#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),
    #[error("unknown signal kind {0}")]
    UnknownSignalKind(u8),
    #[error("frame payload of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("checksum mismatch: header says {expected:#010x}, payload hashes to {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("expected {expected:?} frame, got {actual:?}")]
    UnexpectedFrame { expected: FrameType, actual: FrameType },
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    ExportRequest,
    ExportResponse,
}

impl FrameType {
    fn to_wire(self) -> u8 {
        match self {
            Self::ExportRequest => 1,
            Self::ExportResponse => 2,
        }
    }

    fn from_wire(byte: u8) -> Result<Self, WireError> {
        match byte {
            1 => Ok(Self::ExportRequest),
            2 => Ok(Self::ExportResponse),
            other => Err(WireError::UnknownFrameType(other)),
        }
    }
}

/// Decoded fixed-size frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub kind: SignalKind,
    pub flags: u8,
    pub payload_len: usize,
    pub checksum: u32,
}

impl FrameHeader {
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Result<Self, WireError> {
        let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic != MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        if bytes[4] != VERSION {
            return Err(WireError::UnsupportedVersion(bytes[4]));
        }
        let frame_type = FrameType::from_wire(bytes[5])?;
        let kind = SignalKind::from_wire(bytes[6]).ok_or(WireError::UnknownSignalKind(bytes[6]))?;
        let payload_len = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(WireError::FrameTooLarge(payload_len));
        }
        let checksum = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);

        Ok(Self {
            frame_type,
            kind,
            flags: bytes[7],
            payload_len,
            checksum,
        })
    }
}

/// A validated frame: header checks and checksum have passed.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub kind: SignalKind,
    pub payload: Vec<u8>,
}

impl Frame {
    fn expect(&self, expected: FrameType) -> Result<(), WireError> {
        if self.frame_type == expected {
            Ok(())
        } else {
            Err(WireError::UnexpectedFrame {
                expected,
                actual: self.frame_type,
            })
        }
    }

    pub fn into_request(self) -> Result<ExportRequest, WireError> {
        self.expect(FrameType::ExportRequest)?;
        bincode::deserialize(&self.payload).map_err(|e| WireError::Decode(e.to_string()))
    }

    pub fn into_response(self) -> Result<ExportResponse, WireError> {
        self.expect(FrameType::ExportResponse)?;
        bincode::deserialize(&self.payload).map_err(|e| WireError::Decode(e.to_string()))
    }
}

/// Borrowing twin of [`ExportRequest`]; encodes identically without cloning the batch.
#[derive(Serialize)]
struct ExportRequestRef<'a> {
    resource: &'a Resource,
    kind: SignalKind,
    auth_token: Option<&'a str>,
    records: &'a [SignalRecord],
}

/// One batch as received by a collector
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExportRequest {
    pub resource: Resource,
    pub kind: SignalKind,
    pub auth_token: Option<String>,
    pub records: Vec<SignalRecord>,
}

/// Collector verdict on one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// Batch stored
    Accepted,
    /// Collector overloaded or restarting; try again later
    Retryable,
    /// Batch malformed; retrying will not help
    Rejected,
    /// Credentials missing or wrong
    Unauthenticated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportResponse {
    pub status: ResponseStatus,
    /// Records the collector accepted
    pub accepted: u32,
    pub message: String,
}

impl ExportResponse {
    pub fn accepted(count: usize) -> Self {
        Self {
            status: ResponseStatus::Accepted,
            accepted: count as u32,
            message: String::new(),
        }
    }

    pub fn refused(status: ResponseStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            accepted: 0,
            message: message.into(),
        }
    }
}

fn encode_frame(frame_type: FrameType, kind: SignalKind, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(WireError::FrameTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&MAGIC);
    frame.push(VERSION);
    frame.push(frame_type.to_wire());
    frame.push(kind.to_wire());
    frame.push(0);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Encodes a complete request frame for one batch.
pub fn encode_request(
    resource: &Resource,
    kind: SignalKind,
    auth_token: Option<&str>,
    records: &[SignalRecord],
) -> Result<Vec<u8>, WireError> {
    let payload = bincode::serialize(&ExportRequestRef {
        resource,
        kind,
        auth_token,
        records,
    })
    .map_err(|e| WireError::Encode(e.to_string()))?;
    encode_frame(FrameType::ExportRequest, kind, &payload)
}

/// Encodes a complete response frame.
pub fn encode_response(kind: SignalKind, response: &ExportResponse) -> Result<Vec<u8>, WireError> {
    let payload = bincode::serialize(response).map_err(|e| WireError::Encode(e.to_string()))?;
    encode_frame(FrameType::ExportResponse, kind, &payload)
}

fn verify(header: FrameHeader, payload: Vec<u8>) -> Result<Frame, WireError> {
    let actual = crc32fast::hash(&payload);
    if actual != header.checksum {
        return Err(WireError::ChecksumMismatch {
            expected: header.checksum,
            actual,
        });
    }
    Ok(Frame {
        frame_type: header.frame_type,
        kind: header.kind,
        payload,
    })
}

/// Decodes one frame from the start of `bytes`, returning it and the bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), WireError> {
    let header_bytes: &[u8; HEADER_LEN] = bytes
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or(WireError::Truncated {
            needed: HEADER_LEN,
            available: bytes.len(),
        })?;
    let header = FrameHeader::decode(header_bytes)?;

    let total = HEADER_LEN + header.payload_len;
    let payload = bytes.get(HEADER_LEN..total).ok_or(WireError::Truncated {
        needed: total,
        available: bytes.len(),
    })?;
    Ok((verify(header, payload.to_vec())?, total))
}

/// Reads exactly one frame from an async stream.
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Frame, WireError> {
    let mut header_bytes = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::decode(&header_bytes)?;

    let mut payload = vec![0u8; header.payload_len];
    reader.read_exact(&mut payload).await?;
    verify(header, payload)
}
