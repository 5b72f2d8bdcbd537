//! Wire frames and their codec.
//!
//! Every frame is `tag: u8 | len: u32 (big endian) | payload`. Integers are
//! big endian, strings are a `u32` length followed by UTF-8, optional values
//! carry a one-byte presence flag. A frame with an unknown tag or a payload
//! that does not parse is surfaced as a [`FrameRejection`] rather than a codec
//! error: the length prefix keeps the stream aligned, so the connection can
//! answer with an `Error` frame and carry on.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::SyncError;
use crate::sync::hash::{Checksum, CHECKSUM_LEN};
use crate::sync::index::FileEntry;
use crate::sync::watcher::ChangeKind;

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest payload either side will accept.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Init = 1,
    Ack = 2,
    ChangeNotify = 3,
    DataBegin = 4,
    DataChunk = 5,
    DataEnd = 6,
    Error = 7,
    IndexEntry = 8,
    IndexEnd = 9,
    Request = 10,
}

impl FrameType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::Init,
            2 => Self::Ack,
            3 => Self::ChangeNotify,
            4 => Self::DataBegin,
            5 => Self::DataChunk,
            6 => Self::DataEnd,
            7 => Self::Error,
            8 => Self::IndexEntry,
            9 => Self::IndexEnd,
            10 => Self::Request,
            _ => return None,
        })
    }
}

/// Reason codes carried by `Error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UnknownFrame,
    Malformed,
    OutOfOrder,
    ChecksumMismatch,
    SizeMismatch,
    WriteFailed,
    NotFound,
    ReadFailed,
    VersionMismatch,
    Unexpected,
    InvalidPath,
    Other(u16),
}

impl ErrorCode {
    pub fn to_u16(self) -> u16 {
        match self {
            Self::UnknownFrame => 1,
            Self::Malformed => 2,
            Self::OutOfOrder => 3,
            Self::ChecksumMismatch => 4,
            Self::SizeMismatch => 5,
            Self::WriteFailed => 6,
            Self::NotFound => 7,
            Self::ReadFailed => 8,
            Self::VersionMismatch => 9,
            Self::Unexpected => 10,
            Self::InvalidPath => 11,
            Self::Other(code) => code,
        }
    }

    pub fn from_u16(code: u16) -> Self {
        match code {
            1 => Self::UnknownFrame,
            2 => Self::Malformed,
            3 => Self::OutOfOrder,
            4 => Self::ChecksumMismatch,
            5 => Self::SizeMismatch,
            6 => Self::WriteFailed,
            7 => Self::NotFound,
            8 => Self::ReadFailed,
            9 => Self::VersionMismatch,
            10 => Self::Unexpected,
            11 => Self::InvalidPath,
            other => Self::Other(other),
        }
    }

    /// Codes a sender uses about its own outgoing transfer (as opposed to
    /// complaints about a transfer it received).
    pub fn is_sender_side(self) -> bool {
        matches!(self, Self::NotFound | Self::ReadFailed)
    }

    /// The code to answer a failed receive with.
    pub fn for_error(err: &SyncError) -> Self {
        match err {
            SyncError::ChecksumMismatch { .. } => Self::ChecksumMismatch,
            SyncError::IncompleteTransfer { .. } => Self::SizeMismatch,
            SyncError::File { .. } => Self::WriteFailed,
            SyncError::Vanished { .. } => Self::NotFound,
            SyncError::UnknownFrame(_) => Self::UnknownFrame,
            SyncError::VersionMismatch { .. } => Self::VersionMismatch,
            SyncError::Protocol(_) => Self::Malformed,
            _ => Self::Unexpected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Init {
        protocol_version: u32,
        /// `[last acknowledged upload seq, last applied download seq]`
        /// from the sender's point of view.
        resume_seq: [u64; 2],
        /// General exclude patterns the agent applies to its own tree.
        excludes: Vec<String>,
    },
    Ack {
        seq: u64,
    },
    ChangeNotify {
        path: String,
        kind: ChangeKind,
        /// Present for `Created` and `Modified`.
        entry: Option<FileEntry>,
    },
    DataBegin {
        seq: u64,
        path: String,
        total_size: u64,
        mod_time: i64,
    },
    DataChunk {
        seq: u64,
        index: u32,
        data: Bytes,
    },
    DataEnd {
        seq: u64,
        chunk_count: u32,
        checksum: Checksum,
    },
    Error {
        code: ErrorCode,
        /// Transfer the error refers to, if any.
        seq: Option<u64>,
        path: Option<String>,
        message: String,
    },
    IndexEntry {
        entry: FileEntry,
    },
    IndexEnd {
        count: u64,
    },
    Request {
        path: String,
    },
}

impl TransportFrame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Init { .. } => FrameType::Init,
            Self::Ack { .. } => FrameType::Ack,
            Self::ChangeNotify { .. } => FrameType::ChangeNotify,
            Self::DataBegin { .. } => FrameType::DataBegin,
            Self::DataChunk { .. } => FrameType::DataChunk,
            Self::DataEnd { .. } => FrameType::DataEnd,
            Self::Error { .. } => FrameType::Error,
            Self::IndexEntry { .. } => FrameType::IndexEntry,
            Self::IndexEnd { .. } => FrameType::IndexEnd,
            Self::Request { .. } => FrameType::Request,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            seq: None,
            path: None,
            message: message.into(),
        }
    }

    pub fn transfer_error(code: ErrorCode, seq: u64, path: Option<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            seq: Some(seq),
            path,
            message: message.into(),
        }
    }

    /// Approximate number of bytes this frame occupies on the wire; what the
    /// bandwidth throttle charges for it.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN
            + match self {
                Self::DataChunk { data, .. } => 16 + data.len(),
                Self::ChangeNotify { path, .. }
                | Self::DataBegin { path, .. }
                | Self::Request { path } => 32 + path.len(),
                Self::IndexEntry { entry } => 32 + entry.path.len(),
                Self::Error { message, .. } => 32 + message.len(),
                _ => 32,
            }
    }
}

/// A frame the peer sent that could not be understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRejection {
    pub tag: u8,
    pub reason: String,
}

impl FrameRejection {
    /// The `Error` frame to answer this rejection with.
    pub fn reply(&self) -> TransportFrame {
        let code = match FrameType::from_tag(self.tag) {
            Some(_) => ErrorCode::Malformed,
            None => ErrorCode::UnknownFrame,
        };
        TransportFrame::error(code, format!("rejected frame tag {}: {}", self.tag, self.reason))
    }
}

pub type Decoded = Result<TransportFrame, FrameRejection>;

/// Length-prefixed frame codec for `FramedRead` / `FramedWrite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = SyncError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(SyncError::Transport(format!(
                "frame tag {} announces {} bytes, limit is {}",
                tag, len, MAX_PAYLOAD
            )));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();

        Ok(Some(decode_payload(tag, payload)))
    }
}

impl Encoder<TransportFrame> for FrameCodec {
    type Error = SyncError;

    fn encode(&mut self, frame: TransportFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.put_u8(frame.frame_type() as u8);
        dst.put_u32(0);

        match &frame {
            TransportFrame::Init {
                protocol_version,
                resume_seq,
                excludes,
            } => {
                dst.put_u32(*protocol_version);
                dst.put_u64(resume_seq[0]);
                dst.put_u64(resume_seq[1]);
                dst.put_u32(excludes.len() as u32);
                for pattern in excludes {
                    put_string(dst, pattern);
                }
            }
            TransportFrame::Ack { seq } => dst.put_u64(*seq),
            TransportFrame::ChangeNotify { path, kind, entry } => {
                put_string(dst, path);
                dst.put_u8(kind.to_u8());
                match entry {
                    Some(entry) => {
                        dst.put_u8(1);
                        put_entry(dst, entry);
                    }
                    None => dst.put_u8(0),
                }
            }
            TransportFrame::DataBegin {
                seq,
                path,
                total_size,
                mod_time,
            } => {
                dst.put_u64(*seq);
                put_string(dst, path);
                dst.put_u64(*total_size);
                dst.put_i64(*mod_time);
            }
            TransportFrame::DataChunk { seq, index, data } => {
                dst.put_u64(*seq);
                dst.put_u32(*index);
                dst.put_u32(data.len() as u32);
                dst.put_slice(data);
            }
            TransportFrame::DataEnd {
                seq,
                chunk_count,
                checksum,
            } => {
                dst.put_u64(*seq);
                dst.put_u32(*chunk_count);
                dst.put_slice(checksum);
            }
            TransportFrame::Error {
                code,
                seq,
                path,
                message,
            } => {
                dst.put_u16(code.to_u16());
                match seq {
                    Some(seq) => {
                        dst.put_u8(1);
                        dst.put_u64(*seq);
                    }
                    None => dst.put_u8(0),
                }
                match path {
                    Some(path) => {
                        dst.put_u8(1);
                        put_string(dst, path);
                    }
                    None => dst.put_u8(0),
                }
                put_string(dst, message);
            }
            TransportFrame::IndexEntry { entry } => put_entry(dst, entry),
            TransportFrame::IndexEnd { count } => dst.put_u64(*count),
            TransportFrame::Request { path } => put_string(dst, path),
        }

        let payload_len = dst.len() - start - HEADER_LEN;
        if payload_len > MAX_PAYLOAD {
            dst.truncate(start);
            return Err(SyncError::Protocol(format!(
                "refusing to encode {:?} frame of {} bytes",
                frame.frame_type(),
                payload_len
            )));
        }
        dst[start + 1..start + HEADER_LEN].copy_from_slice(&(payload_len as u32).to_be_bytes());
        Ok(())
    }
}

fn put_string(dst: &mut BytesMut, value: &str) {
    dst.put_u32(value.len() as u32);
    dst.put_slice(value.as_bytes());
}

fn put_entry(dst: &mut BytesMut, entry: &FileEntry) {
    put_string(dst, &entry.path);
    dst.put_u64(entry.size);
    dst.put_i64(entry.mod_time);
    let mut flags = 0u8;
    if entry.is_dir {
        flags |= 0b01;
    }
    if entry.is_symlink {
        flags |= 0b10;
    }
    dst.put_u8(flags);
}

/// Bounds-checked reader over one payload.
struct Payload {
    buf: Bytes,
}

impl Payload {
    fn need(&self, n: usize) -> Result<(), String> {
        if self.buf.remaining() < n {
            Err(format!("truncated payload: need {} more bytes, have {}", n, self.buf.remaining()))
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8, String> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, String> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32, String> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64, String> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn i64(&mut self) -> Result<i64, String> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn bytes(&mut self, len: usize) -> Result<Bytes, String> {
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self) -> Result<String, String> {
        let len = self.u32()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| format!("invalid UTF-8: {}", e))
    }

    fn flag(&mut self) -> Result<bool, String> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(format!("invalid presence flag {}", other)),
        }
    }

    fn entry(&mut self) -> Result<FileEntry, String> {
        let path = self.string()?;
        let size = self.u64()?;
        let mod_time = self.i64()?;
        let flags = self.u8()?;
        Ok(FileEntry {
            path,
            size,
            mod_time,
            is_dir: flags & 0b01 != 0,
            is_symlink: flags & 0b10 != 0,
        })
    }

    fn finish(&self) -> Result<(), String> {
        if self.buf.has_remaining() {
            Err(format!("{} trailing bytes", self.buf.remaining()))
        } else {
            Ok(())
        }
    }
}

fn decode_payload(tag: u8, payload: Bytes) -> Decoded {
    let reject = |reason: String| FrameRejection { tag, reason };

    let Some(frame_type) = FrameType::from_tag(tag) else {
        return Err(reject("unknown frame type".to_string()));
    };

    let mut p = Payload { buf: payload };
    let frame = parse(frame_type, &mut p).and_then(|frame| p.finish().map(|_| frame));
    frame.map_err(reject)
}

fn parse(frame_type: FrameType, p: &mut Payload) -> Result<TransportFrame, String> {
    Ok(match frame_type {
        FrameType::Init => {
            let protocol_version = p.u32()?;
            let resume_seq = [p.u64()?, p.u64()?];
            let count = p.u32()? as usize;
            let mut excludes = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                excludes.push(p.string()?);
            }
            TransportFrame::Init {
                protocol_version,
                resume_seq,
                excludes,
            }
        }
        FrameType::Ack => TransportFrame::Ack { seq: p.u64()? },
        FrameType::ChangeNotify => {
            let path = p.string()?;
            let kind = ChangeKind::from_u8(p.u8()?).ok_or("invalid change kind")?;
            let entry = if p.flag()? { Some(p.entry()?) } else { None };
            TransportFrame::ChangeNotify { path, kind, entry }
        }
        FrameType::DataBegin => TransportFrame::DataBegin {
            seq: p.u64()?,
            path: p.string()?,
            total_size: p.u64()?,
            mod_time: p.i64()?,
        },
        FrameType::DataChunk => {
            let seq = p.u64()?;
            let index = p.u32()?;
            let len = p.u32()? as usize;
            let data = p.bytes(len)?;
            TransportFrame::DataChunk { seq, index, data }
        }
        FrameType::DataEnd => {
            let seq = p.u64()?;
            let chunk_count = p.u32()?;
            let raw = p.bytes(CHECKSUM_LEN)?;
            let mut checksum = [0u8; CHECKSUM_LEN];
            checksum.copy_from_slice(&raw);
            TransportFrame::DataEnd {
                seq,
                chunk_count,
                checksum,
            }
        }
        FrameType::Error => {
            let code = ErrorCode::from_u16(p.u16()?);
            let seq = if p.flag()? { Some(p.u64()?) } else { None };
            let path = if p.flag()? { Some(p.string()?) } else { None };
            let message = p.string()?;
            TransportFrame::Error {
                code,
                seq,
                path,
                message,
            }
        }
        FrameType::IndexEntry => TransportFrame::IndexEntry { entry: p.entry()? },
        FrameType::IndexEnd => TransportFrame::IndexEnd { count: p.u64()? },
        FrameType::Request => TransportFrame::Request { path: p.string()? },
    })
}
