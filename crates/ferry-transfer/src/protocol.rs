/// Wire format for ferry transfers.
///
/// One message per datagram, space-delimited ASCII tokens, no length prefix:
///
/// ```text
/// C→S  DOWNLOAD <filename>
/// S→C  OK <filename> SIZE <u64> PORT <u16>
/// S→C  ERR <filename> NOT_FOUND|INVALID
/// C→S  FILE <filename> GET START <u64> END <u64>
/// S→C  FILE <filename> OK START <u64> END <u64> DATA <base64>
/// C→S  FILE <filename> CLOSE
/// S→C  FILE <filename> CLOSE_OK
/// ```
///
/// Byte ranges are inclusive. The base64 payload is always the single last
/// token, so a decoder never has to rejoin tokens.
use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use crate::error::{ProtocolError, TransferError};

/// Maximum bytes carried by one chunk.
pub const CHUNK_SIZE: u64 = 1000;

/// Largest datagram either side will send or accept.
pub const MAX_DATAGRAM: usize = 65535;

/// Longest filename the codec will put on the wire.
pub const MAX_FILENAME_LEN: usize = 1024;

/// Default ephemeral data-port range.
pub const DATA_PORT_MIN: u16 = 50000;
pub const DATA_PORT_MAX: u16 = 51000;

/// Reason carried by an `ERR` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    Invalid,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Invalid => "INVALID",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "NOT_FOUND" => Some(ErrorCode::NotFound),
            "INVALID" => Some(ErrorCode::Invalid),
            _ => None,
        }
    }
}

/// Inclusive byte range `[start, end]` within one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered. A range with `start > end` reports 1.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    /// Check `start <= end < file_size`.
    pub fn validate(&self, file_size: u64) -> Result<(), TransferError> {
        if self.start > self.end || self.end >= file_size {
            return Err(TransferError::OutOfRange {
                start: self.start,
                end: self.end,
                size: file_size,
            });
        }
        Ok(())
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Iterate the chunk ranges that exactly tile `[0, file_size - 1]`.
///
/// Yields nothing for an empty file.
pub fn chunk_ranges(file_size: u64) -> impl Iterator<Item = ChunkRange> {
    (0..file_size)
        .step_by(CHUNK_SIZE as usize)
        .map(move |start| ChunkRange::new(start, (start + CHUNK_SIZE - 1).min(file_size - 1)))
}

/// Number of chunk requests a file of `file_size` bytes needs.
pub fn chunk_count(file_size: u64) -> u64 {
    file_size.div_ceil(CHUNK_SIZE)
}

/// Check that a filename can travel as a single token.
pub fn validate_filename(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty()
        || name.len() > MAX_FILENAME_LEN
        || name.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(ProtocolError::InvalidFilename(name.to_string()));
    }
    Ok(())
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Download { filename: String },
    DownloadOk { filename: String, size: u64, port: u16 },
    DownloadErr { filename: String, code: ErrorCode },
    ChunkGet { filename: String, range: ChunkRange },
    ChunkData { filename: String, range: ChunkRange, payload: Vec<u8> },
    Close { filename: String },
    CloseOk { filename: String },
}

impl Message {
    pub fn filename(&self) -> &str {
        match self {
            Message::Download { filename }
            | Message::DownloadOk { filename, .. }
            | Message::DownloadErr { filename, .. }
            | Message::ChunkGet { filename, .. }
            | Message::ChunkData { filename, .. }
            | Message::Close { filename }
            | Message::CloseOk { filename } => filename,
        }
    }

    /// Short name of the message kind, for logs.
    pub fn verb(&self) -> &'static str {
        match self {
            Message::Download { .. } => "DOWNLOAD",
            Message::DownloadOk { .. } => "OK",
            Message::DownloadErr { .. } => "ERR",
            Message::ChunkGet { .. } => "GET",
            Message::ChunkData { .. } => "DATA",
            Message::Close { .. } => "CLOSE",
            Message::CloseOk { .. } => "CLOSE_OK",
        }
    }

    /// Serialize to datagram bytes.
    pub fn encode(&self) -> Vec<u8> {
        let line = match self {
            Message::Download { filename } => format!("DOWNLOAD {filename}"),
            Message::DownloadOk { filename, size, port } => {
                format!("OK {filename} SIZE {size} PORT {port}")
            }
            Message::DownloadErr { filename, code } => {
                format!("ERR {filename} {}", code.as_str())
            }
            Message::ChunkGet { filename, range } => {
                format!("FILE {filename} GET START {} END {}", range.start, range.end)
            }
            Message::ChunkData { filename, range, payload } => format!(
                "FILE {filename} OK START {} END {} DATA {}",
                range.start,
                range.end,
                BASE64.encode(payload)
            ),
            Message::Close { filename } => format!("FILE {filename} CLOSE"),
            Message::CloseOk { filename } => format!("FILE {filename} CLOSE_OK"),
        };
        line.into_bytes()
    }

    /// Parse datagram bytes.
    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        if datagram.len() > MAX_DATAGRAM {
            return Err(ProtocolError::malformed("datagram too large"));
        }
        let text = std::str::from_utf8(datagram)
            .map_err(|_| ProtocolError::malformed("datagram is not valid UTF-8"))?;
        let tokens: Vec<&str> = text.split_ascii_whitespace().collect();

        let msg = match tokens.as_slice() {
            ["DOWNLOAD", name] => Message::Download {
                filename: name.to_string(),
            },
            ["OK", name, "SIZE", size, "PORT", port] => Message::DownloadOk {
                filename: name.to_string(),
                size: parse_u64("SIZE", size)?,
                port: parse_port(port)?,
            },
            ["ERR", name, code] => Message::DownloadErr {
                filename: name.to_string(),
                code: ErrorCode::parse(code)
                    .ok_or_else(|| ProtocolError::malformed(format!("unknown error code {code}")))?,
            },
            ["FILE", name, "GET", "START", start, "END", end] => Message::ChunkGet {
                filename: name.to_string(),
                range: ChunkRange::new(parse_u64("START", start)?, parse_u64("END", end)?),
            },
            ["FILE", name, "OK", "START", start, "END", end, "DATA", data] => {
                let range = ChunkRange::new(parse_u64("START", start)?, parse_u64("END", end)?);
                let payload = BASE64
                    .decode(data)
                    .map_err(|e| ProtocolError::malformed(format!("bad DATA: {e}")))?;
                if range.start > range.end || payload.len() as u64 != range.len() {
                    return Err(ProtocolError::malformed(format!(
                        "DATA carries {} bytes for range {range}",
                        payload.len()
                    )));
                }
                Message::ChunkData {
                    filename: name.to_string(),
                    range,
                    payload,
                }
            }
            ["FILE", name, "CLOSE"] => Message::Close {
                filename: name.to_string(),
            },
            ["FILE", name, "CLOSE_OK"] => Message::CloseOk {
                filename: name.to_string(),
            },
            [] => return Err(ProtocolError::malformed("empty datagram")),
            [verb, rest @ ..] => {
                return Err(ProtocolError::malformed(format!(
                    "unrecognised {verb} message with {} tokens",
                    rest.len() + 1
                )));
            }
        };
        Ok(msg)
    }
}

fn parse_u64(field: &str, token: &str) -> Result<u64, ProtocolError> {
    token
        .parse()
        .map_err(|_| ProtocolError::malformed(format!("{field} is not a number: {token}")))
}

fn parse_port(token: &str) -> Result<u16, ProtocolError> {
    match token.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ProtocolError::malformed(format!("bad PORT: {token}"))),
    }
}
