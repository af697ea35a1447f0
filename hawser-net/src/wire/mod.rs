//! Wire format for framed channel traffic.
//!
//! Frame format: `[length:4][checksum:4][kind:1][payload:N]`
//!
//! - **length**: Total frame size including header (little-endian u32)
//! - **checksum**: CRC32C of (kind + payload) for integrity verification
//! - **kind**: Frame discriminator, see [`FrameKind`]
//! - **payload**: Application bytes for data frames, encoded control
//!   messages otherwise
//!
//! Both lanes of a channel pair speak this format. Control frames share the
//! connection with data frames so that ordering between a handshake and the
//! traffic behind it is the connection's own ordering.

use thiserror::Error;

/// Header size: 4 (length) + 4 (checksum) + 1 (kind) = 9 bytes.
pub const HEADER_SIZE: usize = 9;

/// Wire-level limits.
///
/// Carried by the registry config and passed down to the channel tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireConfig {
    /// Largest accepted frame, header included. Frames over this limit are
    /// rejected on encode and treated as corruption on decode.
    pub max_frame_len: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_frame_len: 4 * 1024 * 1024,
        }
    }
}

/// Wire format error types.
#[derive(Debug, Clone, Error)]
pub enum WireError {
    /// Not enough data to parse the frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Checksum verification failed, the frame was corrupted in flight.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum from the header.
        expected: u32,
        /// Computed checksum over the received bytes.
        actual: u32,
    },

    /// Frame exceeds the configured maximum size.
    #[error("frame too large: {length} bytes (max {max})")]
    FrameTooLarge {
        /// Total frame length.
        length: usize,
        /// Configured limit.
        max: usize,
    },

    /// Length field is smaller than the header itself.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The bad length value from the header.
        length: u32,
    },
}

/// Frame discriminator byte.
///
/// `Data` frames carry application payloads. The rest are registry control
/// traffic: the identification handshake and the close protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Application payload.
    Data = 0,
    /// Identification handshake (sent by the dialing side, echoed back).
    Disambiguate = 1,
    /// Liveness check answering a stale close request.
    CheckActive = 2,
    /// Request to close this channel.
    CloseRequest = 3,
    /// Close confirmation.
    Closed = 4,
}

impl FrameKind {
    /// Map a wire byte back to a kind. Unknown bytes return `None`; the
    /// receiver skips such frames rather than tearing the channel down, so
    /// new control kinds can be rolled out one node at a time.
    pub fn from_byte(byte: u8) -> Option<FrameKind> {
        match byte {
            0 => Some(FrameKind::Data),
            1 => Some(FrameKind::Disambiguate),
            2 => Some(FrameKind::CheckActive),
            3 => Some(FrameKind::CloseRequest),
            4 => Some(FrameKind::Closed),
            _ => None,
        }
    }
}

/// A decoded frame, kind byte left raw so the caller decides how to treat
/// unknown kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Frame discriminator byte as received.
    pub kind: u8,
    /// Frame payload.
    pub payload: Vec<u8>,
    /// Bytes consumed from the input buffer.
    pub consumed: usize,
}

/// Fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame size including header.
    pub length: u32,
    /// CRC32C of (kind + payload).
    pub checksum: u32,
    /// Frame discriminator byte.
    pub kind: u8,
}

impl FrameHeader {
    /// Serialize header into a buffer of at least `HEADER_SIZE` bytes.
    pub fn serialize_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8] = self.kind;
    }

    /// Deserialize a header from a buffer.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientData` if the buffer is shorter than
    /// `HEADER_SIZE`.
    pub fn deserialize(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::InsufficientData {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }
        Ok(Self {
            length: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            checksum: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            kind: buf[8],
        })
    }
}

/// Compute CRC32C over the kind byte followed by the payload.
fn compute_checksum(kind: u8, payload: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(&[kind]), payload)
}

/// Encode a frame.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the encoded frame would exceed
/// `config.max_frame_len`.
pub fn encode_frame(
    kind: FrameKind,
    payload: &[u8],
    config: WireConfig,
) -> Result<Vec<u8>, WireError> {
    let total_length = HEADER_SIZE + payload.len();
    if total_length > config.max_frame_len {
        return Err(WireError::FrameTooLarge {
            length: total_length,
            max: config.max_frame_len,
        });
    }

    let kind = kind as u8;
    let header = FrameHeader {
        length: total_length as u32,
        checksum: compute_checksum(kind, payload),
        kind,
    };

    let mut data = vec![0u8; total_length];
    header.serialize_into(&mut data[..HEADER_SIZE]);
    data[HEADER_SIZE..].copy_from_slice(payload);
    Ok(data)
}

/// Try to decode one frame from a buffer that may hold partial data.
///
/// # Returns
///
/// - `Ok(Some(frame))` if a complete frame was parsed
/// - `Ok(None)` if more data is needed (not an error)
/// - `Err` if the data is malformed; the channel should be torn down
pub fn try_decode_frame(data: &[u8], config: WireConfig) -> Result<Option<RawFrame>, WireError> {
    if data.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header = FrameHeader::deserialize(data)?;
    if header.length < HEADER_SIZE as u32 {
        return Err(WireError::InvalidLength {
            length: header.length,
        });
    }

    let total_length = header.length as usize;
    if total_length > config.max_frame_len {
        return Err(WireError::FrameTooLarge {
            length: total_length,
            max: config.max_frame_len,
        });
    }
    if data.len() < total_length {
        return Ok(None);
    }

    let payload = &data[HEADER_SIZE..total_length];
    let computed = compute_checksum(header.kind, payload);
    if computed != header.checksum {
        return Err(WireError::ChecksumMismatch {
            expected: header.checksum,
            actual: computed,
        });
    }

    Ok(Some(RawFrame {
        kind: header.kind,
        payload: payload.to_vec(),
        consumed: total_length,
    }))
}
