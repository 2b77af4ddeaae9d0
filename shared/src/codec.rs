//! Binary frame codec
//!
//! Frame layout, all integers and floats big-endian:
//!
//! ```text
//! [u32 payload length][u32 record count][record]...
//! record = [i32 id][f64 x][f64 y][f64 delta]   (28 bytes)
//! ```
//!
//! Records are serialized with bincode configured for big-endian fixed-width
//! integers, which lays a [`ClientState`] out exactly as above.

use crate::ClientState;
use bincode::Options;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const LENGTH_PREFIX_LEN: usize = 4;
pub const RECORD_COUNT_LEN: usize = 4;
pub const RECORD_LEN: usize = 28;

/// Largest payload a reader accepts unless told otherwise (1 MiB).
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("payload of {len} bytes exceeds limit of {limit}")]
    PayloadTooLarge { len: usize, limit: usize },

    #[error("payload of {0} bytes is too short to hold a record count")]
    MissingRecordCount(usize),

    #[error("record count {declared} does not match a {payload_len} byte payload")]
    RecordCountMismatch { declared: u32, payload_len: usize },

    #[error("invalid client identifier {0}")]
    InvalidIdentifier(i32),

    #[error("expected a single-record update, got {0} records")]
    UnexpectedRecordCount(usize),

    #[error("record serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Whether the byte stream can no longer be trusted to be frame-aligned.
    ///
    /// Fatal errors end the connection. Everything else concerns the content
    /// of a frame that was read in full, so the next frame can still be read.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CodecError::Truncated { .. } | CodecError::PayloadTooLarge { .. } | CodecError::Io(_)
        )
    }
}

/// A decoded frame, distinguished by its record count.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Exactly one record: a client reporting its own state, or the server
    /// telling a newly joined client who it is.
    Update(ClientState),
    /// Any other count, including zero: a snapshot of every live client.
    Snapshot(Vec<ClientState>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Update(_) => 1,
            Frame::Snapshot(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_records(self) -> Vec<ClientState> {
        match self {
            Frame::Update(state) => vec![state],
            Frame::Snapshot(records) => records,
        }
    }
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
}

/// Encodes `states` as one length-prefixed frame.
pub fn encode_frame(states: &[ClientState]) -> Result<Vec<u8>, CodecError> {
    let payload_len = RECORD_COUNT_LEN + states.len() * RECORD_LEN;
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + payload_len);

    out.extend_from_slice(&(payload_len as u32).to_be_bytes());
    out.extend_from_slice(&(states.len() as u32).to_be_bytes());
    for state in states {
        wire_options().serialize_into(&mut out, state)?;
    }

    debug_assert_eq!(out.len(), LENGTH_PREFIX_LEN + payload_len);
    Ok(out)
}

/// Decodes a payload (everything after the length prefix).
///
/// A single record with a non-positive identifier is rejected with
/// [`CodecError::InvalidIdentifier`]. Inside a snapshot such records are
/// dropped and the rest are kept.
pub fn decode_payload(payload: &[u8]) -> Result<Frame, CodecError> {
    if payload.len() < RECORD_COUNT_LEN {
        return Err(CodecError::MissingRecordCount(payload.len()));
    }

    let declared = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let body = &payload[RECORD_COUNT_LEN..];

    let expected_body = (declared as usize).checked_mul(RECORD_LEN);
    if expected_body != Some(body.len()) {
        return Err(CodecError::RecordCountMismatch {
            declared,
            payload_len: payload.len(),
        });
    }

    let mut records = body
        .chunks_exact(RECORD_LEN)
        .map(|chunk| wire_options().deserialize::<ClientState>(chunk))
        .collect::<Result<Vec<_>, _>>()?;

    if records.len() == 1 {
        let state = records[0];
        if !state.has_valid_id() {
            return Err(CodecError::InvalidIdentifier(state.id));
        }
        return Ok(Frame::Update(state));
    }

    records.retain(ClientState::has_valid_id);
    Ok(Frame::Snapshot(records))
}

/// Decodes one complete frame from the start of `buf`.
///
/// Returns the frame and the number of bytes it occupied.
pub fn decode_frame(buf: &[u8]) -> Result<(Frame, usize), CodecError> {
    if buf.len() < LENGTH_PREFIX_LEN {
        return Err(CodecError::Truncated {
            expected: LENGTH_PREFIX_LEN,
            received: buf.len(),
        });
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let available = buf.len() - LENGTH_PREFIX_LEN;
    if available < len {
        return Err(CodecError::Truncated {
            expected: len,
            received: available,
        });
    }

    let frame = decode_payload(&buf[LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + len])?;
    Ok((frame, LENGTH_PREFIX_LEN + len))
}

/// Reads the next length prefix.
///
/// `Ok(None)` means the peer closed the stream cleanly before sending any byte
/// of a new frame. A prefix cut off part way is [`CodecError::Truncated`].
pub async fn read_length_prefix<R>(reader: &mut R) -> Result<Option<usize>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    let mut filled = 0;

    while filled < LENGTH_PREFIX_LEN {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(CodecError::Truncated {
                expected: LENGTH_PREFIX_LEN,
                received: filled,
            });
        }
        filled += n;
    }

    Ok(Some(u32::from_be_bytes(prefix) as usize))
}

/// Reads exactly `len` payload bytes. Short reads are never retried past
/// end-of-stream; they fail with [`CodecError::Truncated`].
pub async fn read_payload<R>(
    reader: &mut R,
    len: usize,
    limit: usize,
) -> Result<Vec<u8>, CodecError>
where
    R: AsyncRead + Unpin,
{
    if len > limit {
        return Err(CodecError::PayloadTooLarge { len, limit });
    }

    let mut payload = vec![0u8; len];
    let mut filled = 0;

    while filled < len {
        let n = reader.read(&mut payload[filled..]).await?;
        if n == 0 {
            return Err(CodecError::Truncated {
                expected: len,
                received: filled,
            });
        }
        filled += n;
    }

    Ok(payload)
}

/// Reads and decodes one frame, or `Ok(None)` on a clean end-of-stream.
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> Result<Option<Frame>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let Some(len) = read_length_prefix(reader).await? else {
        return Ok(None);
    };
    let payload = read_payload(reader, len, limit).await?;
    decode_payload(&payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn state(id: i32, x: f64, y: f64, delta: f64) -> ClientState {
        ClientState { id, x, y, delta }
    }

    #[test]
    fn test_record_layout_is_big_endian_fixed_width() {
        let bytes = encode_frame(&[state(1, 10.0, 5.0, 0.5)]).unwrap();

        assert_eq!(bytes.len(), LENGTH_PREFIX_LEN + RECORD_COUNT_LEN + RECORD_LEN);
        assert_eq!(&bytes[0..4], &32u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_be_bytes());
        assert_eq!(&bytes[8..12], &1i32.to_be_bytes());
        assert_eq!(&bytes[12..20], &10.0f64.to_be_bytes());
        assert_eq!(&bytes[20..28], &5.0f64.to_be_bytes());
        assert_eq!(&bytes[28..36], &0.5f64.to_be_bytes());
    }

    #[test]
    fn test_empty_snapshot_encoding() {
        let bytes = encode_frame(&[]).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 4, 0, 0, 0, 0]);

        let (frame, consumed) = decode_frame(&bytes).unwrap();
        assert_eq!(consumed, 8);
        assert_eq!(frame, Frame::Snapshot(vec![]));
        assert!(frame.is_empty());
    }

    #[test]
    fn test_single_record_decodes_as_update() {
        let original = state(7, -3.5, 1e9, 2.25);
        let bytes = encode_frame(&[original]).unwrap();

        let (frame, _) = decode_frame(&bytes).unwrap();
        assert_eq!(frame, Frame::Update(original));
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_records() {
        let originals: Vec<ClientState> = (1..=5)
            .map(|i| state(i, i as f64 * 1.5, 100.0 - i as f64, i as f64 / 10.0))
            .collect();
        let bytes = encode_frame(&originals).unwrap();

        let (frame, consumed) = decode_frame(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());

        assert_eq!(frame.into_records(), originals);
    }

    #[test]
    fn test_snapshot_roundtrip_keeps_negative_and_fractional_values() {
        let originals = vec![
            state(2, -0.125, 1e-9, 3.75),
            state(9, -1234.5678, -0.0001, 0.1),
            state(i32::MAX, f64::MAX, -f64::MAX, 1.0 / 3.0),
        ];
        let bytes = encode_frame(&originals).unwrap();

        let (frame, consumed) = decode_frame(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(frame, Frame::Snapshot(originals));
    }

    #[test]
    fn test_update_with_invalid_identifier_is_rejected() {
        let bytes = encode_frame(&[state(0, 1.0, 1.0, 0.0)]).unwrap();

        let err = decode_frame(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::InvalidIdentifier(0)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_snapshot_drops_invalid_records() {
        let bytes = encode_frame(&[
            state(1, 1.0, 1.0, 0.0),
            state(-2, 2.0, 2.0, 0.0),
            state(3, 3.0, 3.0, 0.0),
        ])
        .unwrap();

        let (frame, _) = decode_frame(&bytes).unwrap();
        let ids: Vec<i32> = frame.into_records().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_record_count_mismatch() {
        // Declares two records but carries one.
        let mut payload = 2u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0u8; RECORD_LEN]);

        let err = decode_payload(&payload).unwrap_err();
        assert!(matches!(
            err,
            CodecError::RecordCountMismatch {
                declared: 2,
                payload_len: 32
            }
        ));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_payload_without_record_count() {
        let err = decode_payload(&[0, 1]).unwrap_err();
        assert!(matches!(err, CodecError::MissingRecordCount(2)));
    }

    #[test]
    fn test_decode_frame_reports_truncation() {
        let bytes = encode_frame(&[state(1, 1.0, 1.0, 1.0)]).unwrap();

        let err = decode_frame(&bytes[..20]).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Truncated {
                expected: 32,
                received: 16
            }
        ));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_clean_end_of_stream() {
        let mut reader = Builder::new().build();
        let result = read_frame(&mut reader, MAX_PAYLOAD_LEN).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_short_payload_is_distinct_from_end_of_stream() {
        // Declares 20 payload bytes, sends 12, then closes.
        let mut bytes = 20u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 12]);
        let mut reader = Builder::new().read(&bytes).build();

        let err = read_frame(&mut reader, MAX_PAYLOAD_LEN).await.unwrap_err();
        assert!(matches!(
            err,
            CodecError::Truncated {
                expected: 20,
                received: 12
            }
        ));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_partial_length_prefix_is_truncation() {
        let mut reader = Builder::new().read(&[0, 0]).build();

        let err = read_length_prefix(&mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            CodecError::Truncated {
                expected: 4,
                received: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let bytes = encode_frame(&[state(2, 4.0, 8.0, 0.0), state(5, 1.0, 2.0, 3.0)]).unwrap();
        let (head, tail) = bytes.split_at(11);
        let mut reader = Builder::new().read(head).read(tail).build();

        let frame = read_frame(&mut reader, MAX_PAYLOAD_LEN)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_refused() {
        let bytes = 64u32.to_be_bytes();
        let mut reader = Builder::new().read(&bytes).build();

        let err = read_frame(&mut reader, 32).await.unwrap_err();
        assert!(matches!(err, CodecError::PayloadTooLarge { len: 64, limit: 32 }));
        assert!(err.is_fatal());
    }
}
