use std::fmt;

use serde_json::Value;

pub const FRAME_HEADER_SIZE_BYTES: usize = 4;
pub const DEFAULT_MAX_FRAME_SIZE_BYTES: usize = 1024 * 1024;

#[derive(Debug)]
pub enum CodecError {
    PayloadTooLarge { size: usize, limit: usize },
    ProtocolZeroLength,
    ProtocolLengthTooLarge { length: usize, limit: usize },
    JsonEncode(serde_json::Error),
    JsonDecode(serde_json::Error),
    EnvelopeMustBeObject,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::ProtocolZeroLength => {
                write!(f, "protocol error: frame length cannot be zero")
            }
            Self::ProtocolLengthTooLarge { length, limit } => write!(
                f,
                "protocol error: frame length {length} exceeds max {limit}"
            ),
            Self::JsonEncode(source) => write!(f, "json encode error: {source}"),
            Self::JsonDecode(source) => write!(f, "json decode error: {source}"),
            Self::EnvelopeMustBeObject => write!(f, "message envelope must be a JSON object"),
        }
    }
}

impl std::error::Error for CodecError {}

pub fn encode_frame(envelope: &Value, max_frame_size: usize) -> Result<Vec<u8>, CodecError> {
    if !envelope.is_object() {
        return Err(CodecError::EnvelopeMustBeObject);
    }

    let payload = serde_json::to_vec(envelope).map_err(CodecError::JsonEncode)?;
    if payload.len() > max_frame_size {
        return Err(CodecError::PayloadTooLarge {
            size: payload.len(),
            limit: max_frame_size,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
    let len = payload.len() as u32;
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub fn decode_payload(payload: &[u8]) -> Result<Value, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::ProtocolZeroLength);
    }

    let value: Value = serde_json::from_slice(payload).map_err(CodecError::JsonDecode)?;
    if !value.is_object() {
        return Err(CodecError::EnvelopeMustBeObject);
    }

    Ok(value)
}

/// Reassembles length-prefixed frames from the byte chunks a nonblocking
/// socket hands over. Bytes are buffered until a full header plus payload is
/// available, then the payload is carved out and the remainder kept for the
/// next frame.
pub struct FrameAccumulator {
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl FrameAccumulator {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next complete payload, `None` when more bytes are needed.
    /// A zero-length or oversized declared length is unrecoverable for the
    /// connection; the caller is expected to drop it.
    pub fn next_payload(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        if self.buffer.len() < FRAME_HEADER_SIZE_BYTES {
            return Ok(None);
        }

        let declared_len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if declared_len == 0 {
            return Err(CodecError::ProtocolZeroLength);
        }
        if declared_len > self.max_frame_size {
            return Err(CodecError::ProtocolLengthTooLarge {
                length: declared_len,
                limit: self.max_frame_size,
            });
        }

        let frame_len = FRAME_HEADER_SIZE_BYTES + declared_len;
        if self.buffer.len() < frame_len {
            return Ok(None);
        }

        let payload = self.buffer[FRAME_HEADER_SIZE_BYTES..frame_len].to_vec();
        self.buffer.drain(..frame_len);
        Ok(Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        decode_payload, encode_frame, CodecError, FrameAccumulator,
        DEFAULT_MAX_FRAME_SIZE_BYTES, FRAME_HEADER_SIZE_BYTES,
    };

    #[test]
    fn round_trip_frame_encode_decode() {
        let envelope = json!({"type": "ping", "request_id": "r-1"});
        let frame =
            encode_frame(&envelope, DEFAULT_MAX_FRAME_SIZE_BYTES).expect("frame should encode");

        let mut accumulator = FrameAccumulator::new(DEFAULT_MAX_FRAME_SIZE_BYTES);
        accumulator.push_bytes(&frame);
        let payload = accumulator
            .next_payload()
            .expect("header should be valid")
            .expect("payload should be complete");
        let decoded = decode_payload(&payload).expect("payload should decode");

        assert_eq!(decoded, envelope);
    }

    #[test]
    fn rejects_non_object_envelope_on_encode() {
        let error = encode_frame(&json!(["not", "an", "object"]), DEFAULT_MAX_FRAME_SIZE_BYTES)
            .expect_err("array should be rejected");
        assert!(matches!(error, CodecError::EnvelopeMustBeObject));
    }

    #[test]
    fn rejects_payload_larger_than_limit_on_encode() {
        let envelope = json!({"text": "a".repeat(64)});
        let error = encode_frame(&envelope, 16).expect_err("oversized payload should fail");
        assert!(matches!(error, CodecError::PayloadTooLarge { .. }));
    }

    #[test]
    fn rejects_non_json_payload_on_decode() {
        let error = decode_payload(b"not json at all").expect_err("garbage should fail");
        assert!(matches!(error, CodecError::JsonDecode(_)));
    }

    #[test]
    fn rejects_non_object_payload_on_decode() {
        let error = decode_payload(b"[1,2,3]").expect_err("array should fail");
        assert!(matches!(error, CodecError::EnvelopeMustBeObject));
    }

    #[test]
    fn accumulator_waits_for_full_header() {
        let mut accumulator = FrameAccumulator::new(DEFAULT_MAX_FRAME_SIZE_BYTES);
        accumulator.push_bytes(&[0, 0]);

        let result = accumulator.next_payload().expect("partial header is fine");
        assert!(result.is_none());
    }

    #[test]
    fn accumulator_reassembles_frame_split_across_chunks() {
        let envelope = json!({"type": "stats"});
        let frame =
            encode_frame(&envelope, DEFAULT_MAX_FRAME_SIZE_BYTES).expect("frame should encode");
        let split_at = FRAME_HEADER_SIZE_BYTES + 3;

        let mut accumulator = FrameAccumulator::new(DEFAULT_MAX_FRAME_SIZE_BYTES);
        accumulator.push_bytes(&frame[..split_at]);
        assert!(accumulator
            .next_payload()
            .expect("partial frame is fine")
            .is_none());

        accumulator.push_bytes(&frame[split_at..]);
        let payload = accumulator
            .next_payload()
            .expect("header should be valid")
            .expect("payload should now be complete");
        assert_eq!(decode_payload(&payload).expect("payload should decode"), envelope);
    }

    #[test]
    fn accumulator_yields_back_to_back_frames_in_order() {
        let first = encode_frame(&json!({"seq": 1}), DEFAULT_MAX_FRAME_SIZE_BYTES)
            .expect("first frame should encode");
        let second = encode_frame(&json!({"seq": 2}), DEFAULT_MAX_FRAME_SIZE_BYTES)
            .expect("second frame should encode");

        let mut accumulator = FrameAccumulator::new(DEFAULT_MAX_FRAME_SIZE_BYTES);
        accumulator.push_bytes(&first);
        accumulator.push_bytes(&second);

        let one = accumulator
            .next_payload()
            .expect("header should be valid")
            .expect("first payload should be complete");
        let two = accumulator
            .next_payload()
            .expect("header should be valid")
            .expect("second payload should be complete");

        assert_eq!(decode_payload(&one).expect("payload should decode")["seq"], 1);
        assert_eq!(decode_payload(&two).expect("payload should decode")["seq"], 2);
        assert!(accumulator.next_payload().expect("empty buffer is fine").is_none());
    }

    #[test]
    fn accumulator_rejects_zero_length_frame() {
        let mut accumulator = FrameAccumulator::new(DEFAULT_MAX_FRAME_SIZE_BYTES);
        accumulator.push_bytes(&[0, 0, 0, 0]);

        let error = accumulator
            .next_payload()
            .expect_err("zero-length frame should fail");
        assert!(matches!(error, CodecError::ProtocolZeroLength));
    }

    #[test]
    fn accumulator_rejects_frame_larger_than_limit() {
        let mut accumulator = FrameAccumulator::new(64);
        accumulator.push_bytes(&65_u32.to_be_bytes());

        let error = accumulator
            .next_payload()
            .expect_err("oversized frame should fail");
        assert!(matches!(error, CodecError::ProtocolLengthTooLarge { .. }));
    }
}
