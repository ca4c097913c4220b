#![forbid(unsafe_code)]

use thiserror::Error;

use crate::{InboundFrame, OutgoingMessage};

/// Default maximum inbound frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024; // 4 KiB

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("json decode error: {0}")]
	Decode(#[source] serde_json::Error),

	#[error("json encode error: {0}")]
	Encode(#[source] serde_json::Error),
}

/// Decode one client frame, enforcing `max_frame_size` before parsing.
pub fn decode_inbound(src: &[u8], max_frame_size: usize) -> Result<InboundFrame, CodecError> {
	if src.len() > max_frame_size {
		return Err(CodecError::FrameTooLarge {
			len: src.len(),
			max: max_frame_size,
		});
	}

	serde_json::from_slice(src).map_err(CodecError::Decode)
}

/// Encode a broadcast message as a JSON text payload.
pub fn encode_outgoing(msg: &OutgoingMessage) -> Result<String, CodecError> {
	serde_json::to_string(msg).map_err(CodecError::Encode)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decodes_content_and_ignores_unknown_fields() {
		let frame = decode_inbound(br#"{"content":"hi","extra":1}"#, DEFAULT_MAX_FRAME_SIZE).expect("decode");
		assert_eq!(frame.content, "hi");
		assert!(!frame.is_empty());
	}

	#[test]
	fn missing_content_is_empty() {
		let frame = decode_inbound(b"{}", DEFAULT_MAX_FRAME_SIZE).expect("decode");
		assert!(frame.is_empty());
	}

	#[test]
	fn rejects_malformed_json() {
		let err = decode_inbound(b"{\"content\":", DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		assert!(matches!(err, CodecError::Decode(_)), "unexpected error: {err:?}");
	}

	#[test]
	fn rejects_oversized_frame_before_parsing() {
		let body = format!(r#"{{"content":"{}"}}"#, "a".repeat(64));
		let err = decode_inbound(body.as_bytes(), 32).unwrap_err();
		match err {
			CodecError::FrameTooLarge { len, max } => {
				assert_eq!(len, body.len());
				assert_eq!(max, 32);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}
}
