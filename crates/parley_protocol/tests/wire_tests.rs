use chrono::{TimeZone, Utc};
use parley_domain::{DisplayName, MessageId, UserId};
use parley_protocol::{CodecError, DEFAULT_MAX_FRAME_SIZE, InboundFrame, OutgoingMessage, decode_inbound, encode_outgoing};
use proptest::prelude::*;

fn sample_message() -> OutgoingMessage {
	OutgoingMessage {
		id: MessageId::new(1),
		user_id: UserId::new(7).expect("valid user id"),
		display_name: DisplayName::new("Alice").expect("valid display name"),
		content: "hi".to_string(),
		created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
	}
}

#[test]
fn outgoing_message_has_exact_wire_shape() {
	let json = encode_outgoing(&sample_message()).expect("encode");
	let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");

	let obj = value.as_object().expect("object");
	let mut keys = obj.keys().cloned().collect::<Vec<_>>();
	keys.sort();
	assert_eq!(keys, vec!["content", "createdAt", "displayName", "id", "userId"]);

	assert_eq!(value["id"], 1);
	assert_eq!(value["userId"], 7);
	assert_eq!(value["displayName"], "Alice");
	assert_eq!(value["content"], "hi");
	assert_eq!(value["createdAt"], "2024-05-01T12:00:00Z");
}

#[test]
fn outgoing_message_decodes_back_for_clients() {
	let msg = sample_message();
	let json = encode_outgoing(&msg).expect("encode");
	let decoded: OutgoingMessage = serde_json::from_str(&json).expect("decode");
	assert_eq!(decoded, msg);
}

#[test]
fn frame_at_exact_limit_is_accepted() {
	let prefix = r#"{"content":""#;
	let suffix = r#""}"#;
	let fill = 64 - prefix.len() - suffix.len();
	let body = format!("{prefix}{}{suffix}", "z".repeat(fill));
	assert_eq!(body.len(), 64);

	let frame = decode_inbound(body.as_bytes(), 64).expect("decode at limit");
	assert_eq!(frame.content.len(), fill);

	let over = format!("{prefix}{}{suffix}", "z".repeat(fill + 1));
	assert!(matches!(
		decode_inbound(over.as_bytes(), 64),
		Err(CodecError::FrameTooLarge { .. })
	));
}

#[test]
fn non_object_payload_is_malformed() {
	assert!(matches!(
		decode_inbound(b"\"just a string\"", DEFAULT_MAX_FRAME_SIZE),
		Err(CodecError::Decode(_))
	));
	assert!(matches!(
		decode_inbound(br#"{"content":5}"#, DEFAULT_MAX_FRAME_SIZE),
		Err(CodecError::Decode(_))
	));
}

proptest! {
	#[test]
	fn any_content_within_limit_survives_decoding(content in "\\PC{0,512}") {
		let body = serde_json::to_vec(&InboundFrame::new(content.clone())).unwrap();
		prop_assume!(body.len() <= DEFAULT_MAX_FRAME_SIZE);

		let frame = decode_inbound(&body, DEFAULT_MAX_FRAME_SIZE).unwrap();
		prop_assert_eq!(frame.is_empty(), content.is_empty());
		prop_assert_eq!(frame.content, content);
	}

	#[test]
	fn payloads_over_limit_are_always_rejected(extra in 1usize..256) {
		let max = 128usize;
		let body = vec![b' '; max + extra];
		let rejected = matches!(decode_inbound(&body, max), Err(CodecError::FrameTooLarge { .. }));
		prop_assert!(rejected);
	}
}
