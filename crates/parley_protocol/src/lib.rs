#![forbid(unsafe_code)]

pub mod framing;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, CodecError, decode_inbound, encode_outgoing};

use chrono::{DateTime, Utc};
use parley_domain::{DisplayName, MessageId, UserId};
use serde::{Deserialize, Serialize};

/// Client → server text frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFrame {
	#[serde(default)]
	pub content: String,
}

impl InboundFrame {
	pub fn new(content: impl Into<String>) -> Self {
		Self { content: content.into() }
	}

	/// Empty frames are ignored by the server.
	pub fn is_empty(&self) -> bool {
		self.content.is_empty()
	}
}

/// A persisted chat message as broadcast to every connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
	pub id: MessageId,
	pub user_id: UserId,
	pub display_name: DisplayName,
	pub content: String,
	pub created_at: DateTime<Utc>,
}

/// Protocol version constants.
pub mod version {
	/// Path clients connect to for the message stream.
	pub const WS_PATH: &str = "/ws";

	/// Query parameter carrying the bearer credential on the upgrade request.
	pub const TOKEN_QUERY_PARAM: &str = "token";
}
