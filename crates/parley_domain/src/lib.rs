#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Errors for parsing identifiers from strings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "errors", derive(thiserror::Error))]
pub enum ParseIdError {
	#[cfg_attr(feature = "errors", error("empty value"))]
	Empty,
	#[cfg_attr(feature = "errors", error("invalid number: {0}"))]
	InvalidNumber(String),
	#[cfg_attr(feature = "errors", error("value out of range: {0}"))]
	OutOfRange(i64),
	#[cfg_attr(feature = "errors", error("value too long: len={len} max={max}"))]
	TooLong { len: usize, max: usize },
}

/// Store-assigned user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct UserId(i64);

impl UserId {
	/// Create a `UserId`; ids are strictly positive.
	pub fn new(id: i64) -> Result<Self, ParseIdError> {
		if id <= 0 {
			return Err(ParseIdError::OutOfRange(id));
		}
		Ok(Self(id))
	}

	pub const fn get(self) -> i64 {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		let n = s.parse::<i64>().map_err(|_| ParseIdError::InvalidNumber(s.to_string()))?;
		UserId::new(n)
	}
}

/// Store-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct MessageId(i64);

impl MessageId {
	pub const fn new(id: i64) -> Self {
		Self(id)
	}

	pub const fn get(self) -> i64 {
		self.0
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Process-local identifier of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
	pub const fn new(id: u64) -> Self {
		Self(id)
	}

	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Human-facing name shown next to a user's messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct DisplayName(String);

impl DisplayName {
	/// Upper bound on display name length, in bytes.
	pub const MAX_LEN: usize = 64;

	/// Create a non-empty display name (surrounding whitespace is trimmed).
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let trimmed = name.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.len() > Self::MAX_LEN {
			return Err(ParseIdError::TooLong {
				len: trimmed.len(),
				max: Self::MAX_LEN,
			});
		}
		if trimmed.len() == name.len() {
			Ok(Self(name))
		} else {
			Ok(Self(trimmed.to_string()))
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for DisplayName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for DisplayName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		DisplayName::new(s.to_string())
	}
}

/// Verified identity carried by a connection after authentication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Identity {
	pub user_id: UserId,
	pub display_name: DisplayName,
}

impl Identity {
	pub fn new(user_id: UserId, display_name: DisplayName) -> Self {
		Self { user_id, display_name }
	}
}

impl fmt::Display for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}#{}", self.display_name, self.user_id)
	}
}
