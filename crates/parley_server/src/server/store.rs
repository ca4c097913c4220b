#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use parley_domain::{DisplayName, MessageId, UserId};
use parley_protocol::OutgoingMessage;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use thiserror::Error;
use tokio::sync::Mutex;

/// Per-operation deadline for store calls.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("{op} timed out after {after:?}")]
	Timeout { op: &'static str, after: Duration },

	#[error("conflict: {0}")]
	Conflict(String),

	#[error("corrupt row: {0}")]
	Corrupt(String),

	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
}

/// Id and timestamp assigned to a message at insert time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredMessage {
	pub id: MessageId,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
	pub id: UserId,
	pub email: String,
	pub display_name: DisplayName,
	pub password_hash: String,
}

/// Durable storage for users and chat messages.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	/// Append a message; the store assigns its id and timestamp.
	async fn insert_message(&self, user_id: UserId, content: &str) -> Result<StoredMessage, StoreError>;

	/// Create a user; a duplicate email yields `StoreError::Conflict`.
	async fn create_user(
		&self,
		email: &str,
		display_name: &DisplayName,
		password_hash: &str,
	) -> Result<UserId, StoreError>;

	async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError>;

	async fn find_user_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError>;

	/// Most recent messages, newest first.
	async fn recent_messages(&self, limit: u32) -> Result<Vec<OutgoingMessage>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
	users: Vec<UserRecord>,
	messages: Vec<(StoredMessage, UserId, String)>,
}

/// Process-local store for tests and throwaway dev servers.
#[derive(Debug, Default)]
pub struct InMemoryStore {
	inner: Mutex<MemoryInner>,
}

impl InMemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl MessageStore for InMemoryStore {
	async fn insert_message(&self, user_id: UserId, content: &str) -> Result<StoredMessage, StoreError> {
		let mut guard = self.inner.lock().await;
		let stored = StoredMessage {
			id: MessageId::new(guard.messages.len() as i64 + 1),
			created_at: Utc::now(),
		};
		guard.messages.push((stored, user_id, content.to_string()));
		Ok(stored)
	}

	async fn create_user(
		&self,
		email: &str,
		display_name: &DisplayName,
		password_hash: &str,
	) -> Result<UserId, StoreError> {
		let mut guard = self.inner.lock().await;
		if guard.users.iter().any(|u| u.email == email) {
			return Err(StoreError::Conflict(format!("email already registered: {email}")));
		}

		let id = UserId::new(guard.users.len() as i64 + 1).map_err(|e| StoreError::Corrupt(e.to_string()))?;
		guard.users.push(UserRecord {
			id,
			email: email.to_string(),
			display_name: display_name.clone(),
			password_hash: password_hash.to_string(),
		});
		Ok(id)
	}

	async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
		let guard = self.inner.lock().await;
		Ok(guard.users.iter().find(|u| u.email == email).cloned())
	}

	async fn find_user_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
		let guard = self.inner.lock().await;
		Ok(guard.users.iter().find(|u| u.id == id).cloned())
	}

	async fn recent_messages(&self, limit: u32) -> Result<Vec<OutgoingMessage>, StoreError> {
		let guard = self.inner.lock().await;
		let out = guard
			.messages
			.iter()
			.rev()
			.filter_map(|(stored, user_id, content)| {
				let user = guard.users.iter().find(|u| u.id == *user_id)?;
				Some(OutgoingMessage {
					id: stored.id,
					user_id: *user_id,
					display_name: user.display_name.clone(),
					content: content.clone(),
					created_at: stored.created_at,
				})
			})
			.take(limit as usize)
			.collect();
		Ok(out)
	}
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

/// sqlx-backed store with a bounded pool and per-operation timeouts.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
	op_timeout: Duration,
}

type UserRow = (i64, String, String, String);
type MessageRow = (i64, i64, String, String, DateTime<Utc>);

impl SqlStore {
	pub async fn connect(database_url: &str, max_connections: u32, op_timeout: Duration) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			let pool = SqlitePoolOptions::new()
				.max_connections(max_connections)
				.acquire_timeout(op_timeout)
				.connect(database_url)
				.await
				.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			SqlBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.max_connections(max_connections)
				.acquire_timeout(op_timeout)
				.connect(database_url)
				.await
				.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			SqlBackend::Postgres(pool)
		} else {
			return Err(anyhow!("unsupported database_url (use sqlite:, postgres: or memory:)"));
		};

		Ok(Self { backend, op_timeout })
	}

	async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
	where
		F: Future<Output = Result<T, sqlx::Error>>,
	{
		match tokio::time::timeout(self.op_timeout, fut).await {
			Ok(Ok(v)) => Ok(v),
			Ok(Err(sqlx::Error::Database(db))) if db.is_unique_violation() => Err(StoreError::Conflict(db.to_string())),
			Ok(Err(e)) => Err(StoreError::Database(e)),
			Err(_) => Err(StoreError::Timeout {
				op,
				after: self.op_timeout,
			}),
		}
	}
}

fn user_from_row((id, email, display_name, password_hash): UserRow) -> Result<UserRecord, StoreError> {
	Ok(UserRecord {
		id: UserId::new(id).map_err(|e| StoreError::Corrupt(format!("users.id: {e}")))?,
		email,
		display_name: DisplayName::new(display_name).map_err(|e| StoreError::Corrupt(format!("users.display_name: {e}")))?,
		password_hash,
	})
}

fn message_from_row((id, user_id, display_name, content, created_at): MessageRow) -> Result<OutgoingMessage, StoreError> {
	Ok(OutgoingMessage {
		id: MessageId::new(id),
		user_id: UserId::new(user_id).map_err(|e| StoreError::Corrupt(format!("messages.user_id: {e}")))?,
		display_name: DisplayName::new(display_name).map_err(|e| StoreError::Corrupt(format!("users.display_name: {e}")))?,
		content,
		created_at,
	})
}

#[async_trait::async_trait]
impl MessageStore for SqlStore {
	async fn insert_message(&self, user_id: UserId, content: &str) -> Result<StoredMessage, StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let created_at = Utc::now();
				let (id,): (i64,) = self
					.timed(
						"insert message (sqlite)",
						sqlx::query_as("INSERT INTO messages (user_id, content, created_at) VALUES (?, ?, ?) RETURNING id")
							.bind(user_id.get())
							.bind(content)
							.bind(created_at)
							.fetch_one(pool),
					)
					.await?;
				Ok(StoredMessage {
					id: MessageId::new(id),
					created_at,
				})
			}
			SqlBackend::Postgres(pool) => {
				let (id, created_at): (i64, DateTime<Utc>) = self
					.timed(
						"insert message (postgres)",
						sqlx::query_as("INSERT INTO messages (user_id, content) VALUES ($1, $2) RETURNING id, created_at")
							.bind(user_id.get())
							.bind(content)
							.fetch_one(pool),
					)
					.await?;
				Ok(StoredMessage {
					id: MessageId::new(id),
					created_at,
				})
			}
		}
	}

	async fn create_user(
		&self,
		email: &str,
		display_name: &DisplayName,
		password_hash: &str,
	) -> Result<UserId, StoreError> {
		let (id,): (i64,) = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				self.timed(
					"insert user (sqlite)",
					sqlx::query_as("INSERT INTO users (email, display_name, password_hash) VALUES (?, ?, ?) RETURNING id")
						.bind(email)
						.bind(display_name.as_str())
						.bind(password_hash)
						.fetch_one(pool),
				)
				.await?
			}
			SqlBackend::Postgres(pool) => {
				self.timed(
					"insert user (postgres)",
					sqlx::query_as("INSERT INTO users (email, display_name, password_hash) VALUES ($1, $2, $3) RETURNING id")
						.bind(email)
						.bind(display_name.as_str())
						.bind(password_hash)
						.fetch_one(pool),
				)
				.await?
			}
		};

		UserId::new(id).map_err(|e| StoreError::Corrupt(format!("users.id: {e}")))
	}

	async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
		let row: Option<UserRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				self.timed(
					"select user by email (sqlite)",
					sqlx::query_as("SELECT id, email, display_name, password_hash FROM users WHERE email = ?")
						.bind(email)
						.fetch_optional(pool),
				)
				.await?
			}
			SqlBackend::Postgres(pool) => {
				self.timed(
					"select user by email (postgres)",
					sqlx::query_as("SELECT id, email, display_name, password_hash FROM users WHERE email = $1")
						.bind(email)
						.fetch_optional(pool),
				)
				.await?
			}
		};

		row.map(user_from_row).transpose()
	}

	async fn find_user_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
		let row: Option<UserRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				self.timed(
					"select user by id (sqlite)",
					sqlx::query_as("SELECT id, email, display_name, password_hash FROM users WHERE id = ?")
						.bind(id.get())
						.fetch_optional(pool),
				)
				.await?
			}
			SqlBackend::Postgres(pool) => {
				self.timed(
					"select user by id (postgres)",
					sqlx::query_as("SELECT id, email, display_name, password_hash FROM users WHERE id = $1")
						.bind(id.get())
						.fetch_optional(pool),
				)
				.await?
			}
		};

		row.map(user_from_row).transpose()
	}

	async fn recent_messages(&self, limit: u32) -> Result<Vec<OutgoingMessage>, StoreError> {
		let rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				self.timed(
					"select recent messages (sqlite)",
					sqlx::query_as(
						"SELECT m.id, m.user_id, u.display_name, m.content, m.created_at \
						FROM messages m JOIN users u ON u.id = m.user_id \
						ORDER BY m.created_at DESC, m.id DESC LIMIT ?",
					)
					.bind(i64::from(limit))
					.fetch_all(pool),
				)
				.await?
			}
			SqlBackend::Postgres(pool) => {
				self.timed(
					"select recent messages (postgres)",
					sqlx::query_as(
						"SELECT m.id, m.user_id, u.display_name, m.content, m.created_at \
						FROM messages m JOIN users u ON u.id = m.user_id \
						ORDER BY m.created_at DESC, m.id DESC LIMIT $1",
					)
					.bind(i64::from(limit))
					.fetch_all(pool),
				)
				.await?
			}
		};

		rows.into_iter().map(message_from_row).collect()
	}
}
