#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use parley_domain::{DisplayName, Identity, UserId};
use parley_protocol::OutgoingMessage;

use crate::server::store::{InMemoryStore, MessageStore, StoreError, StoredMessage, UserRecord};

/// Enable log output in tests when `PARLEY_TEST_LOG` is set (value is an `EnvFilter`).
pub fn init_test_logging() {
	static INIT: Once = Once::new();
	INIT.call_once(|| {
		if let Ok(filter) = std::env::var("PARLEY_TEST_LOG") {
			let _ = tracing_subscriber::fmt()
				.with_env_filter(tracing_subscriber::EnvFilter::new(filter))
				.with_test_writer()
				.try_init();
		}
	});
}

pub fn identity(id: i64, name: &str) -> Identity {
	Identity::new(
		UserId::new(id).expect("valid user id"),
		DisplayName::new(name).expect("valid display name"),
	)
}

/// In-memory store whose message inserts can be switched to fail.
#[derive(Debug, Default)]
pub struct FlakyStore {
	inner: InMemoryStore,
	fail_inserts: AtomicBool,
	inserts: AtomicUsize,
}

impl FlakyStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn set_failing(&self, failing: bool) {
		self.fail_inserts.store(failing, Ordering::SeqCst);
	}

	/// Number of successful message inserts.
	pub fn inserts(&self) -> usize {
		self.inserts.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl MessageStore for FlakyStore {
	async fn insert_message(&self, user_id: UserId, content: &str) -> Result<StoredMessage, StoreError> {
		if self.fail_inserts.load(Ordering::SeqCst) {
			return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
		}
		let stored = self.inner.insert_message(user_id, content).await?;
		self.inserts.fetch_add(1, Ordering::SeqCst);
		Ok(stored)
	}

	async fn create_user(
		&self,
		email: &str,
		display_name: &DisplayName,
		password_hash: &str,
	) -> Result<UserId, StoreError> {
		self.inner.create_user(email, display_name, password_hash).await
	}

	async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
		self.inner.find_user_by_email(email).await
	}

	async fn find_user_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
		self.inner.find_user_by_id(id).await
	}

	async fn recent_messages(&self, limit: u32) -> Result<Vec<OutgoingMessage>, StoreError> {
		self.inner.recent_messages(limit).await
	}
}
