#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parley_domain::{ConnectionId, DisplayName, Identity, UserId};
use parley_protocol::OutgoingMessage;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::server::store::{MessageStore, StoreError};

/// Configuration for `Hub`.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Capacity of the control loop's event channel.
	pub event_capacity: usize,

	pub debug_logs: bool,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			event_capacity: 128,
			debug_logs: false,
		}
	}
}

#[derive(Debug, Error)]
pub enum HubError {
	#[error("hub is not running")]
	Closed,

	#[error("persist failed: {0}")]
	Store(#[from] StoreError),
}

enum HubEvent {
	Register {
		conn_id: ConnectionId,
		identity: Identity,
		queue: mpsc::Sender<OutgoingMessage>,
	},
	Unregister {
		conn_id: ConnectionId,
	},
	Broadcast {
		user_id: UserId,
		display_name: DisplayName,
		content: String,
		reply: oneshot::Sender<Result<OutgoingMessage, HubError>>,
	},
	MemberCount {
		reply: oneshot::Sender<usize>,
	},
	Shutdown,
}

/// Handle to the broadcast hub.
///
/// Membership lives inside a single control task; every handle only sends
/// events to it, so register, unregister and broadcast are applied one at a
/// time in arrival order.
#[derive(Clone)]
pub struct Hub {
	tx: mpsc::Sender<HubEvent>,
}

impl std::fmt::Debug for Hub {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Hub").field("closed", &self.tx.is_closed()).finish()
	}
}

impl Hub {
	/// Spawn the control loop and return a handle to it.
	pub fn start(store: Arc<dyn MessageStore>, cfg: HubConfig) -> Self {
		let (tx, rx) = mpsc::channel(cfg.event_capacity.max(1));
		let control = ControlLoop {
			store,
			members: HashMap::new(),
			debug_logs: cfg.debug_logs,
		};
		tokio::spawn(control.run(rx));
		Self { tx }
	}

	/// Add a connection's outbound queue to the membership set.
	///
	/// The returned guard unregisters the connection when released or dropped.
	pub async fn register(
		&self,
		conn_id: ConnectionId,
		identity: Identity,
		queue: mpsc::Sender<OutgoingMessage>,
	) -> Result<Registration, HubError> {
		self.tx
			.send(HubEvent::Register {
				conn_id,
				identity,
				queue,
			})
			.await
			.map_err(|_| HubError::Closed)?;

		Ok(Registration {
			tx: self.tx.clone(),
			conn_id,
			released: false,
		})
	}

	/// Remove a connection and close its outbound queue. Unknown ids are ignored.
	pub async fn unregister(&self, conn_id: ConnectionId) -> Result<(), HubError> {
		self.tx
			.send(HubEvent::Unregister { conn_id })
			.await
			.map_err(|_| HubError::Closed)
	}

	/// Persist a message and, only once stored, fan it out to every member.
	///
	/// Resolves after the message has been handed to every member's queue.
	pub async fn persist_and_broadcast(
		&self,
		user_id: UserId,
		display_name: DisplayName,
		content: String,
	) -> Result<OutgoingMessage, HubError> {
		let (reply, rx) = oneshot::channel();
		self.tx
			.send(HubEvent::Broadcast {
				user_id,
				display_name,
				content,
				reply,
			})
			.await
			.map_err(|_| HubError::Closed)?;

		rx.await.map_err(|_| HubError::Closed)?
	}

	pub async fn member_count(&self) -> Result<usize, HubError> {
		let (reply, rx) = oneshot::channel();
		self.tx
			.send(HubEvent::MemberCount { reply })
			.await
			.map_err(|_| HubError::Closed)?;
		rx.await.map_err(|_| HubError::Closed)
	}

	/// Stop the control loop and close every member queue.
	///
	/// Waits until the loop has exited.
	pub async fn shutdown(&self) {
		if self.tx.send(HubEvent::Shutdown).await.is_ok() {
			self.tx.closed().await;
		}
	}

	/// True once the control loop has exited.
	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

/// Membership held by one connection.
///
/// Unregisters exactly once: either via `release` or, failing that, on drop.
#[derive(Debug)]
pub struct Registration {
	tx: mpsc::Sender<HubEvent>,
	conn_id: ConnectionId,
	released: bool,
}

impl Registration {
	/// Unregister now, waiting for room in the hub's event channel.
	pub async fn release(mut self) {
		self.released = true;
		let _ = self.tx.send(HubEvent::Unregister { conn_id: self.conn_id }).await;
	}
}

impl Drop for Registration {
	fn drop(&mut self) {
		if self.released {
			return;
		}

		let conn_id = self.conn_id;
		match self.tx.try_send(HubEvent::Unregister { conn_id }) {
			Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
			Err(mpsc::error::TrySendError::Full(ev)) => {
				let tx = self.tx.clone();
				match tokio::runtime::Handle::try_current() {
					Ok(handle) => {
						handle.spawn(async move {
							let _ = tx.send(ev).await;
						});
					}
					Err(_) => warn!(%conn_id, "hub: unregister lost (event channel full, no runtime)"),
				}
			}
		}
	}
}

struct Member {
	identity: Identity,
	queue: mpsc::Sender<OutgoingMessage>,

	/// Messages dropped because this member's queue was full.
	dropped: u64,
}

struct ControlLoop {
	store: Arc<dyn MessageStore>,
	members: HashMap<ConnectionId, Member>,
	debug_logs: bool,
}

impl ControlLoop {
	async fn run(mut self, mut rx: mpsc::Receiver<HubEvent>) {
		info!("hub: control loop started");

		while let Some(ev) = rx.recv().await {
			match ev {
				HubEvent::Register {
					conn_id,
					identity,
					queue,
				} => self.register(conn_id, identity, queue),
				HubEvent::Unregister { conn_id } => self.unregister(conn_id),
				HubEvent::Broadcast {
					user_id,
					display_name,
					content,
					reply,
				} => {
					let res = self.persist_and_fan_out(user_id, display_name, content).await;
					let _ = reply.send(res);
				}
				HubEvent::MemberCount { reply } => {
					let _ = reply.send(self.members.len());
				}
				HubEvent::Shutdown => break,
			}
		}

		let remaining = self.members.len();
		self.members.clear();
		metrics::gauge!("parley_server_hub_members").set(0.0);
		info!(remaining, "hub: control loop stopped");
	}

	fn register(&mut self, conn_id: ConnectionId, identity: Identity, queue: mpsc::Sender<OutgoingMessage>) {
		let member = Member {
			identity,
			queue,
			dropped: 0,
		};
		if let Some(prev) = self.members.insert(conn_id, member) {
			warn!(%conn_id, previous = %prev.identity, "hub: connection registered twice; replaced");
		}

		metrics::gauge!("parley_server_hub_members").set(self.members.len() as f64);
		if self.debug_logs {
			debug!(%conn_id, members = self.members.len(), "hub: registered");
		}
	}

	fn unregister(&mut self, conn_id: ConnectionId) {
		let Some(member) = self.members.remove(&conn_id) else {
			return;
		};

		metrics::gauge!("parley_server_hub_members").set(self.members.len() as f64);
		if self.debug_logs || member.dropped > 0 {
			debug!(
				%conn_id,
				identity = %member.identity,
				dropped = member.dropped,
				members = self.members.len(),
				"hub: unregistered"
			);
		}
	}

	async fn persist_and_fan_out(
		&mut self,
		user_id: UserId,
		display_name: DisplayName,
		content: String,
	) -> Result<OutgoingMessage, HubError> {
		let stored = match self.store.insert_message(user_id, &content).await {
			Ok(stored) => stored,
			Err(e) => {
				metrics::counter!("parley_server_persist_errors_total").increment(1);
				warn!(%user_id, error = %e, "hub: persist failed; nothing broadcast");
				return Err(HubError::Store(e));
			}
		};
		metrics::counter!("parley_server_messages_persisted_total").increment(1);

		let msg = OutgoingMessage {
			id: stored.id,
			user_id,
			display_name,
			content,
			created_at: stored.created_at,
		};

		let mut dropped_total: u64 = 0;
		for (conn_id, member) in self.members.iter_mut() {
			match member.queue.try_send(msg.clone()) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) => {
					member.dropped = member.dropped.saturating_add(1);
					dropped_total += 1;
					debug!(%conn_id, dropped = member.dropped, "hub: outbound queue full; message dropped");
				}
				// Writer already gone; the reader's registration guard will unregister.
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		if dropped_total > 0 {
			metrics::counter!("parley_server_broadcast_dropped_total").increment(dropped_total);
		}
		if self.debug_logs {
			debug!(id = %msg.id, members = self.members.len(), dropped = dropped_total, "hub: broadcast");
		}

		Ok(msg)
	}
}
