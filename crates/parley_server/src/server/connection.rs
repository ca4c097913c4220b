#![forbid(unsafe_code)]

use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use parley_domain::{ConnectionId, Identity};
use parley_protocol::{DEFAULT_MAX_FRAME_SIZE, OutgoingMessage, decode_inbound, encode_outgoing};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::server::hub::{Hub, HubError, Registration};

/// Per-connection limits and deadlines.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,

	/// Outbound queue capacity; a full queue drops broadcasts for this connection only.
	pub outbound_queue_capacity: usize,

	pub write_wait: Duration,
	pub pong_wait: Duration,

	/// Must be shorter than `pong_wait`.
	pub ping_period: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		let pong_wait = Duration::from_secs(60);
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 32,
			write_wait: Duration::from_secs(10),
			pong_wait,
			ping_period: pong_wait * 9 / 10,
		}
	}
}

impl ConnectionSettings {
	/// WebSocket limits matching `max_frame_bytes`.
	pub fn websocket_config(&self) -> WebSocketConfig {
		WebSocketConfig::default()
			.max_message_size(Some(self.max_frame_bytes))
			.max_frame_size(Some(self.max_frame_bytes))
	}
}

/// Why a connection's reader stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
	PeerClosed,
	DeadlineExpired,
	Malformed,
	Transport,
	PersistFailed,
	HubClosed,
	WriterStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterExit {
	QueueClosed,
	WriteFailed,
	WriteTimedOut,
}

/// A registered connection that has not started pumping yet.
#[derive(Debug)]
pub struct Connection {
	conn_id: ConnectionId,
	identity: Identity,
	outbound: mpsc::Receiver<OutgoingMessage>,
	registration: Registration,
}

impl Connection {
	/// Create the outbound queue and register it with the hub.
	pub async fn register(
		hub: &Hub,
		conn_id: ConnectionId,
		identity: Identity,
		settings: &ConnectionSettings,
	) -> Result<Self, HubError> {
		let (tx, outbound) = mpsc::channel(settings.outbound_queue_capacity.max(1));
		let registration = hub.register(conn_id, identity.clone(), tx).await?;

		Ok(Self {
			conn_id,
			identity,
			outbound,
			registration,
		})
	}

	/// Run the writer and reader until either side stops.
	///
	/// Unregisters from the hub exactly once and waits for the writer to close
	/// the transport.
	pub async fn run<S>(self, ws: WebSocketStream<S>, hub: Hub, settings: ConnectionSettings) -> ReaderExit
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		struct ConnectionGaugeGuard;
		impl Drop for ConnectionGaugeGuard {
			fn drop(&mut self) {
				metrics::gauge!("parley_server_active_connections").decrement(1.0);
			}
		}

		metrics::counter!("parley_server_connections_total").increment(1);
		metrics::gauge!("parley_server_active_connections").increment(1.0);
		let _conn_guard = ConnectionGaugeGuard;

		let Connection {
			conn_id,
			identity,
			outbound,
			registration,
		} = self;

		info!(%conn_id, %identity, "connection active");

		let (sink, stream) = ws.split();
		let mut writer = tokio::spawn(write_pump(conn_id, sink, outbound, settings.clone()));

		let exit = read_pump(conn_id, &identity, stream, &hub, &settings, &mut writer).await;

		registration.release().await;

		if exit != ReaderExit::WriterStopped {
			match writer.await {
				Ok(w) => debug!(%conn_id, writer = ?w, "writer stopped"),
				Err(e) => warn!(%conn_id, error = %e, "writer task failed"),
			}
		}

		info!(%conn_id, %identity, reason = ?exit, "connection closed");
		exit
	}
}

async fn write_pump<S>(
	conn_id: ConnectionId,
	mut sink: SplitSink<WebSocketStream<S>, Message>,
	mut outbound: mpsc::Receiver<OutgoingMessage>,
	settings: ConnectionSettings,
) -> WriterExit
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let mut ping = tokio::time::interval_at(Instant::now() + settings.ping_period, settings.ping_period);
	ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

	let exit = loop {
		let frame = tokio::select! {
			biased;

			item = outbound.recv() => {
				let Some(msg) = item else {
					// Unregistered: everything queued has been written.
					let _ = timeout(settings.write_wait, sink.send(Message::Close(None))).await;
					break WriterExit::QueueClosed;
				};
				match encode_outgoing(&msg) {
					Ok(text) => Message::text(text),
					Err(e) => {
						warn!(%conn_id, id = %msg.id, error = %e, "failed to encode outgoing message");
						continue;
					}
				}
			}

			_ = ping.tick() => Message::Ping(Bytes::new()),
		};

		let is_data = frame.is_text();
		match timeout(settings.write_wait, sink.send(frame)).await {
			Ok(Ok(())) => {
				if is_data {
					metrics::counter!("parley_server_frames_out_total").increment(1);
				}
			}
			Ok(Err(e)) => {
				debug!(%conn_id, error = %e, "write failed");
				break WriterExit::WriteFailed;
			}
			Err(_) => {
				debug!(%conn_id, after = ?settings.write_wait, "write deadline exceeded");
				break WriterExit::WriteTimedOut;
			}
		}
	};

	let _ = timeout(settings.write_wait, sink.close()).await;
	exit
}

async fn read_pump<S>(
	conn_id: ConnectionId,
	identity: &Identity,
	mut stream: SplitStream<WebSocketStream<S>>,
	hub: &Hub,
	settings: &ConnectionSettings,
	writer: &mut JoinHandle<WriterExit>,
) -> ReaderExit
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	loop {
		// A fresh deadline per read; pongs and pings count as reads.
		let next = tokio::select! {
			biased;

			res = &mut *writer => {
				debug!(%conn_id, writer = ?res.ok(), "writer finished first");
				return ReaderExit::WriterStopped;
			}

			next = timeout(settings.pong_wait, stream.next()) => next,
		};

		let msg = match next {
			Err(_) => {
				debug!(%conn_id, after = ?settings.pong_wait, "read deadline expired");
				return ReaderExit::DeadlineExpired;
			}
			Ok(None) | Ok(Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed))) => {
				return ReaderExit::PeerClosed;
			}
			Ok(Some(Err(WsError::Capacity(e)))) => {
				debug!(%conn_id, error = %e, "inbound frame too large");
				return ReaderExit::Malformed;
			}
			Ok(Some(Err(e))) => {
				debug!(%conn_id, error = %e, "read failed");
				return ReaderExit::Transport;
			}
			Ok(Some(Ok(msg))) => msg,
		};

		let decoded = match &msg {
			Message::Text(text) => decode_inbound(text.as_bytes(), settings.max_frame_bytes),
			Message::Binary(data) => decode_inbound(data, settings.max_frame_bytes),
			Message::Close(_) => return ReaderExit::PeerClosed,
			Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
		};
		metrics::counter!("parley_server_frames_in_total").increment(1);

		let frame = match decoded {
			Ok(frame) => frame,
			Err(e) => {
				debug!(%conn_id, error = %e, "malformed inbound frame");
				return ReaderExit::Malformed;
			}
		};

		if frame.is_empty() {
			continue;
		}

		match hub
			.persist_and_broadcast(identity.user_id, identity.display_name.clone(), frame.content)
			.await
		{
			Ok(_) => {}
			Err(HubError::Store(e)) => {
				warn!(%conn_id, %identity, error = %e, "persist failed; closing connection");
				return ReaderExit::PersistFailed;
			}
			Err(HubError::Closed) => return ReaderExit::HubClosed,
		}
	}
}
