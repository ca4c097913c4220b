#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use parley_domain::{ConnectionId, Identity};
use parley_protocol::OutgoingMessage;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;

use crate::server::connection::{Connection, ConnectionSettings, ReaderExit};
use crate::server::hub::{Hub, HubConfig};
use crate::server::test_support::{FlakyStore, identity, init_test_logging};

type Client = WebSocketStream<DuplexStream>;

fn settings() -> ConnectionSettings {
	ConnectionSettings {
		write_wait: Duration::from_millis(500),
		..ConnectionSettings::default()
	}
}

/// Registers a connection on an in-memory transport and starts its pump.
async fn connect(hub: &Hub, conn: u64, who: Identity, settings: ConnectionSettings) -> (Client, JoinHandle<ReaderExit>) {
	let (server_io, client_io) = tokio::io::duplex(64 * 1024);
	let server = WebSocketStream::from_raw_socket(server_io, Role::Server, Some(settings.websocket_config())).await;
	let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

	let connection = Connection::register(hub, ConnectionId::new(conn), who, &settings)
		.await
		.expect("register");
	let task = tokio::spawn(connection.run(server, hub.clone(), settings));
	(client, task)
}

async fn send_json(client: &mut Client, body: &str) {
	client.send(Message::text(body.to_string())).await.expect("client send");
}

async fn next_message(client: &mut Client) -> OutgoingMessage {
	loop {
		let msg = timeout(Duration::from_secs(2), client.next())
			.await
			.expect("expected a frame within timeout")
			.expect("stream open")
			.expect("frame ok");
		match msg {
			Message::Text(text) => return serde_json::from_str(text.as_str()).expect("outgoing message json"),
			Message::Ping(_) | Message::Pong(_) => continue,
			other => panic!("unexpected frame: {other:?}"),
		}
	}
}

/// Reads until the server closes the stream, failing on any data frame.
async fn expect_closed(client: &mut Client) {
	loop {
		let next = timeout(Duration::from_secs(2), client.next())
			.await
			.expect("expected close within timeout");
		match next {
			None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
			Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
			Some(Ok(other)) => panic!("unexpected frame before close: {other:?}"),
		}
	}
}

async fn finished(task: JoinHandle<ReaderExit>) -> ReaderExit {
	timeout(Duration::from_secs(2), task)
		.await
		.expect("connection finished within timeout")
		.expect("connection task")
}

#[tokio::test]
async fn frames_are_persisted_and_echoed_to_all_members() {
	init_test_logging();
	let store = FlakyStore::new();
	let hub = Hub::start(store.clone(), HubConfig::default());

	let (mut alice, _a) = connect(&hub, 1, identity(1, "Alice"), settings()).await;
	let (mut bob, _b) = connect(&hub, 2, identity(2, "Bob"), settings()).await;

	send_json(&mut alice, r#"{"content":"hi"}"#).await;

	for client in [&mut alice, &mut bob] {
		let got = next_message(client).await;
		assert_eq!(got.content, "hi");
		assert_eq!(got.user_id, identity(1, "Alice").user_id);
		assert_eq!(got.display_name.as_str(), "Alice");
	}
	assert_eq!(store.inserts(), 1);
}

#[tokio::test]
async fn empty_frames_are_ignored() {
	init_test_logging();
	let store = FlakyStore::new();
	let hub = Hub::start(store.clone(), HubConfig::default());

	let (mut client, _task) = connect(&hub, 1, identity(1, "Alice"), settings()).await;

	send_json(&mut client, r#"{"content":""}"#).await;
	send_json(&mut client, "{}").await;
	send_json(&mut client, r#"{"content":"real"}"#).await;

	let got = next_message(&mut client).await;
	assert_eq!(got.content, "real");
	assert_eq!(store.inserts(), 1);
}

#[tokio::test]
async fn malformed_frame_closes_and_unregisters() {
	init_test_logging();
	let hub = Hub::start(FlakyStore::new(), HubConfig::default());

	let (mut client, task) = connect(&hub, 1, identity(1, "Alice"), settings()).await;
	send_json(&mut client, "this is not json").await;

	assert_eq!(finished(task).await, ReaderExit::Malformed);
	expect_closed(&mut client).await;
	assert_eq!(hub.member_count().await.unwrap(), 0);
}

#[tokio::test]
async fn oversized_frame_is_rejected() {
	init_test_logging();
	let hub = Hub::start(FlakyStore::new(), HubConfig::default());
	let settings = ConnectionSettings {
		max_frame_bytes: 64,
		..settings()
	};

	let (mut client, task) = connect(&hub, 1, identity(1, "Alice"), settings).await;
	let body = format!(r#"{{"content":"{}"}}"#, "x".repeat(128));
	send_json(&mut client, &body).await;

	assert_eq!(finished(task).await, ReaderExit::Malformed);
	assert_eq!(hub.member_count().await.unwrap(), 0);
}

#[tokio::test]
async fn silent_peer_hits_read_deadline() {
	init_test_logging();
	let hub = Hub::start(FlakyStore::new(), HubConfig::default());
	let settings = ConnectionSettings {
		pong_wait: Duration::from_millis(150),
		ping_period: Duration::from_secs(60),
		..settings()
	};

	// The client never reads or writes, so no pong ever comes back.
	let (_client, task) = connect(&hub, 1, identity(1, "Alice"), settings).await;
	assert_eq!(hub.member_count().await.unwrap(), 1);

	assert_eq!(finished(task).await, ReaderExit::DeadlineExpired);
	assert_eq!(hub.member_count().await.unwrap(), 0);
}

#[tokio::test]
async fn pongs_keep_a_reading_peer_alive() {
	init_test_logging();
	let hub = Hub::start(FlakyStore::new(), HubConfig::default());
	let settings = ConnectionSettings {
		pong_wait: Duration::from_millis(300),
		ping_period: Duration::from_millis(50),
		..settings()
	};

	let (mut client, task) = connect(&hub, 1, identity(1, "Alice"), settings).await;

	// Reading drives the client's automatic pong replies.
	let reader = tokio::spawn(async move { while let Some(Ok(_)) = client.next().await {} });

	tokio::time::sleep(Duration::from_millis(900)).await;
	assert!(!task.is_finished(), "connection dropped despite pongs");
	assert_eq!(hub.member_count().await.unwrap(), 1);

	reader.abort();
}

#[tokio::test]
async fn unregistering_drains_queue_then_closes() {
	init_test_logging();
	let hub = Hub::start(FlakyStore::new(), HubConfig::default());
	let alice = identity(1, "Alice");

	let (mut client, task) = connect(&hub, 1, alice.clone(), settings()).await;

	let queued = hub
		.persist_and_broadcast(alice.user_id, alice.display_name.clone(), "last words".to_string())
		.await
		.unwrap();
	hub.unregister(ConnectionId::new(1)).await.unwrap();

	assert_eq!(next_message(&mut client).await, queued);
	expect_closed(&mut client).await;

	// The client's close reply may reach the reader before it notices the writer is done.
	let exit = finished(task).await;
	assert!(
		matches!(exit, ReaderExit::WriterStopped | ReaderExit::PeerClosed),
		"unexpected exit: {exit:?}"
	);
}

#[tokio::test]
async fn persist_failure_tears_down_only_the_sender() {
	init_test_logging();
	let store = FlakyStore::new();
	let hub = Hub::start(store.clone(), HubConfig::default());

	let (mut alice, alice_task) = connect(&hub, 1, identity(1, "Alice"), settings()).await;
	let (mut bob, bob_task) = connect(&hub, 2, identity(2, "Bob"), settings()).await;

	store.set_failing(true);
	send_json(&mut alice, r#"{"content":"doomed"}"#).await;

	assert_eq!(finished(alice_task).await, ReaderExit::PersistFailed);
	expect_closed(&mut alice).await;
	assert_eq!(hub.member_count().await.unwrap(), 1);

	store.set_failing(false);
	send_json(&mut bob, r#"{"content":"still here"}"#).await;
	assert_eq!(next_message(&mut bob).await.content, "still here");
	assert!(!bob_task.is_finished());
}

#[tokio::test]
async fn peer_close_unregisters() {
	init_test_logging();
	let hub = Hub::start(FlakyStore::new(), HubConfig::default());

	let (mut client, task) = connect(&hub, 1, identity(1, "Alice"), settings()).await;
	client.close(None).await.expect("client close");

	assert_eq!(finished(task).await, ReaderExit::PeerClosed);
	assert_eq!(hub.member_count().await.unwrap(), 0);
}

#[tokio::test]
async fn dropped_transport_unregisters() {
	init_test_logging();
	let hub = Hub::start(FlakyStore::new(), HubConfig::default());
	let alice = identity(1, "Alice");

	let (client, task) = connect(&hub, 1, alice.clone(), settings()).await;
	assert_eq!(hub.member_count().await.unwrap(), 1);

	// No close frame: the transport just disappears mid-read.
	drop(client);

	assert_eq!(finished(task).await, ReaderExit::Transport);
	assert_eq!(hub.member_count().await.unwrap(), 0);

	// Later broadcasts no longer target the dropped connection.
	hub.persist_and_broadcast(alice.user_id, alice.display_name.clone(), "after".to_string())
		.await
		.unwrap();
	assert_eq!(hub.member_count().await.unwrap(), 0);
}

#[tokio::test]
async fn slow_reader_does_not_stall_other_connections() {
	init_test_logging();
	let store = Arc::new(crate::server::store::InMemoryStore::new());
	let hub = Hub::start(store, HubConfig::default());
	let small = ConnectionSettings {
		outbound_queue_capacity: 1,
		..settings()
	};

	// The slow client never reads its side of the transport.
	let (_slow, slow_task) = connect(&hub, 1, identity(1, "Slow"), small).await;
	let (mut fast, _fast_task) = connect(&hub, 2, identity(2, "Fast"), settings()).await;
	let sender = identity(3, "Sender");

	for i in 0..10 {
		hub.persist_and_broadcast(sender.user_id, sender.display_name.clone(), format!("m{i}"))
			.await
			.unwrap();
	}

	for i in 0..10 {
		assert_eq!(next_message(&mut fast).await.content, format!("m{i}"));
	}
	assert!(!slow_task.is_finished());
}
