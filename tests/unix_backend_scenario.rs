//! The same client/server handshake-and-message scenario as `transport_scenarios.rs`,
//! but over a real `AF_UNIX` socket with `SCM_CREDENTIALS`, for environments where one
//! is available. `#![cfg(unix)]` skips the whole file elsewhere.
#![cfg(unix)]

use dbus_transport::backend::IterationFlags;
use dbus_transport::connection::ConnectionHandle;
use dbus_transport::live_bytes::LiveMessage;
use dbus_transport::message::{Message, MessageKind};
use dbus_transport::open::OpenOptions;
use dbus_transport::transport::Transport;
use dbus_transport::watch::{TimeoutId, WatchCondition, WatchId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct RecordingConnection {
    received: Mutex<Vec<Message>>,
    disconnected: AtomicBool,
}

impl RecordingConnection {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        })
    }

    fn handle(self: &Arc<Self>) -> Arc<dyn ConnectionHandle> {
        self.clone()
    }
}

impl ConnectionHandle for RecordingConnection {
    fn deliver_message(&self, message: LiveMessage<Message>) {
        self.received.lock().unwrap().push(message.into_inner());
    }

    fn notify_disconnected(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    fn add_watch(&self, _fd: std::os::raw::c_int, _condition: WatchCondition) -> WatchId {
        WatchId(0)
    }

    fn toggle_watch(&self, _id: WatchId, _enabled: bool) {}

    fn remove_watch(&self, _id: WatchId) {}

    fn add_timeout(&self, _interval_ms: u32) -> TimeoutId {
        TimeoutId(0)
    }

    fn remove_timeout(&self, _id: TimeoutId) {}
}

#[tokio::test]
async fn unix_backend_client_connects_authenticates_and_exchanges_a_message() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dbus-test.sock");
    let path_str = path.to_str().unwrap().to_string();

    let opts = OpenOptions::default();
    let server_address = format!("unix:path={path_str},listen=true");
    let client_address = format!("unix:path={path_str}");

    // The server's opener blocks inside `accept()`, so it has to run concurrently
    // with the client dialing in rather than sequentially before it.
    let server_opts = opts.clone();
    let server_task =
        tokio::spawn(async move { Transport::open(&server_address, &server_opts).await.unwrap() });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let client = Transport::open(&client_address, &opts).await.unwrap();
    let server = server_task.await.unwrap();

    let server_conn = RecordingConnection::new();
    server
        .set_connection(Arc::downgrade(&server_conn.handle()))
        .await
        .unwrap();

    for _ in 0..4 {
        server
            .do_iteration(IterationFlags::READ, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        client
            .do_iteration(IterationFlags::READ, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        if server.is_authenticated().await && client.is_authenticated().await {
            break;
        }
    }
    assert!(server.is_authenticated().await);
    assert!(client.is_authenticated().await);
    assert_eq!(client.unix_user().await, server.unix_user().await);

    // The server side received the client's pid via `SCM_CREDENTIALS`; the client
    // side never receives the server's, since only the client sends the credential
    // byte in this handshake.
    assert_eq!(server.unix_process_id().await, Some(std::process::id()));
    assert_eq!(client.unix_process_id().await, None);

    let msg = Message::new(3, MessageKind::MethodCall, b"unix-hello".to_vec());
    client.send_message(&msg).await.unwrap();
    server
        .do_iteration(IterationFlags::READ, Some(Duration::from_millis(100)))
        .await
        .unwrap();
    server.queue_messages().await.unwrap();

    let received = server_conn.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].serial, 3);
    assert_eq!(received[0].payload, b"unix-hello");
}
