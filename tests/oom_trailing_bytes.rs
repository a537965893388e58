//! Simulated allocation failure during the one-shot recovery of bytes that arrive
//! bundled with the final `BEGIN\r\n` line of the auth handshake.
//!
//! `DBUS_MALLOC_FAIL_NTH` is read once into a process-wide `OnceLock` the first time
//! any reservation runs, so this has to be this binary's only test: every `tests/*.rs`
//! file compiles to its own process, and as long as nothing here reserves a buffer
//! before the env var is set, the count below is exact.

use dbus_transport::backend::IterationFlags;
use dbus_transport::message::{Message, MessageKind};
use dbus_transport::open::OpenOptions;
use dbus_transport::transport::{DispatchStatus, Transport};
use std::time::Duration;

#[tokio::test]
async fn s5_oom_during_trailing_byte_recovery_reports_need_memory() {
    // Fails the 4th (and every subsequent 4th) buffer reservation in this process:
    // #1 server reads the client's AUTH line, #2 client reads the server's OK line,
    // #3 server reads the combined BEGIN + trailing-message-frame chunk, #4 the
    // server's one-shot recovery of that trailing frame into the message loader.
    std::env::set_var("DBUS_MALLOC_FAIL_NTH", "4");

    let opts = OpenOptions::default();
    let server = Transport::open("debug-pipe:name=oom-trailing,listen=true", &opts)
        .await
        .unwrap();
    let client = Transport::open("debug-pipe:name=oom-trailing", &opts)
        .await
        .unwrap();

    server
        .do_iteration(IterationFlags::READ, Some(Duration::from_millis(50)))
        .await
        .unwrap();
    client
        .do_iteration(IterationFlags::READ, Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(client.is_authenticated().await);

    let msg = Message::new(99, MessageKind::Signal, b"oom-trailing-bytes".to_vec());
    client.send_message(&msg).await.unwrap();

    server
        .do_iteration(IterationFlags::READ, Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(server.is_authenticated().await);

    assert_eq!(
        server.dispatch_status().await.unwrap(),
        DispatchStatus::NeedMemory
    );
}
