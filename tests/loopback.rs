//! End-to-end loopback exchange over live capture handles.
//!
//! These tests open real capture devices and inject real frames, so they
//! need root (or CAP_NET_RAW + CAP_NET_ADMIN) and a loopback interface.
//! Run them explicitly:
//!
//! ```text
//! sudo -E cargo test --test loopback -- --ignored
//! ```

use std::{sync::Arc, thread, time::Duration};

#[test]
#[ignore = "requires root and live capture on loopback"]
fn loopback_echo() {
    let server = tcpgram::listen("tcp", "127.0.0.1:19007").expect("listen on loopback");
    let server_addr = server.local_addr();

    let client = tcpgram::dial("tcp", "127.0.0.1:19007").expect("dial loopback");
    let client_addr = client.local_addr();

    // Let the capture loops observe the handshake and latch both flows.
    thread::sleep(Duration::from_millis(300));

    client.write_to(b"ping", server_addr).expect("client write");

    let mut buf = [0u8; 2048];
    let (n, from) = server.read_from(&mut buf).expect("server read");
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from, client_addr);

    server.write_to(b"pong", from).expect("server write");

    let (n, from) = client.read_from(&mut buf).expect("client read");
    assert_eq!(&buf[..n], b"pong");
    assert_eq!(from, server_addr);

    client.close().expect("client close");
    server.close().expect("server close");
}

#[test]
#[ignore = "requires root and live capture on loopback"]
fn close_unblocks_pending_read() {
    let server = Arc::new(tcpgram::listen("tcp", "127.0.0.1:19008").expect("listen on loopback"));

    let reader = {
        let server = server.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 64];
            server.read_from(&mut buf)
        })
    };

    thread::sleep(Duration::from_millis(200));
    server.close().expect("close");

    assert!(matches!(
        reader.join().expect("reader thread"),
        Err(tcpgram::Error::Closed)
    ));
}
