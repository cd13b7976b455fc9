//! The kernel shadow socket.
//!
//! A real kernel TCP connection exists alongside every packet connection.
//! Its only job is to exist: the three-way handshake installs NAT and
//! firewall state, and the established socket keeps middleboxes convinced
//! the flow is alive. Immediately after the handshake its IP TTL (or IPv6
//! hop limit) is forced to zero, so every ACK the kernel emits dies at the
//! first hop instead of colliding with the synthesized data segments.
//! Inbound bytes are drained and discarded so the kernel's receive window
//! keeps sliding and the peer never stalls.

use std::{
    convert::Infallible,
    io::Read,
    net::{SocketAddr, TcpListener, TcpStream},
    thread,
    time::Duration,
};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use socket2::{Domain, SockRef, Socket, Type};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Hop limit restored before close so the kernel's FIN/RST reaches the
/// peer and NAT state can expire cleanly.
pub(crate) const GOODBYE_HOPS: u32 = 64;

/// Poll interval for the acceptor between shutdown checks.
const ACCEPT_POLL: Duration = Duration::from_millis(250);

/// Set the IP TTL (IPv4) or unicast hop limit (IPv6) on an established
/// stream. Zero silences the kernel mid-connection; [`GOODBYE_HOPS`]
/// re-enables it for the close handshake.
pub(crate) fn set_hops(stream: &TcpStream, hops: u32) -> std::io::Result<()> {
    let local = stream.local_addr()?;
    if local.is_ipv4() {
        stream.set_ttl(hops)
    } else {
        SockRef::from(stream).set_unicast_hops_v6(hops)
    }
}

/// Dial the shadow connection from the exact local address the interface
/// locator discovered, so the capture filter and the kernel flow agree on
/// the five-tuple.
pub(crate) fn dial_shadow(local: SocketAddr, remote: SocketAddr) -> Result<TcpStream> {
    let domain = if remote.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, None).map_err(Error::Dial)?;
    socket.bind(&local.into()).map_err(Error::Dial)?;
    socket.connect(&remote.into()).map_err(Error::Dial)?;
    Ok(socket.into())
}

/// Drain and discard everything the kernel receives on `stream`.
pub(crate) fn spawn_drain(mut stream: TcpStream) -> std::io::Result<()> {
    thread::Builder::new()
        .name("tcpgram-drain".to_string())
        .spawn(move || {
            let mut sink = [0u8; 4096];
            loop {
                match stream.read(&mut sink) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })?;
    Ok(())
}

/// Accept kernel handshakes on the server side, silence each accepted
/// connection, and drain it. User data never passes through here; the
/// capture loops carry it.
pub(crate) fn spawn_acceptor(
    listener: TcpListener,
    die_rx: Receiver<Infallible>,
) -> std::io::Result<()> {
    listener.set_nonblocking(true)?;
    thread::Builder::new()
        .name("tcpgram-accept".to_string())
        .spawn(move || loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(
                        event.name = "shadow.accepted",
                        peer = %peer,
                        "shadow handshake accepted, silencing kernel acks"
                    );
                    if let Err(e) = set_hops(&stream, 0) {
                        warn!(
                            event.name = "shadow.set_hops_failed",
                            peer = %peer,
                            error = %e,
                            "failed to zero hop limit on accepted connection"
                        );
                    }
                    if spawn_drain(stream).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // Idle: wait for the next handshake or for shutdown.
                    match die_rx.recv_timeout(ACCEPT_POLL) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                Err(_) => break,
            }
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn test_set_hops_roundtrip_v4() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();

        set_hops(&stream, 1).unwrap();
        assert_eq!(stream.ttl().unwrap(), 1);
        set_hops(&stream, GOODBYE_HOPS).unwrap();
        assert_eq!(stream.ttl().unwrap(), GOODBYE_HOPS);
    }

    #[test]
    fn test_dial_shadow_binds_requested_address() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = listener.local_addr().unwrap();

        // Port 0 lets the kernel pick; the bound IP must stick.
        let stream = dial_shadow("127.0.0.1:0".parse().unwrap(), remote).unwrap();
        assert_eq!(
            stream.local_addr().unwrap().ip().to_string(),
            "127.0.0.1"
        );
    }
}
