//! Packet-oriented connections carried as raw TCP segments.
//!
//! This crate layers a datagram-like interface on top of a real, kernel
//! established TCP connection. The kernel handshake installs NAT and
//! firewall state and pins the five-tuple; every byte of user data then
//! bypasses the kernel's TCP state machine entirely, captured and injected
//! as complete link-level frames. To middleboxes the flow is ordinary TCP;
//! to the application it is a datagram socket with no retransmission,
//! ordering, or flow control.
//!
//! ```no_run
//! let conn = tcpgram::dial("tcp", "192.0.2.10:9000")?;
//! conn.write_to(b"ping", "192.0.2.10:9000")?;
//! let mut buf = [0u8; 2048];
//! let (n, peer) = conn.read_from(&mut buf)?;
//! println!("{} bytes from {peer}", n);
//! conn.close()?;
//! # Ok::<(), tcpgram::Error>(())
//! ```
//!
//! Opening capture handles and injecting frames requires elevated
//! privileges (root, or `CAP_NET_RAW` + `CAP_NET_ADMIN`).

mod addr;
mod capture;
mod conn;
mod error;
mod flow;
mod iface;
mod packet;
mod shadow;

pub use addr::Network;
pub use conn::{dial, listen, PacketConn};
pub use error::{Error, Result};
