//! The packet connection façade.
//!
//! A [`PacketConn`] looks like a datagram socket: address-tagged reads and
//! writes, no streams. Underneath, every write is serialized into a full
//! TCP segment and injected on the interface the peer's traffic arrives
//! on, while the kernel's own connection is reduced to a silenced shadow.

use std::{
    convert::Infallible,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{Arc, Mutex},
    time::Duration,
};

use crossbeam::channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::{
    addr::{self, Network},
    capture::{self, FrameSink, Injector},
    error::{Error, Result},
    flow::{FlowTable, Message},
    iface,
    packet::builder::{self, TcpParams},
    shadow,
};

/// A packet-oriented connection whose wire traffic is raw TCP segments.
///
/// Safe for concurrent use from multiple threads. Reads surface only
/// PSH-flagged segments captured for the local endpoint; writes inject
/// synthesized segments that continue the sequence space of the shadow
/// handshake.
pub struct PacketConn {
    server: bool,
    local_addr: SocketAddr,
    flows: Arc<FlowTable>,
    inbound_rx: Receiver<Message>,
    die_rx: Receiver<Infallible>,
    die_tx: Mutex<Option<Sender<Infallible>>>,
    /// Client-side shadow stream, surrendered at close after its hop limit
    /// is restored. Servers park their listener with the acceptor thread.
    shadow_stream: Mutex<Option<TcpStream>>,
}

/// Connect to a remote TCP endpoint and return a packet-oriented
/// connection sharing its five-tuple.
///
/// `network` is one of `tcp`, `tcp4`, `tcp6`; `address` is `host:port`.
/// Requires privileges to open capture handles and inject raw frames.
pub fn dial(network: &str, address: &str) -> Result<PacketConn> {
    let network: Network = network.parse()?;
    let remote = addr::resolve(network, address)?;

    let (device, local) = iface::lookup_outbound(remote)?;
    let filter = capture::client_filter(&local, &remote);
    let handle = capture::open_capture(&device, &filter)?;
    let injector: Arc<dyn FrameSink> = Arc::new(Injector::open(&device.name)?);

    let stream = shadow::dial_shadow(local, remote)?;
    let local_addr = stream.local_addr().map_err(Error::Dial)?;

    let flows = Arc::new(FlowTable::new());
    let (inbound_tx, inbound_rx) = bounded(0);
    let (die_tx, die_rx) = bounded(0);

    capture::spawn_capture_loop(
        handle,
        device.name.clone(),
        injector,
        flows.clone(),
        inbound_tx,
        die_rx.clone(),
    )
    .map_err(|e| Error::CaptureOpen {
        device: device.name.clone(),
        reason: e.to_string(),
    })?;

    // Silence the kernel's half of the conversation. Some stacks refuse a
    // zero TTL; the connection still works there as long as something else
    // (e.g. a firewall rule) suppresses the kernel acks.
    if let Err(e) = shadow::set_hops(&stream, 0) {
        warn!(
            event.name = "conn.silence_failed",
            error = %e,
            "failed to zero hop limit on shadow connection"
        );
    }
    let drain = stream.try_clone().map_err(Error::Dial)?;
    shadow::spawn_drain(drain).map_err(Error::Dial)?;

    info!(
        event.name = "conn.dialed",
        local = %local_addr,
        remote = %remote,
        device = %device.name,
        "packet connection established"
    );

    Ok(PacketConn {
        server: false,
        local_addr,
        flows,
        inbound_rx,
        die_rx,
        die_tx: Mutex::new(Some(die_tx)),
        shadow_stream: Mutex::new(Some(stream)),
    })
}

/// Listen for packet connections on a local TCP address.
///
/// An unspecified host (or bare `:port`) captures on every interface that
/// reports an address; interfaces that refuse to open are skipped.
pub fn listen(network: &str, address: &str) -> Result<PacketConn> {
    let network: Network = network.parse()?;
    let local = addr::resolve_bind(network, address)?;

    let mut handles = Vec::new();
    if local.ip().is_unspecified() {
        let filter = capture::wildcard_filter(local.port());
        for device in iface::all_devices()? {
            match capture::open_capture(&device, &filter) {
                Ok(handle) => match Injector::open(&device.name) {
                    Ok(injector) => handles.push((handle, device.name.clone(), injector)),
                    Err(e) => {
                        debug!(
                            event.name = "conn.injector_skipped",
                            device = %device.name,
                            error = %e,
                            "skipping interface without injection channel"
                        );
                    }
                },
                // Only open refusals are skippable; a filter that fails to
                // compile fails the listen.
                Err(e @ Error::Filter { .. }) => return Err(e),
                Err(e) => {
                    debug!(
                        event.name = "conn.capture_skipped",
                        device = %device.name,
                        error = %e,
                        "skipping interface that refused to open"
                    );
                }
            }
        }
        if handles.is_empty() {
            return Err(Error::NoInterface);
        }
    } else {
        let device = iface::lookup_bound(local.ip())?;
        let filter = capture::server_filter(&local);
        let handle = capture::open_capture(&device, &filter)?;
        let injector = Injector::open(&device.name)?;
        handles.push((handle, device.name.clone(), injector));
    }

    let listener = TcpListener::bind(local).map_err(Error::Listen)?;
    let local_addr = listener.local_addr().map_err(Error::Listen)?;

    let flows = Arc::new(FlowTable::new());
    let (inbound_tx, inbound_rx) = bounded(0);
    let (die_tx, die_rx) = bounded(0);

    let handle_count = handles.len();
    for (handle, device, injector) in handles {
        let sink: Arc<dyn FrameSink> = Arc::new(injector);
        capture::spawn_capture_loop(
            handle,
            device.clone(),
            sink,
            flows.clone(),
            inbound_tx.clone(),
            die_rx.clone(),
        )
        .map_err(|e| Error::CaptureOpen {
            device,
            reason: e.to_string(),
        })?;
    }
    drop(inbound_tx);

    shadow::spawn_acceptor(listener, die_rx.clone()).map_err(Error::Listen)?;

    info!(
        event.name = "conn.listening",
        local = %local_addr,
        handles = handle_count,
        "packet listener established"
    );

    Ok(PacketConn {
        server: true,
        local_addr,
        flows,
        inbound_rx,
        die_rx,
        die_tx: Mutex::new(Some(die_tx)),
        shadow_stream: Mutex::new(None),
    })
}

impl PacketConn {
    /// Receive the next inbound payload, blocking until a message arrives
    /// or the connection closes. Payloads longer than `buf` are truncated.
    pub fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        crossbeam::select! {
            recv(self.die_rx) -> _ => Err(Error::Closed),
            recv(self.inbound_rx) -> msg => {
                let msg = msg.map_err(|_| Error::Closed)?;
                let n = msg.payload.len().min(buf.len());
                buf[..n].copy_from_slice(&msg.payload[..n]);
                Ok((n, msg.peer))
            }
        }
    }

    /// Transmit `payload` to `peer` as one synthesized PSH+ACK segment.
    ///
    /// Blocks until the peer's flow is ready (its first packet has been
    /// observed and reflected into header templates) or the connection
    /// closes. Each call advances the flow's sequence number by the
    /// payload length, so per-peer writes serialize into a contiguous
    /// sequence space.
    pub fn write_to(&self, payload: &[u8], peer: impl ToSocketAddrs) -> Result<usize> {
        let peer = peer
            .to_socket_addrs()
            .map_err(|e| Error::Resolve(e.to_string()))?
            .next()
            .ok_or_else(|| Error::Resolve("empty address".to_string()))?;

        let snapshot = loop {
            let ready = self.flows.with_entry(peer, |e| e.ready());
            crossbeam::select! {
                recv(self.die_rx) -> _ => return Err(Error::Closed),
                recv(ready) -> _ => {}
            }
            // The latch may belong to an entry torn down by FIN/RST after
            // it fired; in that case the lookup recreates a fresh, unready
            // entry and the wait starts over.
            if let Some(snapshot) = self.flows.with_entry(peer, |e| e.snapshot()) {
                break snapshot;
            }
        };

        let frame = builder::build_frame(
            &snapshot.link,
            &snapshot.net,
            TcpParams {
                src_port: self.local_addr.port(),
                dst_port: peer.port(),
                seq: snapshot.seq,
                ack: snapshot.ack,
            },
            payload,
        );
        snapshot.sink.inject(&frame)?;

        self.flows.with_entry(peer, |e| {
            e.seq = e.seq.wrapping_add(payload.len() as u32);
        });
        Ok(payload.len())
    }

    /// Close the connection: latch shutdown, stop the capture loops, and
    /// let the shadow socket say goodbye with a normal hop limit.
    /// Idempotent; later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        let mut die = self.die_tx.lock().expect("shutdown latch lock poisoned");
        if let Some(die_tx) = die.take() {
            drop(die_tx);
            if let Some(stream) = self
                .shadow_stream
                .lock()
                .expect("shadow stream lock poisoned")
                .take()
            {
                // Restore the hop limit before the FIN so the close is
                // visible to the peer and NAT state can expire.
                if let Err(e) = shadow::set_hops(&stream, shadow::GOODBYE_HOPS) {
                    warn!(
                        event.name = "conn.goodbye_failed",
                        error = %e,
                        "failed to restore hop limit before close"
                    );
                }
                let _ = stream.shutdown(Shutdown::Both);
            }
            info!(
                event.name = "conn.closed",
                local = %self.local_addr,
                server = self.server,
                "packet connection closed"
            );
        }
        Ok(())
    }

    /// The local (IP, port) of the shadow endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Deadlines are unsupported on packet connections.
    pub fn set_deadline(&self, _deadline: Option<Duration>) -> Result<()> {
        Err(Error::NotImplemented)
    }

    /// Deadlines are unsupported on packet connections.
    pub fn set_read_deadline(&self, _deadline: Option<Duration>) -> Result<()> {
        Err(Error::NotImplemented)
    }

    /// Deadlines are unsupported on packet connections.
    pub fn set_write_deadline(&self, _deadline: Option<Duration>) -> Result<()> {
        Err(Error::NotImplemented)
    }
}

impl Drop for PacketConn {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
