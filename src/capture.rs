//! Capture handles, BPF filters, frame injection, and the per-handle
//! capture loop that drives all flow state.
//!
//! Each opened handle gets one long-running named thread. The loop never
//! surfaces errors to the API user: malformed packets are skipped, and the
//! loop exits when the shutdown latch drops or the handle dies. Injection
//! goes through [`FrameSink`] so the write path can be exercised without a
//! live device.

use std::{
    convert::Infallible,
    net::SocketAddr,
    ops::ControlFlow,
    sync::{Arc, Mutex},
    thread,
};

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use pcap::{Active, Capture, Device};
use pnet::datalink::{self, Channel, DataLinkSender};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    flow::{FlowTable, Message},
    packet::parser::{self, Decoded},
};

/// Capture at full frame size; synthesized segments are never larger.
const SNAPLEN: i32 = 65536;
/// Wake the loop at least once a second so the shutdown latch is noticed
/// even on a silent wire.
const POLL_TIMEOUT_MS: i32 = 1000;

/// Client-side filter: only segments of the one established five-tuple.
pub(crate) fn client_filter(local: &SocketAddr, remote: &SocketAddr) -> String {
    format!(
        "tcp and dst host {} and dst port {} and src host {} and src port {}",
        local.ip(),
        local.port(),
        remote.ip(),
        remote.port()
    )
}

/// Server filter for a concrete bound address.
pub(crate) fn server_filter(local: &SocketAddr) -> String {
    format!("tcp and dst host {} and dst port {}", local.ip(), local.port())
}

/// Server filter for a wildcard bind: every interface, one port.
pub(crate) fn wildcard_filter(port: u16) -> String {
    format!("tcp and dst port {port}")
}

/// Open a live, promiscuous, BPF-filtered capture handle on `device`.
pub(crate) fn open_capture(device: &Device, filter: &str) -> Result<Capture<Active>> {
    let mut capture = Capture::from_device(device.clone())
        .map_err(|e| Error::CaptureOpen {
            device: device.name.clone(),
            reason: e.to_string(),
        })?
        .snaplen(SNAPLEN)
        .promisc(true)
        .timeout(POLL_TIMEOUT_MS)
        .open()
        .map_err(|e| Error::CaptureOpen {
            device: device.name.clone(),
            reason: e.to_string(),
        })?;
    capture
        .filter(filter, true)
        .map_err(|source| Error::Filter {
            filter: filter.to_string(),
            source,
        })?;
    debug!(
        event.name = "capture.opened",
        device = %device.name,
        filter = filter,
        "capture handle opened"
    );
    Ok(capture)
}

/// Raw frame transmission endpoint for one interface.
///
/// The trait seam exists so flow and connection logic can be tested against
/// a collecting sink instead of a privileged device.
pub(crate) trait FrameSink: Send + Sync {
    fn inject(&self, frame: &[u8]) -> Result<()>;
}

/// Injects frames through a datalink channel on the interface a flow's
/// packets arrive on.
pub(crate) struct Injector {
    device: String,
    tx: Mutex<Box<dyn DataLinkSender>>,
}

impl Injector {
    pub fn open(device: &str) -> Result<Injector> {
        let iface = datalink::interfaces()
            .into_iter()
            .find(|i| i.name == device)
            .ok_or(Error::NoInterface)?;
        let tx = match datalink::channel(&iface, datalink::Config::default()) {
            Ok(Channel::Ethernet(tx, _rx)) => tx,
            Ok(_) => {
                return Err(Error::CaptureOpen {
                    device: device.to_string(),
                    reason: "unsupported datalink channel type".to_string(),
                })
            }
            Err(e) => {
                return Err(Error::CaptureOpen {
                    device: device.to_string(),
                    reason: e.to_string(),
                })
            }
        };
        Ok(Injector {
            device: device.to_string(),
            tx: Mutex::new(tx),
        })
    }
}

impl FrameSink for Injector {
    fn inject(&self, frame: &[u8]) -> Result<()> {
        let mut tx = self.tx.lock().expect("injector lock poisoned");
        match tx.send_to(frame, None) {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(Error::Inject(format!("{e} on {}", self.device))),
            None => Err(Error::Inject(format!(
                "datalink channel on {} rejected frame",
                self.device
            ))),
        }
    }
}

fn die_latched(die_rx: &Receiver<Infallible>) -> bool {
    matches!(die_rx.try_recv(), Err(TryRecvError::Disconnected))
}

/// Spawn the capture loop for one handle.
///
/// The loop owns the handle; it is closed when the thread exits, which
/// happens when the shutdown latch drops, the inbound push loses to
/// shutdown, or the handle itself fails.
pub(crate) fn spawn_capture_loop(
    mut capture: Capture<Active>,
    device: String,
    sink: Arc<dyn FrameSink>,
    flows: Arc<FlowTable>,
    inbound_tx: Sender<Message>,
    die_rx: Receiver<Infallible>,
) -> std::io::Result<()> {
    let linktype = capture.get_datalink();
    thread::Builder::new()
        .name("tcpgram-capture".to_string())
        .spawn(move || {
            loop {
                if die_latched(&die_rx) {
                    break;
                }
                match capture.next_packet() {
                    Ok(packet) => {
                        let Some(decoded) = parser::decode(linktype, packet.data) else {
                            continue;
                        };
                        if process_packet(&flows, &sink, &inbound_tx, &die_rx, &decoded)
                            .is_break()
                        {
                            break;
                        }
                    }
                    Err(pcap::Error::TimeoutExpired) => continue,
                    Err(e) => {
                        warn!(
                            event.name = "capture.read_error",
                            device = %device,
                            error = %e,
                            "capture handle failed, stopping loop"
                        );
                        break;
                    }
                }
            }
            debug!(
                event.name = "capture.loop_stopped",
                device = %device,
                "capture loop stopped"
            );
        })?;
    Ok(())
}

/// Apply one decoded segment to the flow table and inbound queue.
///
/// Sequence policy: our next `seq` always follows the peer's cumulative
/// acknowledgment; our next `ack` starts at the peer's sequence number,
/// +1 for its SYN, +payload length for each PSH it sends. FIN/RST tears
/// the flow down. Only PSH segments become user data; pure ACKs and window
/// updates are consumed here.
pub(crate) fn process_packet(
    flows: &FlowTable,
    sink: &Arc<dyn FrameSink>,
    inbound_tx: &Sender<Message>,
    die_rx: &Receiver<Infallible>,
    pkt: &Decoded<'_>,
) -> ControlFlow<()> {
    if !pkt.fin && !pkt.rst {
        flows.with_entry(pkt.peer, |e| {
            e.seq = pkt.ack;
            if !e.is_ready() {
                e.ack = pkt.seq;
                e.link = Some(pkt.link.reflected());
                e.net = Some(pkt.net.reflected());
                e.sink = Some(sink.clone());
                e.latch_ready();
                debug!(
                    event.name = "capture.flow_ready",
                    peer = %pkt.peer,
                    "flow templates reflected from inbound packet"
                );
            }
        });
    }

    if pkt.syn {
        flows.with_entry(pkt.peer, |e| e.ack = e.ack.wrapping_add(1));
    } else if pkt.psh {
        flows.with_entry(pkt.peer, |e| {
            e.ack = e.ack.wrapping_add(pkt.payload.len() as u32);
        });
        let msg = Message {
            payload: pkt.payload.to_vec(),
            peer: pkt.peer,
        };
        crossbeam::select! {
            send(inbound_tx, msg) -> res => {
                if res.is_err() {
                    return ControlFlow::Break(());
                }
            }
            recv(die_rx) -> _ => return ControlFlow::Break(()),
        }
    }

    if pkt.fin || pkt.rst {
        flows.delete(&pkt.peer);
        debug!(
            event.name = "capture.flow_closed",
            peer = %pkt.peer,
            fin = pkt.fin,
            rst = pkt.rst,
            "flow entry removed"
        );
    }

    ControlFlow::Continue(())
}
