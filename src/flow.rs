//! Per-peer TCP flow state.
//!
//! A flow entry tracks the sequence numbers to quote on the next outbound
//! segment and the header templates reflected from the peer's traffic. The
//! one-shot `ready` latch is the only synchronization for template
//! visibility: it drops after templates, sink, and the initial ack are all
//! written under the table lock, so anyone who has observed it may read a
//! snapshot without further coordination.

use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::{
    capture::FrameSink,
    packet::types::{LinkTemplate, NetTemplate},
};

/// An inbound datagram surfaced to `read_from`.
#[derive(Debug)]
pub(crate) struct Message {
    pub payload: Vec<u8>,
    pub peer: SocketAddr,
}

/// Mutable per-peer record. Created lazily on first reference from either
/// direction; removed when the peer's FIN or RST is observed.
pub(crate) struct FlowEntry {
    /// Next outbound sequence number.
    pub seq: u32,
    /// Next outbound acknowledgment number.
    pub ack: u32,
    pub link: Option<LinkTemplate>,
    pub net: Option<NetTemplate>,
    /// Injection handle for the interface the peer's packets arrive on.
    pub sink: Option<Arc<dyn FrameSink>>,
    ready_tx: Option<Sender<Infallible>>,
    ready_rx: Receiver<Infallible>,
}

/// Read-only copy of a ready entry, taken under the table lock so a
/// `write_to` in flight keeps consistent header/sequence state even if the
/// entry is torn down concurrently.
pub(crate) struct FlowSnapshot {
    pub seq: u32,
    pub ack: u32,
    pub link: LinkTemplate,
    pub net: NetTemplate,
    pub sink: Arc<dyn FrameSink>,
}

impl FlowEntry {
    fn new() -> Self {
        let (ready_tx, ready_rx) = bounded(0);
        FlowEntry {
            seq: 0,
            ack: 0,
            link: None,
            net: None,
            sink: None,
            ready_tx: Some(ready_tx),
            ready_rx,
        }
    }

    /// Whether the templates have been installed and transmission may
    /// proceed.
    pub fn is_ready(&self) -> bool {
        self.ready_tx.is_none()
    }

    /// Latch the entry ready. Dropping the sole sender disconnects every
    /// cloned receiver, waking all waiters; the latch cannot be re-armed.
    pub fn latch_ready(&mut self) {
        self.ready_tx = None;
    }

    /// A receiver that blocks until the entry is (or already was) ready.
    pub fn ready(&self) -> Receiver<Infallible> {
        self.ready_rx.clone()
    }

    pub fn snapshot(&self) -> Option<FlowSnapshot> {
        if !self.is_ready() {
            return None;
        }
        Some(FlowSnapshot {
            seq: self.seq,
            ack: self.ack,
            link: self.link?,
            net: self.net?,
            sink: self.sink.clone()?,
        })
    }
}

/// All flows of one connection, keyed by canonical peer address.
/// `SocketAddr` equality/hashing is structural over (IP, port), so every
/// textual spelling of the same peer lands on the same entry.
#[derive(Default)]
pub(crate) struct FlowTable {
    flows: Mutex<HashMap<SocketAddr, FlowEntry>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or default-create the entry for `peer` and apply `f` under the
    /// table lock. Default creation materializes the ready latch.
    pub fn with_entry<T>(&self, peer: SocketAddr, f: impl FnOnce(&mut FlowEntry) -> T) -> T {
        let mut flows = self.flows.lock().expect("flow table lock poisoned");
        let entry = flows.entry(peer).or_insert_with(FlowEntry::new);
        f(entry)
    }

    /// Atomically remove the entry for `peer`. Dropping it disconnects its
    /// ready latch, so writers parked on the old latch re-check state.
    pub fn delete(&self, peer: &SocketAddr) {
        let mut flows = self.flows.lock().expect("flow table lock poisoned");
        flows.remove(peer);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.flows.lock().expect("flow table lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use crossbeam::channel::TryRecvError;
    use pnet::{
        datalink::MacAddr,
        packet::{ethernet::EtherTypes, ip::IpNextHeaderProtocols},
    };

    use super::*;
    use crate::capture::tests::CollectSink;

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 40000)
    }

    fn install_templates(e: &mut FlowEntry) {
        e.link = Some(LinkTemplate::Ethernet {
            src_mac: MacAddr::new(2, 0, 0, 0, 0, 1),
            dst_mac: MacAddr::new(2, 0, 0, 0, 0, 2),
            ethertype: EtherTypes::Ipv4,
        });
        e.net = Some(NetTemplate::V4 {
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
            protocol: IpNextHeaderProtocols::Tcp,
            id: 1,
        });
        e.sink = Some(Arc::new(CollectSink::default()));
        e.latch_ready();
    }

    #[test]
    fn test_single_entry_per_peer() {
        let table = FlowTable::new();
        table.with_entry(peer(), |e| e.seq = 5);
        table.with_entry(peer(), |e| assert_eq!(e.seq, 5));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_ipv6_textual_variants_share_entry() {
        let table = FlowTable::new();
        let a = SocketAddr::new(IpAddr::V6("::1".parse::<Ipv6Addr>().unwrap()), 80);
        let b: SocketAddr = "[0:0:0:0:0:0:0:1]:80".parse().unwrap();
        table.with_entry(a, |e| e.ack = 9);
        table.with_entry(b, |e| assert_eq!(e.ack, 9));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_ready_latch_fires_once_and_stays() {
        let table = FlowTable::new();
        let ready = table.with_entry(peer(), |e| {
            assert!(!e.is_ready());
            e.ready()
        });
        assert_eq!(ready.try_recv(), Err(TryRecvError::Empty));

        table.with_entry(peer(), |e| {
            install_templates(e);
            assert!(e.is_ready());
            // Latching again is a no-op.
            e.latch_ready();
            assert!(e.is_ready());
        });
        assert_eq!(ready.try_recv(), Err(TryRecvError::Disconnected));

        // Receivers taken after latching observe the same state.
        let late = table.with_entry(peer(), |e| e.ready());
        assert_eq!(late.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn test_snapshot_requires_ready() {
        let table = FlowTable::new();
        assert!(table.with_entry(peer(), |e| e.snapshot()).is_none());

        table.with_entry(peer(), |e| {
            e.seq = 100;
            e.ack = 200;
            install_templates(e);
        });
        let snap = table
            .with_entry(peer(), |e| e.snapshot())
            .expect("ready entry snapshots");
        assert_eq!(snap.seq, 100);
        assert_eq!(snap.ack, 200);
    }

    #[test]
    fn test_delete_disconnects_waiters() {
        let table = FlowTable::new();
        let ready = table.with_entry(peer(), |e| e.ready());
        table.delete(&peer());
        assert_eq!(table.len(), 0);
        // The dropped entry's latch reads as disconnected; a waiter wakes
        // and finds a fresh, not-ready entry on its next lookup.
        assert_eq!(ready.try_recv(), Err(TryRecvError::Disconnected));
        assert!(!table.with_entry(peer(), |e| e.is_ready()));
    }
}
