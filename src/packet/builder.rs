//! Outbound frame construction.
//!
//! A frame is link ‖ network ‖ TCP ‖ payload in one allocation. IP lengths
//! and both checksums are finalized here; the templates only supply
//! addressing. Every segment this engine emits is PSH+ACK: pure data
//! riding an established-looking flow.

use pnet::packet::{
    ethernet::MutableEthernetPacket,
    ipv4::{self, Ipv4Flags, MutableIpv4Packet},
    ipv6::MutableIpv6Packet,
    tcp::{self, MutableTcpPacket, TcpFlags},
};

use crate::packet::types::{LinkTemplate, NetTemplate};

/// Fixed advertised window: large enough that the peer never stalls, and
/// fits the 16-bit field without scaling options.
pub(crate) const TCP_WINDOW: u16 = 12580;

const ETHERNET_LEN: usize = 14;
const NULL_LEN: usize = 4;
const IPV4_LEN: usize = 20;
const IPV6_LEN: usize = 40;
const TCP_LEN: usize = 20;

/// TCP header fields that vary per segment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TcpParams {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
}

/// Serialize a complete PSH+ACK data segment from the flow's templates.
pub(crate) fn build_frame(
    link: &LinkTemplate,
    net: &NetTemplate,
    params: TcpParams,
    payload: &[u8],
) -> Vec<u8> {
    build_frame_with_flags(link, net, params, TcpFlags::PSH | TcpFlags::ACK, payload)
}

pub(crate) fn build_frame_with_flags(
    link: &LinkTemplate,
    net: &NetTemplate,
    params: TcpParams,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let link_len = match link {
        LinkTemplate::Ethernet { .. } => ETHERNET_LEN,
        LinkTemplate::Null { .. } => NULL_LEN,
    };
    let net_len = match net {
        NetTemplate::V4 { .. } => IPV4_LEN,
        NetTemplate::V6 { .. } => IPV6_LEN,
    };
    let mut frame = vec![0u8; link_len + net_len + TCP_LEN + payload.len()];

    match *link {
        LinkTemplate::Ethernet {
            src_mac,
            dst_mac,
            ethertype,
        } => {
            let mut eth = MutableEthernetPacket::new(&mut frame)
                .expect("frame buffer holds an ethernet header");
            eth.set_destination(dst_mac);
            eth.set_source(src_mac);
            eth.set_ethertype(ethertype);
        }
        LinkTemplate::Null { family } => {
            frame[..NULL_LEN].copy_from_slice(&family.to_ne_bytes());
        }
    }

    match *net {
        NetTemplate::V4 {
            src,
            dst,
            protocol,
            id,
        } => {
            let mut ip = MutableIpv4Packet::new(&mut frame[link_len..])
                .expect("frame buffer holds an ipv4 header");
            ip.set_version(4);
            ip.set_header_length((IPV4_LEN / 4) as u8);
            ip.set_dscp(0);
            ip.set_ecn(0);
            ip.set_total_length((net_len + TCP_LEN + payload.len()) as u16);
            ip.set_identification(id);
            ip.set_flags(Ipv4Flags::DontFragment);
            ip.set_fragment_offset(0);
            ip.set_ttl(64);
            ip.set_next_level_protocol(protocol);
            ip.set_source(src);
            ip.set_destination(dst);
            ip.set_checksum(0);
            let checksum = ipv4::checksum(&ip.to_immutable());
            ip.set_checksum(checksum);
        }
        NetTemplate::V6 {
            src,
            dst,
            next_header,
        } => {
            let mut ip = MutableIpv6Packet::new(&mut frame[link_len..])
                .expect("frame buffer holds an ipv6 header");
            ip.set_version(6);
            ip.set_traffic_class(0);
            ip.set_flow_label(0);
            ip.set_payload_length((TCP_LEN + payload.len()) as u16);
            ip.set_next_header(next_header);
            ip.set_hop_limit(64);
            ip.set_source(src);
            ip.set_destination(dst);
        }
    }

    let mut seg = MutableTcpPacket::new(&mut frame[link_len + net_len..])
        .expect("frame buffer holds a tcp header");
    seg.set_source(params.src_port);
    seg.set_destination(params.dst_port);
    seg.set_sequence(params.seq);
    seg.set_acknowledgement(params.ack);
    seg.set_data_offset((TCP_LEN / 4) as u8);
    seg.set_reserved(0);
    seg.set_flags(flags);
    seg.set_window(TCP_WINDOW);
    seg.set_urgent_ptr(0);
    seg.set_payload(payload);
    seg.set_checksum(0);
    let checksum = match *net {
        NetTemplate::V4 { src, dst, .. } => tcp::ipv4_checksum(&seg.to_immutable(), &src, &dst),
        NetTemplate::V6 { src, dst, .. } => tcp::ipv6_checksum(&seg.to_immutable(), &src, &dst),
    };
    seg.set_checksum(checksum);

    frame
}
