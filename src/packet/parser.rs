//! Captured-frame decoding.
//!
//! Only frames that resolve down to a TCP segment are of interest; anything
//! else is skipped silently. Fragmented IPv4 and IPv6 extension-header
//! chains are not supported: the BPF filters match TCP header fields that
//! only exist in an unfragmented first segment.

use std::net::{IpAddr, SocketAddr};

use pcap::Linktype;
use pnet::packet::{
    ethernet::{EtherTypes, EthernetPacket},
    ip::IpNextHeaderProtocols,
    ipv4::Ipv4Packet,
    ipv6::Ipv6Packet,
    tcp::{TcpFlags, TcpPacket},
};

use crate::packet::types::{LinkTemplate, NetTemplate};

const ETHERNET_LEN: usize = 14;
const IPV6_LEN: usize = 40;
const NULL_LEN: usize = 4;

/// BSD loopback address families carried in the DLT_NULL pseudo-header.
const AF_INET: u32 = 2;
const AF_INET6_FAMILIES: [u32; 4] = [10, 24, 28, 30];

/// One captured TCP segment, reduced to what the flow machinery needs.
/// `link` and `net` are in observed (inbound) orientation.
#[derive(Debug)]
pub(crate) struct Decoded<'p> {
    pub peer: SocketAddr,
    pub link: LinkTemplate,
    pub net: NetTemplate,
    pub seq: u32,
    pub ack: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub payload: &'p [u8],
}

/// Decode a raw captured frame. `None` means "not ours": non-TCP,
/// truncated, or a link type this engine does not speak.
pub(crate) fn decode(linktype: Linktype, data: &[u8]) -> Option<Decoded<'_>> {
    if linktype == Linktype::ETHERNET {
        let eth = EthernetPacket::new(data)?;
        let link = LinkTemplate::Ethernet {
            src_mac: eth.get_source(),
            dst_mac: eth.get_destination(),
            ethertype: eth.get_ethertype(),
        };
        match eth.get_ethertype() {
            EtherTypes::Ipv4 => decode_ipv4(link, &data[ETHERNET_LEN..]),
            EtherTypes::Ipv6 => decode_ipv6(link, &data[ETHERNET_LEN..]),
            _ => None,
        }
    } else if linktype == Linktype::NULL || linktype == Linktype::LOOP {
        if data.len() < NULL_LEN {
            return None;
        }
        let raw = [data[0], data[1], data[2], data[3]];
        // DLT_NULL stores the family in host byte order, DLT_LOOP in
        // network byte order.
        let family = if linktype == Linktype::LOOP {
            u32::from_be_bytes(raw)
        } else {
            u32::from_ne_bytes(raw)
        };
        let link = LinkTemplate::Null { family };
        if family == AF_INET {
            decode_ipv4(link, &data[NULL_LEN..])
        } else if AF_INET6_FAMILIES.contains(&family) {
            decode_ipv6(link, &data[NULL_LEN..])
        } else {
            None
        }
    } else {
        None
    }
}

fn decode_ipv4(link: LinkTemplate, data: &[u8]) -> Option<Decoded<'_>> {
    let ip = Ipv4Packet::new(data)?;
    if ip.get_version() != 4 {
        return None;
    }
    let header_len = usize::from(ip.get_header_length()) * 4;
    let total_len = usize::from(ip.get_total_length());
    if header_len < Ipv4Packet::minimum_packet_size() || total_len < header_len {
        return None;
    }
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
        return None;
    }
    // Ethernet frames are padded to 60 bytes; the IP total length, not the
    // capture length, bounds the segment.
    let end = total_len.min(data.len());
    if end < header_len {
        return None;
    }
    let net = NetTemplate::V4 {
        src: ip.get_source(),
        dst: ip.get_destination(),
        protocol: ip.get_next_level_protocol(),
        id: ip.get_identification(),
    };
    decode_tcp(link, net, IpAddr::V4(ip.get_source()), &data[header_len..end])
}

fn decode_ipv6(link: LinkTemplate, data: &[u8]) -> Option<Decoded<'_>> {
    let ip = Ipv6Packet::new(data)?;
    if ip.get_version() != 6 {
        return None;
    }
    if ip.get_next_header() != IpNextHeaderProtocols::Tcp {
        return None;
    }
    let payload_len = usize::from(ip.get_payload_length());
    let end = (IPV6_LEN + payload_len).min(data.len());
    let net = NetTemplate::V6 {
        src: ip.get_source(),
        dst: ip.get_destination(),
        next_header: ip.get_next_header(),
    };
    decode_tcp(link, net, IpAddr::V6(ip.get_source()), &data[IPV6_LEN..end])
}

fn decode_tcp<'p>(
    link: LinkTemplate,
    net: NetTemplate,
    src_ip: IpAddr,
    data: &'p [u8],
) -> Option<Decoded<'p>> {
    let seg = TcpPacket::new(data)?;
    let header_len = usize::from(seg.get_data_offset()) * 4;
    if header_len < TcpPacket::minimum_packet_size() || data.len() < header_len {
        return None;
    }
    let flags = seg.get_flags();
    Some(Decoded {
        peer: SocketAddr::new(src_ip, seg.get_source()),
        link,
        net,
        seq: seg.get_sequence(),
        ack: seg.get_acknowledgement(),
        syn: flags & TcpFlags::SYN != 0,
        fin: flags & TcpFlags::FIN != 0,
        rst: flags & TcpFlags::RST != 0,
        psh: flags & TcpFlags::PSH != 0,
        payload: &data[header_len..],
    })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pnet::{
        datalink::MacAddr,
        packet::{ethernet::EtherTypes, tcp::TcpFlags},
    };

    use super::*;
    use crate::packet::builder::{build_frame_with_flags, TcpParams};

    fn eth_link() -> LinkTemplate {
        LinkTemplate::Ethernet {
            src_mac: MacAddr::new(2, 0, 0, 0, 0, 0xaa),
            dst_mac: MacAddr::new(2, 0, 0, 0, 0, 0xbb),
            ethertype: EtherTypes::Ipv4,
        }
    }

    fn v4_net() -> NetTemplate {
        NetTemplate::V4 {
            src: Ipv4Addr::new(192, 168, 1, 5),
            dst: Ipv4Addr::new(192, 168, 1, 9),
            protocol: IpNextHeaderProtocols::Tcp,
            id: 99,
        }
    }

    fn params() -> TcpParams {
        TcpParams {
            src_port: 40000,
            dst_port: 9000,
            seq: 111,
            ack: 222,
        }
    }

    #[test]
    fn test_decode_ethernet_ipv4_psh() {
        let frame = build_frame_with_flags(
            &eth_link(),
            &v4_net(),
            params(),
            TcpFlags::PSH | TcpFlags::ACK,
            b"payload",
        );
        let decoded = decode(Linktype::ETHERNET, &frame).unwrap();

        assert_eq!(decoded.peer.to_string(), "192.168.1.5:40000");
        assert_eq!(decoded.seq, 111);
        assert_eq!(decoded.ack, 222);
        assert!(decoded.psh);
        assert!(!decoded.syn && !decoded.fin && !decoded.rst);
        assert_eq!(decoded.payload, b"payload");
        assert_eq!(decoded.link, eth_link());
        assert_eq!(decoded.net, v4_net());
    }

    #[test]
    fn test_decode_syn_ack() {
        let frame = build_frame_with_flags(
            &eth_link(),
            &v4_net(),
            params(),
            TcpFlags::SYN | TcpFlags::ACK,
            b"",
        );
        let decoded = decode(Linktype::ETHERNET, &frame).unwrap();
        assert!(decoded.syn);
        assert!(!decoded.psh);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_decode_null_ipv4() {
        let frame = build_frame_with_flags(
            &LinkTemplate::Null { family: AF_INET },
            &v4_net(),
            params(),
            TcpFlags::PSH | TcpFlags::ACK,
            b"lo",
        );
        let decoded = decode(Linktype::NULL, &frame).unwrap();
        assert_eq!(decoded.link, LinkTemplate::Null { family: AF_INET });
        assert_eq!(decoded.payload, b"lo");
    }

    #[test]
    fn test_decode_ethernet_ipv6() {
        let link = LinkTemplate::Ethernet {
            src_mac: MacAddr::new(2, 0, 0, 0, 0, 0xaa),
            dst_mac: MacAddr::new(2, 0, 0, 0, 0, 0xbb),
            ethertype: EtherTypes::Ipv6,
        };
        let net = NetTemplate::V6 {
            src: "fe80::1".parse().unwrap(),
            dst: "fe80::2".parse().unwrap(),
            next_header: IpNextHeaderProtocols::Tcp,
        };
        let frame =
            build_frame_with_flags(&link, &net, params(), TcpFlags::PSH | TcpFlags::ACK, b"six");
        let decoded = decode(Linktype::ETHERNET, &frame).unwrap();
        assert_eq!(decoded.peer.to_string(), "[fe80::1]:40000");
        assert_eq!(decoded.payload, b"six");
    }

    #[test]
    fn test_ethernet_padding_excluded_from_payload() {
        let mut frame = build_frame_with_flags(
            &eth_link(),
            &v4_net(),
            params(),
            TcpFlags::PSH | TcpFlags::ACK,
            b"ab",
        );
        // Pad to the 60-byte ethernet minimum as a NIC would.
        frame.resize(60, 0);
        let decoded = decode(Linktype::ETHERNET, &frame).unwrap();
        assert_eq!(decoded.payload, b"ab");
    }

    #[test]
    fn test_decode_rejects_non_tcp_ethertype() {
        let mut frame = build_frame_with_flags(
            &eth_link(),
            &v4_net(),
            params(),
            TcpFlags::PSH | TcpFlags::ACK,
            b"",
        );
        // Corrupt the ethertype to ARP.
        frame[12] = 0x08;
        frame[13] = 0x06;
        assert!(decode(Linktype::ETHERNET, &frame).is_none());
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let frame = build_frame_with_flags(
            &eth_link(),
            &v4_net(),
            params(),
            TcpFlags::PSH | TcpFlags::ACK,
            b"",
        );
        assert!(decode(Linktype::ETHERNET, &frame[..20]).is_none());
        assert!(decode(Linktype::ETHERNET, &[]).is_none());
    }

    #[test]
    fn test_decode_rejects_unknown_linktype() {
        let frame = build_frame_with_flags(
            &eth_link(),
            &v4_net(),
            params(),
            TcpFlags::PSH | TcpFlags::ACK,
            b"",
        );
        assert!(decode(Linktype(147), &frame).is_none());
    }
}
