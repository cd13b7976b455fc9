//! Header templates reflected from observed inbound packets.
//!
//! Templates are never synthesized from configuration. They are derived by
//! reversing the addresses on the first decodable packet of a flow, which
//! sidesteps ARP/NDP and routing lookups entirely: whatever path delivered
//! the peer's packet is the path our reply headers describe.

use std::net::{Ipv4Addr, Ipv6Addr};

use pnet::{
    datalink::MacAddr,
    packet::{ethernet::EtherType, ip::IpNextHeaderProtocol},
};

/// Link-layer header template, stored in *outbound* orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkTemplate {
    Ethernet {
        src_mac: MacAddr,
        dst_mac: MacAddr,
        ethertype: EtherType,
    },
    /// BSD loopback pseudo-header: a single address-family word.
    Null { family: u32 },
}

/// Network-layer header template, stored in *outbound* orientation.
///
/// TTL/hop-limit (64) and the IPv4 Don't-Fragment bit are applied at build
/// time; the template only carries what must be copied from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NetTemplate {
    V4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: IpNextHeaderProtocol,
        id: u16,
    },
    V6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        next_header: IpNextHeaderProtocol,
    },
}

impl LinkTemplate {
    /// Reverse an observed inbound header into its outbound counterpart:
    /// this host's MAC becomes the source, the peer's the destination.
    /// Loopback headers carry no direction and are copied verbatim.
    pub(crate) fn reflected(&self) -> LinkTemplate {
        match *self {
            LinkTemplate::Ethernet {
                src_mac,
                dst_mac,
                ethertype,
            } => LinkTemplate::Ethernet {
                src_mac: dst_mac,
                dst_mac: src_mac,
                ethertype,
            },
            LinkTemplate::Null { family } => LinkTemplate::Null { family },
        }
    }
}

impl NetTemplate {
    /// Reverse source and destination, preserving protocol identity and the
    /// IPv4 identification field.
    pub(crate) fn reflected(&self) -> NetTemplate {
        match *self {
            NetTemplate::V4 {
                src,
                dst,
                protocol,
                id,
            } => NetTemplate::V4 {
                src: dst,
                dst: src,
                protocol,
                id,
            },
            NetTemplate::V6 {
                src,
                dst,
                next_header,
            } => NetTemplate::V6 {
                src: dst,
                dst: src,
                next_header,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use pnet::packet::{ethernet::EtherTypes, ip::IpNextHeaderProtocols};

    use super::*;

    #[test]
    fn test_ethernet_reflection_swaps_macs() {
        let observed = LinkTemplate::Ethernet {
            src_mac: MacAddr::new(0xaa, 0, 0, 0, 0, 1),
            dst_mac: MacAddr::new(0xbb, 0, 0, 0, 0, 2),
            ethertype: EtherTypes::Ipv4,
        };
        let LinkTemplate::Ethernet {
            src_mac,
            dst_mac,
            ethertype,
        } = observed.reflected()
        else {
            panic!("reflection changed the link variant");
        };
        assert_eq!(src_mac, MacAddr::new(0xbb, 0, 0, 0, 0, 2));
        assert_eq!(dst_mac, MacAddr::new(0xaa, 0, 0, 0, 0, 1));
        assert_eq!(ethertype, EtherTypes::Ipv4);
    }

    #[test]
    fn test_null_reflection_preserves_family() {
        let observed = LinkTemplate::Null { family: 2 };
        assert_eq!(observed.reflected(), observed);
    }

    #[test]
    fn test_v4_reflection() {
        let observed = NetTemplate::V4 {
            src: Ipv4Addr::new(10, 0, 0, 2),
            dst: Ipv4Addr::new(10, 0, 0, 1),
            protocol: IpNextHeaderProtocols::Tcp,
            id: 0x1234,
        };
        let NetTemplate::V4 {
            src,
            dst,
            protocol,
            id,
        } = observed.reflected()
        else {
            panic!("reflection changed the network variant");
        };
        assert_eq!(src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(dst, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(protocol, IpNextHeaderProtocols::Tcp);
        assert_eq!(id, 0x1234);
    }

    #[test]
    fn test_v6_reflection() {
        let observed = NetTemplate::V6 {
            src: "2001:db8::2".parse().unwrap(),
            dst: "2001:db8::1".parse().unwrap(),
            next_header: IpNextHeaderProtocols::Tcp,
        };
        let NetTemplate::V6 {
            src,
            dst,
            next_header,
        } = observed.reflected()
        else {
            panic!("reflection changed the network variant");
        };
        assert_eq!(src, "2001:db8::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(dst, "2001:db8::2".parse::<Ipv6Addr>().unwrap());
        assert_eq!(next_header, IpNextHeaderProtocols::Tcp);
    }
}
