//! Capture interface discovery.
//!
//! Interfaces are never configured: the outbound path is learned from the
//! kernel's own routing decision (a throwaway UDP socket), and bind paths
//! are matched against the address lists the capture library reports.

use std::net::{IpAddr, SocketAddr, UdpSocket};

use pcap::Device;
use tracing::debug;

use crate::error::{Error, Result};

fn list_devices() -> Result<Vec<Device>> {
    Device::list().map_err(|e| Error::CaptureOpen {
        device: "*".to_string(),
        reason: e.to_string(),
    })
}

/// Find the interface the kernel routes through to reach `dest`, along with
/// the local address the kernel picked for it.
///
/// The scratch UDP socket never sends a datagram; `connect` alone is enough
/// to make the kernel commit to a source address. The chosen (IP, port) is
/// returned so the caller can reuse it for the shadow TCP dial.
pub(crate) fn lookup_outbound(dest: SocketAddr) -> Result<(Device, SocketAddr)> {
    let bind: SocketAddr = if dest.is_ipv4() {
        "0.0.0.0:0".parse().expect("literal wildcard address")
    } else {
        "[::]:0".parse().expect("literal wildcard address")
    };
    let probe = UdpSocket::bind(bind).map_err(|e| Error::Resolve(e.to_string()))?;
    probe
        .connect(dest)
        .map_err(|e| Error::Resolve(e.to_string()))?;
    let local = probe
        .local_addr()
        .map_err(|e| Error::Resolve(e.to_string()))?;
    drop(probe);

    let device = device_with_address(local.ip())?;
    debug!(
        event.name = "iface.outbound_selected",
        device = %device.name,
        local = %local,
        remote = %dest,
        "selected outbound capture interface"
    );
    Ok((device, local))
}

/// Find the interface whose address list contains `ip`.
pub(crate) fn lookup_bound(ip: IpAddr) -> Result<Device> {
    let device = device_with_address(ip)?;
    debug!(
        event.name = "iface.bound_selected",
        device = %device.name,
        ip = %ip,
        "selected capture interface for bound address"
    );
    Ok(device)
}

/// Every interface reporting at least one address (wildcard bind path).
/// Devices that later refuse to open are skipped by the caller.
pub(crate) fn all_devices() -> Result<Vec<Device>> {
    let devices: Vec<Device> = list_devices()?
        .into_iter()
        .filter(|d| !d.addresses.is_empty())
        .collect();
    if devices.is_empty() {
        return Err(Error::NoInterface);
    }
    Ok(devices)
}

fn device_with_address(ip: IpAddr) -> Result<Device> {
    list_devices()?
        .into_iter()
        .find(|d| d.addresses.iter().any(|a| a.addr == ip))
        .ok_or(Error::NoInterface)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_with_address_no_match() {
        // 192.0.2.0/24 is TEST-NET-1, never assigned to a local interface.
        let err = device_with_address("192.0.2.123".parse().unwrap()).unwrap_err();
        assert!(matches!(err, Error::NoInterface));
    }
}
