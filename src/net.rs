//! Listening address discovery.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Public address used only to let the OS pick an outbound interface.
/// Nothing is sent to it.
const ROUTE_TARGET: (Ipv4Addr, u16) = (Ipv4Addr::new(192, 0, 2, 1), 9);

/// Returns a non-loopback address of this host, or the unspecified address
/// if none can be found.
///
/// Connecting a UDP socket transmits nothing; it only resolves the local
/// address of the interface that routes towards the documentation address.
pub fn discover_bind_address() -> IpAddr {
    outbound_route()
        .filter(|addr| !addr.is_loopback() && !addr.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn outbound_route() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(ROUTE_TARGET).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
