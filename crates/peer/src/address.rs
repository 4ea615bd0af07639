use crate::transport::SwarmPeer;
use std::net::Ipv4Addr;

/// Port that selects the secure websocket scheme for the rendezvous node.
pub const SECURE_RENDEZVOUS_PORT: u16 = 443;

/// Builds the multiaddr of the rendezvous node.
///
/// A dotted-quad host is addressed with `/ip4`, anything else with `/dns4`.
/// Port 443 selects `wss`, every other port plain `ws`.
pub fn rendezvous_multiaddr(host: &str, port: u16) -> String {
    let family = if host.parse::<Ipv4Addr>().is_ok() {
        "ip4"
    } else {
        "dns4"
    };
    let ws = if port == SECURE_RENDEZVOUS_PORT {
        "wss"
    } else {
        "ws"
    };
    format!("/{family}/{host}/tcp/{port}/{ws}")
}

/// Renders a connected peer as a single dialable address, or `None` when
/// the transport has no address for it.
pub fn peer_address(peer: &SwarmPeer) -> Option<String> {
    let addr = peer.addr.as_deref()?;
    if addr.contains("/p2p/") {
        return Some(addr.to_string());
    }
    Some(format!("{}/p2p/{}", addr.trim_end_matches('/'), peer.peer))
}

/// Most recently connected first, unaddressable peers dropped.
pub fn peer_addresses(mut peers: Vec<SwarmPeer>) -> Vec<String> {
    peers.reverse();
    peers.iter().filter_map(peer_address).collect()
}
