// Dotted-quad address validation for `ControlServer::register_proxy`.
//
// The only validation failure in the server: both the simulation and the
// client endpoint must be four dot-separated decimal octets in 0..=255.
// Anything else (host names, IPv6, empty parts, out-of-range numbers) is
// rejected and leaves the server unregistered.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::ServerError;

/// Parse `a.b.c.d` where every part is a decimal number in 0..=255.
pub fn parse_ipv4_octets(address: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut parts = address.split('.');
    for octet in &mut octets {
        *octet = parts.next()?.parse::<u8>().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(Ipv4Addr::from(octets))
}

/// The validated endpoints a proxy registered with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerEndpoints {
    /// Endpoint of the simulation-side protocol (served by the host, not by
    /// this crate).
    pub simulation: SocketAddrV4,
    /// Endpoint clients connect to.
    pub client: SocketAddrV4,
}

impl ServerEndpoints {
    pub fn parse(
        sim_host: &str,
        sim_port: u16,
        client_host: &str,
        client_port: u16,
    ) -> Result<Self, ServerError> {
        let sim_ip = parse_ipv4_octets(sim_host).ok_or_else(|| ServerError::InvalidAddress {
            role: "simulation",
            address: sim_host.to_string(),
        })?;
        let client_ip =
            parse_ipv4_octets(client_host).ok_or_else(|| ServerError::InvalidAddress {
                role: "client",
                address: client_host.to_string(),
            })?;
        Ok(Self {
            simulation: SocketAddrV4::new(sim_ip, sim_port),
            client: SocketAddrV4::new(client_ip, client_port),
        })
    }
}
