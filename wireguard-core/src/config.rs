//! In-memory configuration for a tunnel, owned by the host application and
//! handed to [`crate::Tunnel::start`].
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ipnet::IpNet;
use wireguard_crypto::{X25519PublicKey as PublicKey, X25519StaticSecret as StaticSecret};

use crate::consts::{DEFAULT_MTU_IPV4, DEFAULT_MTU_IPV6};
use crate::error::CoreError;

/// This tunnel's own long-lived keypair.
pub struct StaticIdentity {
    pub private_key: StaticSecret,
    pub public_key: PublicKey,
}

impl StaticIdentity {
    pub fn from_private_key(private_key: StaticSecret) -> Self {
        let public_key = PublicKey::from(&private_key);
        Self { private_key, public_key }
    }
}

/// Everything needed to reach and authenticate the single remote peer.
pub struct PeerConfig {
    pub public_key: PublicKey,
    pub preshared_key: [u8; 32],
    pub endpoint: SocketAddr,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<Duration>,
}

impl PeerConfig {
    pub fn new(public_key: PublicKey, endpoint: SocketAddr) -> Self {
        Self {
            public_key,
            preshared_key: [0; 32],
            endpoint,
            allowed_ips: Vec::new(),
            persistent_keepalive: None,
        }
    }

    pub fn with_preshared_key(mut self, psk: [u8; 32]) -> Self {
        self.preshared_key = psk;
        self
    }

    pub fn with_allowed_ips(mut self, allowed_ips: Vec<IpNet>) -> Self {
        self.allowed_ips = allowed_ips;
        self
    }

    pub fn with_persistent_keepalive(mut self, interval: Duration) -> Self {
        self.persistent_keepalive = Some(interval);
        self
    }

    pub(crate) fn permits(&self, addr: IpAddr) -> bool {
        self.allowed_ips.is_empty() || self.allowed_ips.iter().any(|net| net.contains(&addr))
    }
}

/// Top-level configuration for one tunnel. Built in-memory by the host
/// application; `wireguard-tun-demo` additionally loads one of these from
/// a KDL file for manual interoperability testing.
pub struct TunnelConfig {
    pub identity: StaticIdentity,
    pub peer: PeerConfig,
    pub tunnel_addresses: Vec<IpNet>,
    pub dns: Vec<IpAddr>,
    pub mtu: u16,
    pub kill_switch: bool,
}

impl TunnelConfig {
    pub fn new(identity: StaticIdentity, peer: PeerConfig) -> Self {
        let mtu = match peer.endpoint.ip() {
            IpAddr::V4(_) => DEFAULT_MTU_IPV4,
            IpAddr::V6(_) => DEFAULT_MTU_IPV6,
        };
        Self {
            identity,
            peer,
            tunnel_addresses: Vec::new(),
            dns: Vec::new(),
            mtu,
            kill_switch: false,
        }
    }

    pub fn with_tunnel_addresses(mut self, addrs: Vec<IpNet>) -> Self {
        self.tunnel_addresses = addrs;
        self
    }

    pub fn with_dns(mut self, dns: Vec<IpAddr>) -> Self {
        self.dns = dns;
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_kill_switch(mut self, enabled: bool) -> Self {
        self.kill_switch = enabled;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), CoreError> {
        if self.tunnel_addresses.is_empty() {
            return Err(CoreError::ConfigInvalid("tunnel_addresses must name at least one CIDR".into()));
        }
        if self.mtu < 576 {
            return Err(CoreError::ConfigInvalid(format!("mtu {} is below the minimum IP datagram size", self.mtu)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn validate_rejects_a_tunnel_with_no_addresses() {
        let mut rng = StdRng::seed_from_u64(1);
        let identity = StaticIdentity::from_private_key(StaticSecret::random_from_rng(&mut rng));
        let peer = PeerConfig::new(PublicKey::from(&StaticSecret::random_from_rng(&mut rng)), "127.0.0.1:51820".parse().unwrap());
        let config = TunnelConfig::new(identity, peer);
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_mtu_follows_endpoint_address_family() {
        let mut rng = StdRng::seed_from_u64(2);
        let identity = StaticIdentity::from_private_key(StaticSecret::random_from_rng(&mut rng));
        let peer = PeerConfig::new(PublicKey::from(&StaticSecret::random_from_rng(&mut rng)), "[::1]:51820".parse().unwrap());
        let config = TunnelConfig::new(identity, peer);
        assert_eq!(config.mtu, DEFAULT_MTU_IPV6);
    }
}
