//! A manual interoperability harness: brings up a real tun device and
//! drives it with `wireguard-core` against a single peer described by a
//! KDL config file. Not part of the public API; exists so the handshake
//! and transport codec can be checked against a live WireGuard peer.
use std::net::IpAddr;
use std::time::Duration;

use base64ct::{Base64, Encoding};
use ipnet::IpNet;
use rand::rngs::OsRng;
use wireguard_core::{PeerConfig, StaticIdentity, Tunnel, TunnelConfig};
use wireguard_crypto::{X25519PublicKey as PublicKey, X25519StaticSecret as StaticSecret};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    let raw = std::fs::read_to_string("wireguard-tun-demo/tun.kdl").expect("tun.kdl config file should not be missing");
    let parsed: DemoConfig = knuffel::parse("tun.kdl", &raw).expect("tun.kdl should parse");

    let private_key = parsed.interface.private_key();
    let identity = StaticIdentity::from_private_key(private_key);
    tracing::info!(
        public_key = %Base64::encode_string(identity.public_key.as_bytes()),
        "local identity"
    );

    let peer_public = PublicKey::from(<[u8; 32]>::try_from(&*parsed.peer.key).expect("peer key must be 32 bytes"));
    let endpoint = parsed.peer.endpoint.parse().expect("peer endpoint must be host:port");
    let mut peer_config = PeerConfig::new(peer_public, endpoint).with_allowed_ips(parsed.peer.addrs.clone());
    if let Some(psk) = &parsed.peer.preshared_key {
        peer_config = peer_config.with_preshared_key(<[u8; 32]>::try_from(&**psk).expect("preshared key must be 32 bytes"));
    }
    if let Some(secs) = parsed.peer.persistent_keepalive {
        peer_config = peer_config.with_persistent_keepalive(Duration::from_secs(secs));
    }

    let tunnel_config = TunnelConfig::new(identity, peer_config)
        .with_tunnel_addresses(vec![parsed.interface.address.into()])
        .with_kill_switch(parsed.interface.kill_switch);

    let mut dev_config = tun::Configuration::default();
    dev_config.address(parsed.interface.address.addr()).netmask(parsed.interface.address.netmask()).up();
    let dev = tun::create_as_async(&dev_config).expect("failed to create tun device");

    let handle = Tunnel::start(tunnel_config, dev).await.expect("failed to start tunnel");

    tracing::info!("tunnel running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    handle.stop().await;
}

#[derive(knuffel::Decode)]
struct DemoConfig {
    #[knuffel(child)]
    interface: InterfaceSection,

    #[knuffel(child)]
    peer: PeerSection,
}

#[derive(knuffel::Decode)]
struct InterfaceSection {
    #[knuffel(child, unwrap(argument, bytes))]
    private_key: Option<Vec<u8>>,

    #[knuffel(child, unwrap(argument, str))]
    address: ipnet::Ipv4Net,

    #[knuffel(child, unwrap(argument), default = false)]
    kill_switch: bool,
}

impl InterfaceSection {
    fn private_key(&self) -> StaticSecret {
        match &self.private_key {
            Some(bytes) => StaticSecret::from(<[u8; 32]>::try_from(&**bytes).expect("private key must be 32 bytes")),
            None => {
                let key = StaticSecret::random_from_rng(OsRng);
                tracing::info!(private_key = %Base64::encode_string(key.as_bytes()), "generated a fresh private key");
                key
            }
        }
    }
}

#[derive(knuffel::Decode)]
struct PeerSection {
    #[knuffel(child, unwrap(argument, bytes))]
    key: Vec<u8>,

    #[knuffel(child, unwrap(argument, bytes))]
    preshared_key: Option<Vec<u8>>,

    #[knuffel(children(name = "addr"), unwrap(argument, str))]
    addrs: Vec<IpNet>,

    #[knuffel(child, unwrap(argument))]
    endpoint: String,

    #[knuffel(child, unwrap(argument))]
    persistent_keepalive: Option<u64>,
}
