//! The host-facing half of a WireGuard tunnel: configuration, the
//! single-peer protocol state machine, and the tun/UDP forwarder that
//! drives it. Wire-format types and the Noise handshake itself live in
//! `wireguard-types` and `wireguard-crypto`; this crate is where they
//! become a runnable tunnel.
mod config;
mod consts;
mod error;
mod forwarder;
mod peer;
mod session;
mod stats;
mod timers;
mod window;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

pub use config::{PeerConfig, StaticIdentity, TunnelConfig};
pub use error::CoreError;
pub use forwarder::TunIo;
pub use stats::{Stats, StatsSnapshot, TunnelState};

use peer::Peer;

/// A running tunnel. Dropping this without calling [`TunnelHandle::stop`]
/// leaves the forwarder task running detached; callers that care about a
/// clean shutdown should call `stop` explicitly.
pub struct TunnelHandle {
    stats: Arc<Stats>,
    state_rx: watch::Receiver<TunnelState>,
    shutdown_tx: watch::Sender<()>,
    task: JoinHandle<()>,
    epoch: std::time::Instant,
}

impl TunnelHandle {
    /// The tunnel's current lifecycle state.
    pub fn state(&self) -> TunnelState {
        self.state_rx.borrow().clone()
    }

    /// A channel that wakes up on every lifecycle transition.
    pub fn watch_state(&self) -> watch::Receiver<TunnelState> {
        self.state_rx.clone()
    }

    /// A point-in-time snapshot of traffic counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.epoch)
    }

    /// Signals the forwarder to shut down and waits for it to exit,
    /// scrubbing the peer's session keys along the way.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

/// Entry point: validates `config`, connects a UDP socket to the peer's
/// endpoint, and spawns the forwarder task that drives the handshake and
/// packet flow for as long as the returned [`TunnelHandle`] lives.
pub struct Tunnel;

impl Tunnel {
    pub async fn start<T: TunIo>(config: TunnelConfig, tun: T) -> Result<TunnelHandle, CoreError> {
        config.validate()?;

        let endpoint: SocketAddr = config.peer.endpoint;
        let bind_addr: SocketAddr = match endpoint {
            SocketAddr::V4(_) => (std::net::Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(CoreError::Io)?;
        socket.connect(endpoint).await.map_err(CoreError::Io)?;
        let socket = Arc::new(socket);

        let peer = Peer::new(&config.identity, config.peer);
        let peer = Arc::new(Mutex::new(peer));

        let stats = Arc::new(Stats::default());
        let epoch = std::time::Instant::now();
        let (state_tx, state_rx) = watch::channel(TunnelState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        info!(%endpoint, "starting tunnel forwarder");
        let task = tokio::spawn(forwarder::run(peer, tun, socket, stats.clone(), state_tx, shutdown_rx));

        Ok(TunnelHandle { stats, state_rx, shutdown_tx, task, epoch })
    }
}
