//! The ambient error taxonomy surfaced to a host application.
use std::time::Duration;

/// Everything a tunnel operation can fail with. None of these wrap a
/// panic; each is raised at the propagation point named in its doc
/// comment, matching the policy laid out for this crate.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("tunnel configuration is invalid: {0}")]
    ConfigInvalid(String),

    #[error("sending a UDP datagram to the peer failed: {0}")]
    NetworkUnreachable(std::io::Error),

    #[error("handshake timed out after {elapsed:?} with no response from the peer")]
    HandshakeTimeout { elapsed: Duration },

    #[error("peer asked for a cookie round trip; handshake deferred")]
    PeerRejected,

    #[error("cryptographic operation failed: {0}")]
    CryptoFailure(#[from] wireguard_crypto::CryptoError),

    #[error("tunnel was stopped while an operation was in flight")]
    Retired,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
