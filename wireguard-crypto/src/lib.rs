//! The Noise_IKpsk2 handshake engine and ChaCha20-Poly1305 transport codec
//! at the heart of a WireGuard tunnel.
//!
//! This crate is deliberately `no_std` and allocation-free: every function
//! here is a pure transformation of fixed-size byte arrays, with no I/O
//! and no notion of "the current time" beyond what callers pass in. The
//! session bookkeeping, retry policy, and actual socket/tun plumbing live
//! one layer up, in `wireguard-core`.
#![no_std]

use core::net::SocketAddr;
use core::ops::ControlFlow;

use rand_core::{CryptoRng, RngCore};
use tai64::Tai64N;
use x25519_dalek::{PublicKey, StaticSecret};
use zerocopy::{transmute_mut, AsBytes, FromBytes, FromZeroes};
use zeroize::{Zeroize, ZeroizeOnDrop};

use wireguard_types::{
    Cookie, EncryptedCookie, EncryptedEmpty, EncryptedPublicKey, EncryptedTimestamp, HandshakeInit,
    HandshakeResp, Mac, Tag, MSG_FIRST, MSG_SECOND,
};

mod prim;

pub use prim::{hash, mac, transport_open, transport_seal, AeadKey as Key, HandshakeState};
pub use wireguard_types::{Cookie, DataHeader, Tag, MSG_COOKIE, MSG_DATA};
pub use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

#[cfg(any(test, wireguard_unsafe_logging))]
extern crate std;

/// Logs secret-adjacent handshake detail that must never reach a release
/// build's log sink. Compiled out entirely unless explicitly enabled for
/// local debugging, so there is no runtime cost (or leak risk) by default.
macro_rules! unsafe_log {
    ($($t:tt)*) => {
        match core::format_args!($($t)*) {
            #[cfg(any(test, wireguard_unsafe_logging))]
            args => std::eprintln!("{args}"),
            #[cfg(not(any(test, wireguard_unsafe_logging)))]
            _ => {}
        };
    }
}

/// Failures the crypto layer can raise. None of these are panics; all are
/// expected outcomes of processing attacker-controlled or merely stale
/// network input. `wireguard-core` maps these onto the user-facing error
/// taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// An AEAD tag failed to verify: the message was tampered with, used
    /// the wrong key, or is simply garbage.
    AeadTagMismatch,
    /// A Diffie-Hellman output was not contributory (an all-zero result,
    /// from a low-order point used as an input). See property **P6**.
    LowOrderDhOutput,
    /// mac1 or mac2 did not match the locally recomputed value.
    MacMismatch,
}

fn mac1_key(spk: &PublicKey) -> Key {
    Key::from(hash(&[&prim::LABEL_MAC1, spk.as_bytes()]))
}

fn cookie_key(spk: &PublicKey) -> Key {
    Key::from(hash(&[&prim::LABEL_COOKIE, spk.as_bytes()]))
}

/// Derives a cookie bound to a source address, under this responder's
/// rotating cookie secret.
#[derive(Zeroize, ZeroizeOnDrop, Default)]
pub struct CookieState {
    key: [u8; 32],
}

impl CookieState {
    pub fn generate(&mut self, rng: &mut (impl CryptoRng + RngCore)) {
        rng.fill_bytes(&mut self.key);
    }

    pub fn new_cookie(&self, addr: SocketAddr) -> Cookie {
        // There's no specified encoding here; it just needs to bind the
        // source address.
        let mut a = [0; 18];
        match addr.ip() {
            core::net::IpAddr::V4(ipv4) => a[..4].copy_from_slice(&ipv4.octets()),
            core::net::IpAddr::V6(ipv6) => a[..16].copy_from_slice(&ipv6.octets()),
        }
        a[16..].copy_from_slice(&addr.port().to_le_bytes());
        Cookie(mac(&self.key, &a))
    }
}

/// Our own long-lived identity: a private key, the public key it was
/// derived from, and the two keys cached from that public key that would
/// otherwise be recomputed on every handshake attempt.
pub struct LocalIdentity {
    pub private_key: StaticSecret,
    pub public_key: PublicKey,
    mac1_key: Key,
    cookie_key: Key,
}

impl LocalIdentity {
    pub fn new(private_key: StaticSecret) -> Self {
        let public_key = PublicKey::from(&private_key);
        Self {
            mac1_key: mac1_key(&public_key),
            cookie_key: cookie_key(&public_key),
            public_key,
            private_key,
        }
    }

    /// Key for verifying mac1 on messages addressed to us.
    pub fn mac1_key(&self) -> &Key {
        &self.mac1_key
    }

    /// Key under which a cookie reply payload addressed to us is sealed.
    pub fn cookie_reply_key(&self) -> &Key {
        &self.cookie_key
    }
}

/// The remote peer's identity, as configured ahead of time: public key
/// and preshared key, plus the same two cached derived keys.
pub struct RemoteIdentity {
    pub public_key: PublicKey,
    pub preshared_key: [u8; 32],
    mac1_key: Key,
    cookie_key: Key,
}

impl RemoteIdentity {
    pub fn new(public_key: PublicKey, preshared_key: [u8; 32]) -> Self {
        Self {
            mac1_key: mac1_key(&public_key),
            cookie_key: cookie_key(&public_key),
            public_key,
            preshared_key,
        }
    }

    /// Key under which mac1 is computed on messages we send to this peer.
    pub fn mac1_key(&self) -> &Key {
        &self.mac1_key
    }

    /// Key under which a cookie reply payload addressed to this peer is
    /// sealed.
    pub fn cookie_reply_key(&self) -> &Key {
        &self.cookie_key
    }
}

/// Both handshake messages are protected by MACs that let a receiver rule
/// out invalid messages quickly.
///
/// mac1 verifies that the message was built by someone who knows our
/// static public key, and is always checked. mac2 is only checked once
/// the caller has decided it is under enough load to ask unacknowledged
/// initiators to prove a round trip with a cookie first.
pub trait HasMac: FromBytes + AsBytes + Sized {
    fn verify<'m>(
        &'m mut self,
        mac1_key: &Key,
        overloaded: bool,
        cookie: Option<&CookieState>,
        addr: SocketAddr,
    ) -> Result<ControlFlow<Cookie, &'m mut Self>, CryptoError> {
        self.verify_mac1(mac1_key)?;

        if overloaded {
            let cookie = cookie.ok_or(CryptoError::MacMismatch)?.new_cookie(addr);
            if self.verify_mac2(&cookie).is_err() {
                return Ok(ControlFlow::Break(cookie));
            }
        }

        Ok(ControlFlow::Continue(self))
    }

    fn verify_mac1(&self, mac1_key: &Key) -> Result<(), CryptoError> {
        use subtle::ConstantTimeEq;
        let actual = self.compute_mac1(mac1_key);
        if actual.ct_ne(self.get_mac1()).into() {
            unsafe_log!("invalid mac1");
            Err(CryptoError::MacMismatch)
        } else {
            Ok(())
        }
    }

    fn verify_mac2(&self, cookie: &Cookie) -> Result<(), CryptoError> {
        use subtle::ConstantTimeEq;
        let actual = self.compute_mac2(cookie);
        if actual.ct_ne(self.get_mac2()).into() {
            unsafe_log!("invalid mac2");
            Err(CryptoError::MacMismatch)
        } else {
            Ok(())
        }
    }

    fn compute_mac1(&self, mac1_key: &Key) -> Mac;
    fn compute_mac2(&self, cookie: &Cookie) -> Mac;
    fn get_mac1(&self) -> &Mac;
    fn get_mac2(&self) -> &Mac;
}

macro_rules! mac_protected {
    ($ty:ident) => {
        impl HasMac for $ty {
            fn compute_mac1(&self, mac1_key: &Key) -> Mac {
                let offset = core::mem::offset_of!($ty, mac1);
                mac(mac1_key, &self.as_bytes()[..offset])
            }

            fn compute_mac2(&self, cookie: &Cookie) -> Mac {
                let offset = core::mem::offset_of!($ty, mac2);
                mac(&cookie.0, &self.as_bytes()[..offset])
            }

            fn get_mac1(&self) -> &Mac {
                &self.mac1
            }

            fn get_mac2(&self) -> &Mac {
                &self.mac2
            }
        }
    };
}

mac_protected!(HandshakeInit);
mac_protected!(HandshakeResp);

pub fn decrypt_cookie<'c>(cookie: &'c mut EncryptedCookie, key: &Key, nonce: &[u8; 24], aad: &[u8]) -> Result<Cookie, CryptoError> {
    prim::decrypt_cookie(cookie, key, nonce, aad)
}

pub fn encrypt_cookie(cookie: Cookie, key: &Key, nonce: &[u8; 24], aad: &[u8]) -> EncryptedCookie {
    prim::encrypt_cookie(cookie, key, nonce, aad)
}

// ---- Noise IKpsk2 ----
//
// WireGuard uses a slightly modified Noise IKpsk2 handshake; see
// https://noiseprotocol.org/noise.html. The pattern:
//   <- s
//   -> e, es, s, ss
//   <- e, ee, se, psk
//
// The initiator must already know the responder's static public key. It
// sends an ephemeral public key and its own encrypted static public key;
// the responder sends back only its ephemeral public key.

/// A `HandshakeInit` whose static key and timestamp have already been
/// opened; safe to read without re-deriving the session keys.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(transparent)]
pub struct DecryptedHandshakeInit(HandshakeInit);

impl DecryptedHandshakeInit {
    #[inline(always)]
    pub fn static_key(&self) -> PublicKey {
        PublicKey::from(self.0.static_key.msg)
    }

    #[inline(always)]
    pub fn timestamp(&self) -> &[u8; 12] {
        &self.0.timestamp.msg
    }

    #[inline(always)]
    pub fn sender(&self) -> u32 {
        self.0.sender.get()
    }

    #[inline(always)]
    pub fn ephemeral_key(&self) -> PublicKey {
        PublicKey::from(self.0.ephemeral_key)
    }
}

/// Builds the first Noise message. `esk_i` is the initiator's ephemeral
/// keypair for this attempt; callers generate it fresh for real traffic,
/// or fix it to reproduce an interop test vector (specification §8,
/// scenario **S1**).
pub fn create_initiation(
    hs: &mut HandshakeState,
    local: &LocalIdentity,
    remote: &RemoteIdentity,
    esk_i: &StaticSecret,
    now: Tai64N,
    sender: u32,
    cookie: Option<&Cookie>,
) -> Result<HandshakeInit, CryptoError> {
    use zerocopy::byteorder::little_endian;

    // <- s:
    let epk_i = PublicKey::from(esk_i);
    hs.mix_hash(remote.public_key.as_bytes());

    // -> e: wireguard goes off-spec here with an extra mix_chain.
    hs.mix_chain(epk_i.as_bytes());
    hs.mix_hash(epk_i.as_bytes());

    // -> es:
    let k = hs.mix_key_dh(esk_i, &remote.public_key)?;
    let static_key = EncryptedPublicKey::encrypt_and_hash(local.public_key.to_bytes(), hs, &k);

    // -> ss:
    let k = hs.mix_key_dh(&local.private_key, &remote.public_key)?;
    let timestamp = EncryptedTimestamp::encrypt_and_hash(now.to_bytes(), hs, &k);

    let mut msg = HandshakeInit {
        msg_type: little_endian::U32::new(MSG_FIRST),
        sender: little_endian::U32::new(sender),
        ephemeral_key: epk_i.to_bytes(),
        static_key,
        timestamp,
        mac1: [0; 16],
        mac2: [0; 16],
    };
    msg.mac1 = msg.compute_mac1(&remote.mac1_key);
    if let Some(cookie) = cookie {
        msg.mac2 = msg.compute_mac2(cookie);
    }
    Ok(msg)
}

/// Opens the first Noise message. On success, `hs` holds the symmetric
/// state needed to build the response; `init` is reinterpreted in place
/// as a [`DecryptedHandshakeInit`] so callers can read the now-plaintext
/// static key and timestamp without another decryption pass.
pub fn consume_initiation<'m>(
    init: &'m mut HandshakeInit,
    hs: &mut HandshakeState,
    local: &LocalIdentity,
) -> Result<&'m mut DecryptedHandshakeInit, CryptoError> {
    // <- s:
    hs.mix_hash(local.public_key.as_bytes());

    // -> e:
    hs.mix_chain(&init.ephemeral_key);
    hs.mix_hash(&init.ephemeral_key);

    // -> es:
    let epk_i = PublicKey::from(init.ephemeral_key);
    let k = hs.mix_key_dh(&local.private_key, &epk_i)?;

    unsafe_log!("decrypting initiator's static key");
    let spk_i = *init.static_key.decrypt_and_hash(hs, &k)?;
    let spk_i = PublicKey::from(spk_i);
    unsafe_log!("decrypted initiator static key {spk_i:?}");

    // -> ss:
    let k = hs.mix_key_dh(&local.private_key, &spk_i)?;

    unsafe_log!("decrypting initiator's timestamp");
    init.timestamp.decrypt_and_hash(hs, &k)?;

    Ok(transmute_mut!(init))
}

/// Builds the second Noise message, mixing in the preshared key and
/// completing this side's handshake transcript.
pub fn create_response(
    hs: &mut HandshakeState,
    init: &DecryptedHandshakeInit,
    esk_r: &StaticSecret,
    remote: &RemoteIdentity,
    sender: u32,
    cookie: Option<&Cookie>,
) -> Result<HandshakeResp, CryptoError> {
    use zerocopy::byteorder::little_endian;

    // <- e:
    let epk_r = PublicKey::from(esk_r);
    hs.mix_chain(epk_r.as_bytes());
    hs.mix_hash(epk_r.as_bytes());

    // <- ee:
    let epk_i = init.ephemeral_key();
    hs.mix_dh(esk_r, &epk_i)?;

    // <- se:
    let spk_i = init.static_key();
    hs.mix_dh(esk_r, &spk_i)?;

    // <- psk:
    let k = hs.mix_key_and_hash(&remote.preshared_key);
    let empty = EncryptedEmpty::encrypt_and_hash([], hs, &k);

    let mut msg = HandshakeResp {
        msg_type: little_endian::U32::new(MSG_SECOND),
        sender: little_endian::U32::new(sender),
        receiver: little_endian::U32::new(init.sender()),
        ephemeral_key: epk_r.to_bytes(),
        empty,
        mac1: [0; 16],
        mac2: [0; 16],
    };
    msg.mac1 = msg.compute_mac1(&remote.mac1_key);
    if let Some(cookie) = cookie {
        msg.mac2 = msg.compute_mac2(cookie);
    }
    Ok(msg)
}

/// Opens the second Noise message and mixes in the preshared key,
/// completing the initiator's handshake transcript. `esk_i` must be the
/// same ephemeral secret passed to [`create_initiation`] for this
/// attempt.
pub fn consume_response(
    resp: &mut HandshakeResp,
    hs: &mut HandshakeState,
    local: &LocalIdentity,
    remote: &RemoteIdentity,
    esk_i: &StaticSecret,
) -> Result<(), CryptoError> {
    // <- e:
    let epk_r = PublicKey::from(resp.ephemeral_key);
    hs.mix_chain(epk_r.as_bytes());
    hs.mix_hash(epk_r.as_bytes());

    // <- ee:
    hs.mix_dh(esk_i, &epk_r)?;

    // <- se:
    hs.mix_dh(&local.private_key, &epk_r)?;

    // <- psk:
    let k = hs.mix_key_and_hash(&remote.preshared_key);

    unsafe_log!("decrypting handshake response payload");
    resp.empty.decrypt_and_hash(hs, &k)?;

    Ok(())
}

/// Derives the pair of transport keys from a completed handshake. Both
/// sides compute `(k1, k2)` identically; the initiator sends with `k1`
/// and receives with `k2`, and the responder swaps them, so that
/// `initiator.send == responder.recv` and vice versa (property **P4**).
pub fn split_transport_keys(hs: &mut HandshakeState, is_initiator: bool) -> (Key, Key) {
    let (k1, k2) = hs.split();
    if is_initiator {
        (k1, k2)
    } else {
        (k2, k1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_are_mac_protected_at_the_expected_offsets() {
        assert_eq!(core::mem::offset_of!(HandshakeInit, mac1), 116);
        assert_eq!(core::mem::offset_of!(HandshakeInit, mac2), 132);
        assert_eq!(core::mem::offset_of!(HandshakeResp, mac1), 60);
        assert_eq!(core::mem::offset_of!(HandshakeResp, mac2), 76);
    }

    #[test]
    fn full_handshake_between_initiator_and_responder_derives_matching_transport_keys() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let mut rng = StdRng::seed_from_u64(42);
        let sk_i = StaticSecret::random_from_rng(&mut rng);
        let sk_r = StaticSecret::random_from_rng(&mut rng);
        let psk = [7u8; 32];

        let local_i = LocalIdentity::new(sk_i.clone());
        let local_r = LocalIdentity::new(sk_r.clone());
        let remote_of_i = RemoteIdentity::new(local_r.public_key, psk);
        let remote_of_r = RemoteIdentity::new(local_i.public_key, psk);

        let esk_i = StaticSecret::random_from_rng(&mut rng);
        let esk_r = StaticSecret::random_from_rng(&mut rng);

        let mut hs_i = HandshakeState::default();
        let mut init = create_initiation(&mut hs_i, &local_i, &remote_of_i, &esk_i, Tai64N::from_slice(&[0u8; 12]).unwrap(), 1, None).unwrap();

        let mut hs_r = HandshakeState::default();
        let decrypted = consume_initiation(&mut init, &mut hs_r, &local_r).unwrap();

        let mut resp = create_response(&mut hs_r, decrypted, &esk_r, &remote_of_r, 2, None).unwrap();
        consume_response(&mut resp, &mut hs_i, &local_i, &remote_of_i, &esk_i).unwrap();

        let (send_i, recv_i) = split_transport_keys(&mut hs_i, true);
        let (send_r, recv_r) = split_transport_keys(&mut hs_r, false);

        assert_eq!(send_i.as_slice(), recv_r.as_slice());
        assert_eq!(send_r.as_slice(), recv_i.as_slice());
    }

    #[test]
    fn tampered_initiation_mac_is_rejected() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let mut rng = StdRng::seed_from_u64(7);
        let sk_i = StaticSecret::random_from_rng(&mut rng);
        let sk_r = StaticSecret::random_from_rng(&mut rng);
        let local_i = LocalIdentity::new(sk_i);
        let local_r = LocalIdentity::new(sk_r);
        let remote_of_i = RemoteIdentity::new(local_r.public_key, [0; 32]);

        let esk_i = StaticSecret::random_from_rng(&mut rng);
        let mut hs_i = HandshakeState::default();
        let mut init = create_initiation(&mut hs_i, &local_i, &remote_of_i, &esk_i, Tai64N::from_slice(&[0u8; 12]).unwrap(), 1, None).unwrap();
        init.mac1[0] ^= 0xff;

        assert!(init.verify_mac1(&remote_of_i.mac1_key).is_err());
        let _ = local_r;
    }
}
