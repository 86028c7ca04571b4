//! BLAKE2s hashing/MAC/HKDF, the Noise symmetric state (`HandshakeState`),
//! and the small AEAD wrappers used to encrypt/decrypt the fixed-size
//! payloads nested inside handshake messages.
use blake2::digest::{Digest, Mac as _};
use blake2::{Blake2s256, Blake2sMac};
use chacha20poly1305::{AeadInPlace, ChaCha20Poly1305, Key, KeyInit, Nonce, XChaCha20Poly1305};
use hmac::SimpleHmac;
use x25519_dalek::{PublicKey, StaticSecret};
use zerocopy::AsBytes;
use zeroize::{Zeroize, ZeroizeOnDrop};

use wireguard_types::{Cookie, EncryptedCookie, EncryptedEmpty, EncryptedPublicKey, EncryptedTimestamp, Mac, Tag};

use crate::CryptoError;

/// `Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s`, hashed.
pub(crate) const CONSTRUCTION_HASH: [u8; 32] = [
    96, 226, 109, 174, 243, 39, 239, 192, 46, 195, 53, 226, 160, 37, 210, 208, 22, 235, 66, 6, 248,
    114, 119, 245, 45, 56, 209, 152, 139, 120, 205, 54,
];
/// `blake2s(CONSTRUCTION_HASH || "WireGuard v1 zx2c4 Jason@zx2c4.com")`.
pub(crate) const IDENTIFIER_HASH: [u8; 32] = [
    34, 17, 179, 97, 8, 26, 197, 102, 105, 18, 67, 219, 69, 138, 213, 50, 45, 156, 108, 102, 34,
    147, 232, 183, 14, 225, 156, 101, 186, 7, 158, 243,
];

pub const LABEL_MAC1: [u8; 8] = *b"mac1----";
pub const LABEL_COOKIE: [u8; 8] = *b"cookie--";

/// The AEAD key type used throughout: a plain 32-byte `GenericArray`.
pub use chacha20poly1305::Key as AeadKey;

fn transport_nonce(counter: u64) -> Nonce {
    let mut n = Nonce::default();
    n[4..].copy_from_slice(&counter.to_le_bytes());
    n
}

pub fn hash(msgs: &[&[u8]]) -> [u8; 32] {
    let mut digest = Blake2s256::default();
    for msg in msgs {
        digest.update(msg);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest.finalize());
    out
}

pub fn mac(key: &[u8], msg: &[u8]) -> Mac {
    let mut mac = Blake2sMac::<chacha20poly1305::consts::U16>::new_from_slice(key).expect("mac key is any length");
    mac.update(msg);
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn hmac_blake2s(key: &[u8], msgs: &[&[u8]]) -> [u8; 32] {
    let mut hmac = <SimpleHmac<Blake2s256> as hmac::Mac>::new_from_slice(key).expect("hmac key is any length");
    for msg in msgs {
        hmac.update(msg);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hmac.finalize().into_bytes());
    out
}

/// HKDF-BLAKE2s, specialized to emit 1, 2, or 3 thirty-two-byte outputs,
/// as WireGuard's key schedule never needs more.
pub fn hkdf<const N: usize>(chaining_key: &[u8; 32], input: &[u8]) -> [[u8; 32]; N] {
    assert!(N <= 3, "WireGuard's key schedule never needs more than 3 hkdf outputs");

    let t0 = hmac_blake2s(chaining_key, &[input]);
    let mut out = [[0u8; 32]; N];
    if N == 0 {
        return out;
    }

    let mut prev = hmac_blake2s(&t0, &[&[1]]);
    out[0] = prev;
    for i in 1..N as u8 {
        prev = hmac_blake2s(&t0, &[&prev, &[i + 1]]);
        out[i as usize] = prev;
    }
    out
}

/// Diffie-Hellman over Curve25519, rejecting shared secrets that are not
/// contributory (the all-zero low-order-point case WireGuard's spec calls
/// out explicitly): see property **P6** in the specification.
fn dh(sk: &StaticSecret, pk: &PublicKey) -> Result<[u8; 32], CryptoError> {
    let shared = sk.diffie_hellman(pk);
    if !shared.was_contributory() {
        return Err(CryptoError::LowOrderDhOutput);
    }
    Ok(*shared.as_bytes())
}

/// The Noise protocol's running symmetric state: chaining key `ck` and
/// transcript hash `h`. Zeroized on drop since both are secret-derived.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HandshakeState {
    hash: [u8; 32],
    chain: [u8; 32],
}

impl Default for HandshakeState {
    fn default() -> Self {
        Self {
            chain: CONSTRUCTION_HASH,
            hash: IDENTIFIER_HASH,
        }
    }
}

impl HandshakeState {
    pub fn mix_hash(&mut self, b: &[u8]) {
        self.hash = hash(&[&self.hash, b]);
    }

    /// Mixes `b` into the chaining key alone (WireGuard's off-spec extra
    /// `mix_chain` step applied to each side's ephemeral public key,
    /// ahead of the plain Noise `mix_hash`).
    pub fn mix_chain(&mut self, b: &[u8]) {
        let [ck] = hkdf(&self.chain, b);
        self.chain = ck;
    }

    /// DH, then fold the result into the chaining key only (used for `ee`
    /// and `se` terms, which contribute no further key material here).
    pub fn mix_dh(&mut self, sk: &StaticSecret, pk: &PublicKey) -> Result<(), CryptoError> {
        let shared = dh(sk, pk)?;
        let [ck] = hkdf(&self.chain, &shared);
        self.chain = ck;
        Ok(())
    }

    /// DH, then derive a fresh chaining key and an AEAD key from the
    /// result (used for `es` and `ss`, whose outputs seal the next field).
    pub fn mix_key_dh(&mut self, sk: &StaticSecret, pk: &PublicKey) -> Result<AeadKey, CryptoError> {
        let shared = dh(sk, pk)?;
        let [ck, k] = hkdf(&self.chain, &shared);
        self.chain = ck;
        Ok(AeadKey::from(k))
    }

    /// Three-output HKDF used once, to mix the preshared key in: derives a
    /// fresh chaining key, a value mixed into the hash (not secret-bearing
    /// key material, but part of the transcript), and an AEAD key for the
    /// empty payload that follows.
    pub fn mix_key_and_hash(&mut self, psk: &[u8; 32]) -> AeadKey {
        let [ck, t, k] = hkdf(&self.chain, psk);
        self.chain = ck;
        self.mix_hash(&t);
        AeadKey::from(k)
    }

    /// Ends the handshake: derives the pair of transport keys and zeroizes
    /// the chaining key and hash, since neither is needed again.
    pub fn split(&mut self) -> (AeadKey, AeadKey) {
        let [k1, k2] = hkdf::<2>(&self.chain, &[]);
        self.zeroize();
        (AeadKey::from(k1), AeadKey::from(k2))
    }
}

macro_rules! encrypted_payload {
    ($ty:ident, $n:literal) => {
        impl $ty {
            pub fn encrypt_and_hash(mut msg: [u8; $n], state: &mut HandshakeState, key: &AeadKey) -> Self {
                let aad = state.hash;
                let tag = ChaCha20Poly1305::new(key)
                    .encrypt_in_place_detached(&transport_nonce(0), &aad, &mut msg)
                    .expect("handshake payloads are far smaller than the AEAD message limit");
                let out = Self { msg, tag: Tag(tag.into()) };
                state.mix_hash(out.as_bytes());
                out
            }

            pub fn decrypt_and_hash(&mut self, state: &mut HandshakeState, key: &AeadKey) -> Result<&[u8; $n], CryptoError> {
                let aad = state.hash;
                state.mix_hash(self.as_bytes());

                ChaCha20Poly1305::new(key)
                    .decrypt_in_place_detached(&transport_nonce(0), &aad, &mut self.msg, (&self.tag.0).into())
                    .map_err(|_| CryptoError::AeadTagMismatch)?;

                Ok(&self.msg)
            }
        }
    };
}

encrypted_payload!(EncryptedEmpty, 0);
encrypted_payload!(EncryptedTimestamp, 12);
encrypted_payload!(EncryptedPublicKey, 32);

/// Seals the payload of a cookie reply with XChaCha20-Poly1305 under the
/// cookie-reply key (distinct from the handshake's mac1/transport keys).
pub fn encrypt_cookie(mut cookie: Cookie, key: &AeadKey, nonce: &[u8; 24], aad: &[u8]) -> EncryptedCookie {
    let tag = XChaCha20Poly1305::new(key)
        .encrypt_in_place_detached(nonce.into(), aad, &mut cookie.0)
        .expect("cookie payload is far smaller than the AEAD message limit");
    EncryptedCookie { msg: cookie.0, tag: Tag(tag.into()) }
}

pub fn decrypt_cookie(enc: &mut EncryptedCookie, key: &AeadKey, nonce: &[u8; 24], aad: &[u8]) -> Result<Cookie, CryptoError> {
    XChaCha20Poly1305::new(key)
        .decrypt_in_place_detached(nonce.into(), aad, &mut enc.msg, (&enc.tag.0).into())
        .map_err(|_| CryptoError::AeadTagMismatch)?;
    Ok(Cookie(enc.msg))
}

/// Seals an arbitrary-length, already zero-padded transport payload in
/// place and returns the detached tag. `counter` becomes the low 8 bytes
/// of the AEAD nonce, as required by the transport data message format.
pub fn transport_seal(key: &AeadKey, counter: u64, buf: &mut [u8]) -> Tag {
    let tag = ChaCha20Poly1305::new(key)
        .encrypt_in_place_detached(&transport_nonce(counter), &[], buf)
        .expect("transport payloads respect the interface MTU, far below the AEAD message limit");
    Tag(tag.into())
}

/// Opens a transport payload in place. On failure `buf` must be treated
/// as garbage by the caller; it is not restored to its original contents.
pub fn transport_open(key: &AeadKey, counter: u64, buf: &mut [u8], tag: &Tag) -> Result<(), CryptoError> {
    ChaCha20Poly1305::new(key)
        .decrypt_in_place_detached(&transport_nonce(counter), &[], buf, (&tag.0).into())
        .map_err(|_| CryptoError::AeadTagMismatch)
}

#[cfg(test)]
mod tests {
    #[test]
    fn construction_and_identifier_hashes_match_the_noise_spec_strings() {
        let c = super::hash(&[b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s"]);
        let h = super::hash(&[&c, b"WireGuard v1 zx2c4 Jason@zx2c4.com"]);
        assert_eq!(c, super::CONSTRUCTION_HASH);
        assert_eq!(h, super::IDENTIFIER_HASH);
    }

    #[test]
    fn diffie_hellman_rejects_a_known_low_order_point() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let mut rng = StdRng::seed_from_u64(11);
        let sk = super::StaticSecret::random_from_rng(&mut rng);
        let low_order_point = super::PublicKey::from([0u8; 32]);

        assert!(matches!(super::dh(&sk, &low_order_point), Err(crate::CryptoError::LowOrderDhOutput)));
    }
}
