//! Byte-exact layouts for the four WireGuard wire messages (handshake
//! initiation, handshake response, cookie reply, transport data) plus the
//! small AEAD-wrapped payloads nested inside the handshake messages.
//!
//! Every struct here is `#[repr(C)]` and derives `zerocopy`'s `FromBytes` /
//! `FromZeroes` / `AsBytes`, so a wire message can be read out of a UDP
//! datagram (or written into one) with a single reinterpret cast and no
//! copying of the payload bytes.
#![no_std]

use zerocopy::byteorder::little_endian;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// 128-bit truncated BLAKE2s MAC, used for both mac1 and mac2.
pub type Mac = [u8; 16];

pub const MSG_FIRST: u32 = 1;
pub const MSG_SECOND: u32 = 2;
pub const MSG_COOKIE: u32 = 3;
pub const MSG_DATA: u32 = 4;

macro_rules! encrypted {
    ($name:ident, $n:literal) => {
        #[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
        #[repr(C)]
        pub struct $name {
            pub msg: [u8; $n],
            pub tag: Tag,
        }
    };
}

/// A detached Poly1305 tag, stored next to its ciphertext rather than
/// appended to it so the surrounding struct stays a fixed-size POD type.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes, PartialEq, Eq)]
#[repr(transparent)]
pub struct Tag(pub [u8; 16]);

encrypted!(EncryptedEmpty, 0);
encrypted!(EncryptedTimestamp, 12);
encrypted!(EncryptedPublicKey, 32);

/// The anti-DoS cookie handed back in a `CookieMessage`, and mixed into
/// mac2 on a subsequent handshake retry.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes, PartialEq, Eq)]
#[repr(transparent)]
pub struct Cookie(pub [u8; 16]);

encrypted!(EncryptedCookie, 16);

/// First Noise message, 148 bytes on the wire.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct HandshakeInit {
    pub msg_type: little_endian::U32,
    pub sender: little_endian::U32,
    pub ephemeral_key: [u8; 32],
    pub static_key: EncryptedPublicKey,
    pub timestamp: EncryptedTimestamp,
    pub mac1: Mac,
    pub mac2: Mac,
}

/// Second Noise message, 92 bytes on the wire.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct HandshakeResp {
    pub msg_type: little_endian::U32,
    pub sender: little_endian::U32,
    pub receiver: little_endian::U32,
    pub ephemeral_key: [u8; 32],
    pub empty: EncryptedEmpty,
    pub mac1: Mac,
    pub mac2: Mac,
}

/// Cookie reply, 64 bytes on the wire.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct CookieMessage {
    pub msg_type: little_endian::U32,
    pub receiver: little_endian::U32,
    pub nonce: [u8; 24],
    pub cookie: EncryptedCookie,
}

/// Transport data header, 16 bytes, followed by an arbitrary-length
/// zero-padded ciphertext and a 16-byte tag that are not part of this
/// fixed-size struct.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct DataHeader {
    pub msg_type: little_endian::U32,
    pub receiver: little_endian::U32,
    pub counter: little_endian::U64,
}

impl DataHeader {
    pub const LEN: usize = core::mem::size_of::<Self>();

    pub fn new(receiver: u32, counter: u64) -> Self {
        Self {
            msg_type: little_endian::U32::new(MSG_DATA),
            receiver: little_endian::U32::new(receiver),
            counter: little_endian::U64::new(counter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_sizes_match_specification() {
        assert_eq!(core::mem::size_of::<HandshakeInit>(), 148);
        assert_eq!(core::mem::size_of::<HandshakeResp>(), 92);
        assert_eq!(core::mem::size_of::<CookieMessage>(), 64);
        assert_eq!(core::mem::size_of::<DataHeader>(), 16);
    }

    #[test]
    fn message_type_tags_are_distinct_bytes() {
        let tags = [MSG_FIRST, MSG_SECOND, MSG_COOKIE, MSG_DATA];
        for (i, a) in tags.iter().enumerate() {
            for b in &tags[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
