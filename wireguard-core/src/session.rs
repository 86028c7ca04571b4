//! A single transport keypair and the bookkeeping needed to use it safely:
//! a monotonic send counter, the anti-replay window, and session age.
use std::time::Instant;

use wireguard_crypto::{transport_open, transport_seal, DataHeader, Key, Tag};

use crate::consts::{REJECT_AFTER_MESSAGES, REJECT_AFTER_TIME, REKEY_AFTER_MESSAGES, REKEY_AFTER_TIME};
use crate::error::CoreError;
use crate::window::ReceiveWindow;

pub struct Session {
    send_key: Key,
    recv_key: Key,
    pub local_index: u32,
    pub remote_index: u32,
    send_counter: u64,
    recv_window: ReceiveWindow,
    created_at: Instant,
    pub is_initiator: bool,
}

impl Session {
    pub fn new(send_key: Key, recv_key: Key, local_index: u32, remote_index: u32, is_initiator: bool) -> Self {
        Self {
            send_key,
            recv_key,
            local_index,
            remote_index,
            send_counter: 0,
            recv_window: ReceiveWindow::default(),
            created_at: Instant::now(),
            is_initiator,
        }
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Backdates `created_at` so rekey-by-time logic can be exercised
    /// without sleeping the test thread for real.
    #[cfg(test)]
    pub(crate) fn with_age(send_key: Key, recv_key: Key, local_index: u32, remote_index: u32, is_initiator: bool, age: std::time::Duration) -> Self {
        let mut session = Self::new(send_key, recv_key, local_index, remote_index, is_initiator);
        session.created_at = Instant::now() - age;
        session
    }

    pub fn is_expired(&self) -> bool {
        self.age() >= REJECT_AFTER_TIME
    }

    pub fn is_usable_for_sending(&self) -> bool {
        self.age() < REJECT_AFTER_TIME && self.send_counter < REJECT_AFTER_MESSAGES
    }

    /// True once this session has carried enough traffic, or aged enough,
    /// that the initiator side should start a fresh handshake ahead of the
    /// hard limits.
    pub fn should_rekey(&self) -> bool {
        self.is_initiator && (self.send_counter >= REKEY_AFTER_MESSAGES || self.age() >= REKEY_AFTER_TIME)
    }

    /// Encrypts `plaintext` in place (zero-padded to a 16-byte multiple)
    /// and returns the wire header and detached tag to send alongside it.
    pub fn encrypt(&mut self, plaintext: &mut Vec<u8>) -> Result<(DataHeader, Tag), CoreError> {
        if !self.is_usable_for_sending() {
            return Err(CoreError::HandshakeTimeout { elapsed: self.age() });
        }

        let counter = self.send_counter;
        self.send_counter += 1;

        let pad_to = plaintext.len().next_multiple_of(16);
        plaintext.resize(pad_to, 0);

        let tag = transport_seal(&self.send_key, counter, plaintext);
        Ok((DataHeader::new(self.remote_index, counter), tag))
    }

    /// Opens a transport payload in place. Returns `true` if the accepted
    /// counter warrants promoting this session to current (always `false`
    /// here; promotion is a `Peer`-level decision based on which slot this
    /// session occupies).
    pub fn decrypt(&mut self, counter: u64, ciphertext: &mut [u8], tag: &Tag) -> Result<(), CoreError> {
        if !self.recv_window.check_and_set(counter) {
            return Err(CoreError::CryptoFailure(wireguard_crypto::CryptoError::AeadTagMismatch));
        }
        transport_open(&self.recv_key, counter, ciphertext, tag)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (Key, Key) {
        (Key::from([1u8; 32]), Key::from([2u8; 32]))
    }

    #[test]
    fn round_trip_through_encrypt_and_decrypt() {
        let (k1, k2) = keypair();
        let mut sender = Session::new(k1, k2, 1, 2, true);
        let mut receiver = Session::new(k2, k1, 2, 1, false);

        let mut buf = b"hello, tunnel".to_vec();
        let original_len = buf.len();
        let (header, tag) = sender.encrypt(&mut buf).unwrap();

        receiver.decrypt(header.counter.get(), &mut buf, &tag).unwrap();
        assert_eq!(&buf[..original_len], b"hello, tunnel");
    }

    #[test]
    fn send_counters_are_strictly_monotonic() {
        let (k1, k2) = keypair();
        let mut sender = Session::new(k1, k2, 1, 2, true);
        for expected in 0..5u64 {
            let (header, _) = sender.encrypt(&mut vec![0u8; 4]).unwrap();
            assert_eq!(header.counter.get(), expected);
        }
    }

    #[test]
    fn replayed_counter_is_rejected_on_decrypt() {
        let (k1, k2) = keypair();
        let mut sender = Session::new(k1, k2, 1, 2, true);
        let mut receiver = Session::new(k2, k1, 2, 1, false);

        let mut buf = b"payload123456789".to_vec();
        let (header, tag) = sender.encrypt(&mut buf).unwrap();
        let mut replay_buf = buf.clone();

        receiver.decrypt(header.counter.get(), &mut buf, &tag).unwrap();
        assert!(receiver.decrypt(header.counter.get(), &mut replay_buf, &tag).is_err());
    }

    #[test]
    fn should_rekey_past_the_message_count_threshold() {
        let (k1, k2) = keypair();
        let mut session = Session::new(k1, k2, 1, 2, true);
        session.send_counter = REKEY_AFTER_MESSAGES;
        assert!(session.should_rekey());
    }

    #[test]
    fn should_rekey_past_the_time_threshold() {
        let (k1, k2) = keypair();
        let session = Session::with_age(k1, k2, 1, 2, true, REKEY_AFTER_TIME + std::time::Duration::from_secs(1));
        assert!(session.should_rekey());
    }

    #[test]
    fn a_responder_session_never_initiates_its_own_rekey() {
        let (k1, k2) = keypair();
        let mut session = Session::new(k1, k2, 1, 2, false);
        session.send_counter = REKEY_AFTER_MESSAGES;
        assert!(!session.should_rekey());
    }

    #[test]
    fn tampering_with_ciphertext_fails_the_tag() {
        let (k1, k2) = keypair();
        let mut sender = Session::new(k1, k2, 1, 2, true);
        let mut receiver = Session::new(k2, k1, 2, 1, false);

        let mut buf = b"payload123456789".to_vec();
        let (header, tag) = sender.encrypt(&mut buf).unwrap();
        buf[0] ^= 0xff;

        assert!(receiver.decrypt(header.counter.get(), &mut buf, &tag).is_err());
    }
}
