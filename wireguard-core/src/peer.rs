//! The single-peer state machine: owns the session ring, the in-flight
//! handshake, and decides when to rekey, retry, or give up.
use std::net::IpAddr;
use std::time::Instant;

use rand::rngs::OsRng;
use tai64::Tai64N;
use tracing::{debug, info, warn};
use wireguard_crypto::{
    consume_initiation, consume_response, create_initiation, create_response, decrypt_cookie, split_transport_keys,
    Cookie, CryptoError, HandshakeState, HasMac, LocalIdentity, RemoteIdentity, X25519StaticSecret as StaticSecret,
};
use wireguard_types::{CookieMessage, HandshakeInit, HandshakeResp};
use zerocopy::{AsBytes, FromBytes};

use crate::config::{PeerConfig, StaticIdentity};
use crate::consts::{MAX_TIMER_HANDSHAKES, REJECT_AFTER_TIME, REKEY_AFTER_TIME, REKEY_ATTEMPT_TIME};
use crate::error::CoreError;
use crate::session::Session;
use crate::stats::{Stats, TunnelState};
use crate::timers::TimerWheel;

/// A handshake this side started, waiting on the peer's response.
struct PendingHandshake {
    state: HandshakeState,
    ephemeral_secret: StaticSecret,
    local_index: u32,
    last_sent_mac1: [u8; 16],
    started_at: Instant,
    attempts: u8,
}

pub enum SessionSlot {
    Current,
    Previous,
    Next,
}

pub struct Peer {
    local: LocalIdentity,
    remote: RemoteIdentity,
    pub config: PeerConfig,
    current: Option<Session>,
    previous: Option<Session>,
    next: Option<Session>,
    handshake: Option<PendingHandshake>,
    last_remote_timestamp: Option<[u8; 12]>,
    /// A cookie the peer sent us under load; mixed into mac2 on our next
    /// handshake retry while still fresh.
    peer_cookie: Option<Cookie>,
    state: TunnelState,
    pub timers: TimerWheel,
}

impl Peer {
    pub fn new(identity: &StaticIdentity, config: PeerConfig) -> Self {
        let local = LocalIdentity::new(identity.private_key.clone());
        let remote = RemoteIdentity::new(config.public_key, config.preshared_key);
        Self {
            local,
            remote,
            config,
            current: None,
            previous: None,
            next: None,
            handshake: None,
            last_remote_timestamp: None,
            peer_cookie: None,
            state: TunnelState::Idle,
            timers: TimerWheel::default(),
        }
    }

    pub fn state(&self) -> &TunnelState {
        &self.state
    }

    fn set_state(&mut self, state: TunnelState) {
        self.state = state;
    }

    pub fn has_session(&self) -> bool {
        self.current.is_some()
    }

    fn find_session_mut(&mut self, receiver_index: u32) -> Option<(SessionSlot, &mut Session)> {
        if self.current.as_ref().is_some_and(|s| s.local_index == receiver_index) {
            return self.current.as_mut().map(|s| (SessionSlot::Current, s));
        }
        if self.previous.as_ref().is_some_and(|s| s.local_index == receiver_index) {
            return self.previous.as_mut().map(|s| (SessionSlot::Previous, s));
        }
        if self.next.as_ref().is_some_and(|s| s.local_index == receiver_index) {
            return self.next.as_mut().map(|s| (SessionSlot::Next, s));
        }
        None
    }

    /// Starts a fresh handshake attempt, unless one is already in flight.
    pub fn begin_handshake(&mut self, stats: &Stats) -> Result<Vec<u8>, CoreError> {
        if self.handshake.is_some() {
            return Ok(Vec::new());
        }

        let mut rng = OsRng;
        let local_index = wireguard_utils::random_index(&mut rng);
        let ephemeral_secret = StaticSecret::random_from_rng(&mut rng);
        let mut state = HandshakeState::default();

        let cookie = self.fresh_cookie();
        let msg = create_initiation(&mut state, &self.local, &self.remote, &ephemeral_secret, Tai64N::now(), local_index, cookie)?;

        self.handshake = Some(PendingHandshake {
            state,
            ephemeral_secret,
            local_index,
            last_sent_mac1: msg.mac1,
            started_at: Instant::now(),
            attempts: 1,
        });
        self.timers.arm_rekey_timeout(&mut rng);
        self.timers.arm_rekey_attempt_deadline(Instant::now(), REKEY_ATTEMPT_TIME);
        self.set_state(TunnelState::Handshaking);
        info!(sender = local_index, "sent handshake initiation");

        let bytes = msg.as_bytes().to_vec();
        stats.record_tx(bytes.len());
        Ok(bytes)
    }

    fn fresh_cookie(&self) -> Option<&Cookie> {
        self.timers.cookie_is_fresh().then_some(self.peer_cookie.as_ref()).flatten()
    }

    /// Called by the timer tick: retries or aborts an in-flight handshake,
    /// and notices sessions that should be rekeyed or retired.
    pub fn on_timer_tick(&mut self, stats: &Stats) -> Result<Option<Vec<u8>>, CoreError> {
        let now = Instant::now();

        if let Some(deadline) = self.timers.reject_after_time_deadline() {
            if now >= deadline {
                self.previous = None;
                self.timers.disarm_reject_after_time();
            }
        }

        if let Some(pending) = &self.handshake {
            let attempt_deadline = self.timers.rekey_attempt_deadline();
            let timed_out = self.timers.rekey_timeout_deadline().is_some_and(|d| now >= d);
            let attempts_exhausted = pending.attempts >= MAX_TIMER_HANDSHAKES;
            let budget_exhausted = attempt_deadline.is_some_and(|d| now >= d);

            if budget_exhausted || (timed_out && attempts_exhausted) {
                warn!("handshake attempt abandoned after exhausting the retry budget");
                let elapsed = pending.started_at.elapsed();
                self.handshake = None;
                self.timers.disarm_rekey_timeout();
                self.timers.disarm_rekey_attempt_deadline();
                let err = CoreError::HandshakeTimeout { elapsed };
                self.set_state(TunnelState::from_error(&err));
                return Err(err);
            }

            if timed_out {
                debug!("handshake initiation timed out, retrying");
                return self.retry_handshake(stats).map(Some);
            }
            return Ok(None);
        }

        let rekey_deadline_passed = self.timers.rekey_after_time_deadline().is_some_and(|d| now >= d);
        let rekey_due = rekey_deadline_passed || self.current.as_ref().is_some_and(|s| s.should_rekey());
        if rekey_due && self.next.is_none() {
            return self.begin_handshake(stats).map(Some);
        }

        if let Some(interval) = self.config.persistent_keepalive {
            if self.timers.keepalive_deadline().is_some_and(|d| now >= d) {
                self.timers.arm_keepalive(interval);
                if let Some(current) = self.current.as_mut() {
                    let (header, tag) = current.encrypt(&mut Vec::new())?;
                    let mut out = header.as_bytes().to_vec();
                    out.extend_from_slice(tag.0.as_slice());
                    return Ok(Some(out));
                }
            }
        }

        Ok(None)
    }

    fn retry_handshake(&mut self, stats: &Stats) -> Result<Vec<u8>, CoreError> {
        let cookie = self.fresh_cookie().copied();
        let Some(pending) = &mut self.handshake else {
            return self.begin_handshake(stats);
        };
        pending.attempts += 1;

        let mut rng = OsRng;
        let mut state = HandshakeState::default();
        let msg = create_initiation(&mut state, &self.local, &self.remote, &pending.ephemeral_secret, Tai64N::now(), pending.local_index, cookie.as_ref())?;
        pending.state = state;
        pending.last_sent_mac1 = msg.mac1;
        pending.started_at = Instant::now();

        self.timers.arm_rekey_timeout(&mut rng);
        let bytes = msg.as_bytes().to_vec();
        stats.record_tx(bytes.len());
        Ok(bytes)
    }

    /// Handles an inbound cookie reply (message type `0x03`). Stores the
    /// cookie for 120s so the next retried initiation can carry mac2.
    pub fn handle_cookie_reply(&mut self, datagram: &mut [u8]) -> Result<(), CoreError> {
        let msg = CookieMessage::mut_from(datagram).ok_or(CryptoError::AeadTagMismatch)?;

        let Some(pending) = &self.handshake else {
            return Ok(());
        };
        if msg.receiver.get() != pending.local_index {
            return Ok(());
        }

        let cookie = decrypt_cookie(&mut msg.cookie, self.remote.cookie_reply_key(), &msg.nonce, &pending.last_sent_mac1)?;
        self.peer_cookie = Some(cookie);
        self.timers.arm_cookie_expiry();
        Ok(())
    }

    /// Handles an inbound handshake initiation (message type `0x01`).
    pub fn handle_initiation(&mut self, datagram: &mut [u8], stats: &Stats) -> Result<Option<Vec<u8>>, CoreError> {
        let init = HandshakeInit::mut_from(datagram).ok_or(CryptoError::AeadTagMismatch)?;

        init.verify_mac1(self.local.mac1_key())?;

        let mut state = HandshakeState::default();
        let decrypted = consume_initiation(init, &mut state, &self.local)?;

        if decrypted.static_key().as_bytes() != self.remote.public_key.as_bytes() {
            return Err(CoreError::ConfigInvalid("handshake initiation from an unexpected static key".into()));
        }

        let timestamp = *decrypted.timestamp();
        if self.last_remote_timestamp.is_some_and(|last| timestamp <= last) {
            debug!("rejecting replayed handshake initiation timestamp");
            return Ok(None);
        }
        self.last_remote_timestamp = Some(timestamp);

        let mut rng = OsRng;
        let esk_r = StaticSecret::random_from_rng(&mut rng);
        let sender = wireguard_utils::random_index(&mut rng);
        let resp = create_response(&mut state, decrypted, &esk_r, &self.remote, sender, None)?;

        let (send, recv) = split_transport_keys(&mut state, false);
        self.next = Some(Session::new(send, recv, sender, decrypted.sender(), false));

        info!(sender, "sent handshake response");
        let bytes = resp.as_bytes().to_vec();
        stats.record_tx(bytes.len());
        Ok(Some(bytes))
    }

    /// Handles an inbound handshake response (message type `0x02`).
    pub fn handle_response(&mut self, datagram: &mut [u8]) -> Result<(), CoreError> {
        let resp = HandshakeResp::mut_from(datagram).ok_or(CryptoError::AeadTagMismatch)?;

        resp.verify_mac1(self.local.mac1_key())?;

        let Some(mut pending) = self.handshake.take() else {
            return Ok(());
        };
        if resp.receiver.get() != pending.local_index {
            self.handshake = Some(pending);
            return Ok(());
        }

        consume_response(resp, &mut pending.state, &self.local, &self.remote, &pending.ephemeral_secret)?;
        let (send, recv) = split_transport_keys(&mut pending.state, true);
        self.next = Some(Session::new(send, recv, pending.local_index, resp.sender.get(), true));

        self.timers.disarm_rekey_timeout();
        self.timers.disarm_rekey_attempt_deadline();
        info!("handshake completed, session promoted to next");
        Ok(())
    }

    /// Promotes `next` to `current` (demoting `current` to `previous`),
    /// the first time it is actually used to carry traffic.
    fn promote_next_if_needed(&mut self) {
        if self.next.is_some() {
            self.previous = self.current.take();
            self.current = self.next.take();
            let now = Instant::now();
            self.timers.arm_reject_after_time(now + REJECT_AFTER_TIME);
            self.timers.arm_rekey_after_time(now + REKEY_AFTER_TIME);
            if let Some(interval) = self.config.persistent_keepalive {
                self.timers.arm_keepalive(interval);
            }
            self.set_state(TunnelState::Connected);
        }
    }

    /// Handles an inbound transport data message (type `0x04`). `header`
    /// is the already-parsed wire header; `payload` is the ciphertext
    /// plus trailing tag. The returned buffer has `Session::encrypt`'s
    /// zero padding stripped back to the inner IP packet's declared
    /// length; a malformed inner packet comes back empty rather than
    /// erroring, so the forwarder drops it silently.
    pub fn handle_data(&mut self, receiver_index: u32, counter: u64, payload: &mut [u8], tag: &wireguard_crypto::Tag) -> Result<Vec<u8>, CoreError> {
        let Some((slot, session)) = self.find_session_mut(receiver_index) else {
            return Err(CoreError::CryptoFailure(CryptoError::AeadTagMismatch));
        };

        session.decrypt(counter, payload, tag)?;

        if matches!(slot, SessionSlot::Next) {
            self.promote_next_if_needed();
        }

        Ok(match inner_packet_length(payload) {
            Some(len) => payload[..len].to_vec(),
            None => Vec::new(),
        })
    }

    /// Encrypts an outbound IP packet under the current session, starting
    /// a handshake instead if none exists yet.
    pub fn encrypt_outbound(&mut self, packet: &[u8], stats: &Stats) -> Result<Option<(wireguard_types::DataHeader, wireguard_crypto::Tag, Vec<u8>)>, CoreError> {
        if self.current.is_none() {
            self.begin_handshake(stats)?;
            return Ok(None);
        }

        let session = self.current.as_mut().expect("checked above");
        let mut buf = packet.to_vec();
        match session.encrypt(&mut buf) {
            Ok((header, tag)) => {
                stats.set_current_send_counter(header.counter.get());
                if let Some(interval) = self.config.persistent_keepalive {
                    self.timers.arm_keepalive(interval);
                }
                Ok(Some((header, tag, buf)))
            }
            Err(_) => {
                self.begin_handshake(stats)?;
                Ok(None)
            }
        }
    }

    pub fn is_addr_allowed(&self, addr: IpAddr) -> bool {
        self.config.permits(addr)
    }

    /// Drops every session and any in-flight handshake. The ephemeral and
    /// transport keys involved all carry a `ZeroizeOnDrop` bound, so this
    /// is enough to scrub them from memory.
    pub fn retire(&mut self) {
        self.current = None;
        self.previous = None;
        self.next = None;
        self.handshake = None;
    }
}

/// Recovers the inner IP packet's real length from its own header,
/// discarding the zero padding `Session::encrypt` added up to a 16-byte
/// boundary: the IPv4 total-length field, or 40 plus the IPv6
/// payload-length field. `None` if the header is truncated or claims a
/// length longer than what's actually present.
fn inner_packet_length(buf: &[u8]) -> Option<usize> {
    let len = match buf.first()? >> 4 {
        4 if buf.len() >= 20 => u16::from_be_bytes([buf[2], buf[3]]) as usize,
        6 if buf.len() >= 40 => 40 + u16::from_be_bytes([buf[4], buf[5]]) as usize,
        _ => return None,
    };
    (len <= buf.len()).then_some(len)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use wireguard_crypto::Key;

    use super::*;

    fn peer_pair() -> (Peer, Peer) {
        let mut rng = StdRng::seed_from_u64(99);
        let sk_i = StaticSecret::random_from_rng(&mut rng);
        let sk_r = StaticSecret::random_from_rng(&mut rng);
        let identity_i = StaticIdentity::from_private_key(sk_i);
        let identity_r = StaticIdentity::from_private_key(sk_r);
        let endpoint: SocketAddr = "127.0.0.1:51820".parse().unwrap();

        let initiator = Peer::new(&identity_i, PeerConfig::new(identity_r.public_key, endpoint));
        let responder = Peer::new(&identity_r, PeerConfig::new(identity_i.public_key, endpoint));
        (initiator, responder)
    }

    #[test]
    fn a_fresh_handshake_completes_and_promotes_a_session_on_first_data() {
        let (mut initiator, mut responder) = peer_pair();
        let stats = Stats::default();

        let mut init_bytes = initiator.begin_handshake(&stats).unwrap();
        assert!(matches!(initiator.state(), TunnelState::Handshaking));

        let mut resp_bytes = responder.handle_initiation(&mut init_bytes, &stats).unwrap().unwrap();
        initiator.handle_response(&mut resp_bytes).unwrap();

        assert!(initiator.handshake.is_none());
        assert!(initiator.next.is_some());
        assert!(responder.next.is_some());
    }

    #[test]
    fn a_replayed_initiation_timestamp_is_rejected() {
        let (mut initiator, mut responder) = peer_pair();
        let stats = Stats::default();

        let original = initiator.begin_handshake(&stats).unwrap();

        let mut first_copy = original.clone();
        let first = responder.handle_initiation(&mut first_copy, &stats).unwrap();
        assert!(first.is_some());

        let mut replay_copy = original;
        let replay = responder.handle_initiation(&mut replay_copy, &stats).unwrap();
        assert!(replay.is_none());
    }

    #[test]
    fn a_session_past_the_rekey_time_threshold_starts_a_new_handshake_on_tick() {
        let (mut initiator, _responder) = peer_pair();
        let stats = Stats::default();
        let key = Key::from([9u8; 32]);
        initiator.current = Some(Session::with_age(key.clone(), key, 1, 2, true, crate::consts::REKEY_AFTER_TIME + Duration::from_secs(1)));

        let emitted = initiator.on_timer_tick(&stats).unwrap();
        assert!(emitted.is_some());
        assert!(initiator.handshake.is_some());
    }

    #[test]
    fn persistent_keepalive_emits_an_empty_packet_when_due() {
        let (mut initiator, _responder) = peer_pair();
        let stats = Stats::default();
        initiator.config.persistent_keepalive = Some(Duration::from_secs(10));
        let key = Key::from([3u8; 32]);
        initiator.current = Some(Session::new(key.clone(), key, 1, 2, true));
        initiator.timers.arm_keepalive(Duration::ZERO);

        let emitted = initiator.on_timer_tick(&stats).unwrap();
        assert!(emitted.is_some());
    }

    #[test]
    fn promoting_a_session_arms_rekey_and_keepalive_timers() {
        let (mut initiator, _responder) = peer_pair();
        initiator.config.persistent_keepalive = Some(Duration::from_secs(25));
        let key = Key::from([4u8; 32]);
        initiator.next = Some(Session::new(key.clone(), key, 1, 2, true));

        initiator.promote_next_if_needed();

        assert!(initiator.timers.rekey_after_time_deadline().is_some());
        assert!(initiator.timers.keepalive_deadline().is_some());
        assert!(matches!(initiator.state(), TunnelState::Connected));
    }

    #[test]
    fn inbound_transport_padding_is_stripped_to_the_ipv4_declared_length() {
        let mut packet = vec![0x45u8, 0, 0, 20];
        packet.resize(32, 0);
        assert_eq!(inner_packet_length(&packet), Some(20));
    }

    #[test]
    fn a_truncated_inner_header_is_rejected_as_malformed() {
        let packet = vec![0x45u8, 0, 0, 20, 0, 0];
        assert_eq!(inner_packet_length(&packet), None);
    }

    #[test]
    fn a_length_field_longer_than_the_buffer_is_rejected_as_malformed() {
        let mut packet = vec![0x45u8, 0, 0, 200];
        packet.resize(20, 0);
        assert_eq!(inner_packet_length(&packet), None);
    }

    #[test]
    fn destination_outside_allowed_ips_is_rejected() {
        let mut rng = StdRng::seed_from_u64(100);
        let identity = StaticIdentity::from_private_key(StaticSecret::random_from_rng(&mut rng));
        let remote_public = wireguard_crypto::X25519PublicKey::from(&StaticSecret::random_from_rng(&mut rng));
        let endpoint: SocketAddr = "127.0.0.1:51820".parse().unwrap();
        let config = PeerConfig::new(remote_public, endpoint).with_allowed_ips(vec!["10.0.0.0/24".parse().unwrap()]);
        let peer = Peer::new(&identity, config);

        assert!(peer.is_addr_allowed("10.0.0.5".parse().unwrap()));
        assert!(!peer.is_addr_allowed("192.168.1.1".parse().unwrap()));
    }
}
