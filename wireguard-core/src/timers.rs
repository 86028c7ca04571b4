//! Coarse per-peer timer bookkeeping. Each event is a plain `Option<Instant>`
//! deadline; the forwarder's `tokio::select!` loop sleeps until whichever
//! one is soonest rather than spawning a task per timer.
use std::time::{Duration, Instant};

use rand::RngCore;

use crate::consts::{COOKIE_VALIDITY, REKEY_TIMEOUT, REKEY_TIMEOUT_JITTER_FRAC};

#[derive(Default)]
pub struct TimerWheel {
    rekey_timeout: Option<Instant>,
    rekey_attempt_deadline: Option<Instant>,
    rekey_after_time: Option<Instant>,
    keepalive: Option<Instant>,
    reject_after_time: Option<Instant>,
    cookie_expiry: Option<Instant>,
}

impl TimerWheel {
    pub fn arm_rekey_timeout(&mut self, rng: &mut impl RngCore) {
        let jittered = wireguard_utils::jitter(REKEY_TIMEOUT, REKEY_TIMEOUT_JITTER_FRAC, rng.next_u32());
        self.rekey_timeout = Some(Instant::now() + jittered);
    }

    pub fn disarm_rekey_timeout(&mut self) {
        self.rekey_timeout = None;
    }

    pub fn rekey_timeout_deadline(&self) -> Option<Instant> {
        self.rekey_timeout
    }

    pub fn arm_rekey_attempt_deadline(&mut self, from: Instant, budget: Duration) {
        self.rekey_attempt_deadline = Some(from + budget);
    }

    pub fn disarm_rekey_attempt_deadline(&mut self) {
        self.rekey_attempt_deadline = None;
    }

    pub fn rekey_attempt_deadline(&self) -> Option<Instant> {
        self.rekey_attempt_deadline
    }

    /// Arms the deadline at which an initiator-side session should start
    /// rekeying ahead of the hard message/time limits, independent of the
    /// per-message `should_rekey` check (so it fires promptly even if no
    /// other timer happens to wake the forwarder first).
    pub fn arm_rekey_after_time(&mut self, deadline: Instant) {
        self.rekey_after_time = Some(deadline);
    }

    pub fn disarm_rekey_after_time(&mut self) {
        self.rekey_after_time = None;
    }

    pub fn rekey_after_time_deadline(&self) -> Option<Instant> {
        self.rekey_after_time
    }

    pub fn arm_keepalive(&mut self, interval: Duration) {
        self.keepalive = Some(Instant::now() + interval);
    }

    pub fn disarm_keepalive(&mut self) {
        self.keepalive = None;
    }

    pub fn keepalive_deadline(&self) -> Option<Instant> {
        self.keepalive
    }

    pub fn arm_reject_after_time(&mut self, deadline: Instant) {
        self.reject_after_time = Some(deadline);
    }

    pub fn disarm_reject_after_time(&mut self) {
        self.reject_after_time = None;
    }

    pub fn reject_after_time_deadline(&self) -> Option<Instant> {
        self.reject_after_time
    }

    pub fn arm_cookie_expiry(&mut self) {
        self.cookie_expiry = Some(Instant::now() + COOKIE_VALIDITY);
    }

    pub fn cookie_is_fresh(&self) -> bool {
        self.cookie_expiry.is_some_and(|deadline| Instant::now() < deadline)
    }

    /// The soonest of every armed deadline, or `None` if nothing is armed
    /// (the caller should then only wait on I/O).
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.rekey_timeout,
            self.rekey_attempt_deadline,
            self.rekey_after_time,
            self.keepalive,
            self.reject_after_time,
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_deadline_picks_the_earliest_armed_timer() {
        let mut wheel = TimerWheel::default();
        let now = Instant::now();
        wheel.arm_keepalive(Duration::from_secs(10));
        wheel.arm_reject_after_time(now + Duration::from_secs(2));
        assert_eq!(wheel.next_deadline(), wheel.reject_after_time_deadline());
    }

    #[test]
    fn disarming_a_timer_removes_it_from_consideration() {
        let mut wheel = TimerWheel::default();
        wheel.arm_keepalive(Duration::from_secs(1));
        wheel.disarm_keepalive();
        assert_eq!(wheel.next_deadline(), None);
    }
}
