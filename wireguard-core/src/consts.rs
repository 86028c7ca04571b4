//! Named thresholds governing rekeying, retries, and session retirement.
//! Values match the reference WireGuard implementation; none of these are
//! tunable at runtime.
use std::time::Duration;

pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);

pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
pub const REKEY_TIMEOUT_JITTER_FRAC: f64 = 0.2;

pub const MAX_TIMER_HANDSHAKES: u8 = 3;
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);

pub const COOKIE_VALIDITY: Duration = Duration::from_secs(120);

pub const RECEIVE_WINDOW_BITS: usize = 2048;

pub const DEFAULT_MTU_IPV4: u16 = 1420;
pub const DEFAULT_MTU_IPV6: u16 = 1400;
