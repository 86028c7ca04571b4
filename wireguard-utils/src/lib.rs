//! Small helpers shared by the crypto engine and the peer/timer machinery
//! that do not deserve their own crate, but also do not belong wedged
//! inside either of those.
#![no_std]

use core::time::Duration;
use rand_core::RngCore;

/// Draw a fresh 32-bit session index from the given CSPRNG.
///
/// WireGuard session indices are opaque to the protocol: any non-zero
/// pattern of 4 bytes is valid, collisions are resolved by losing the
/// handshake and retrying, and there is no structure to preserve.
pub fn random_index(rng: &mut (impl RngCore + ?Sized)) -> u32 {
    rng.next_u32()
}

/// Add up to `+/- frac` proportional jitter to a base duration, so that
/// many peers retrying in lockstep (e.g. after a shared link flaps) do not
/// all resend their handshake initiation on the same tick.
///
/// `frac` is clamped to `[0.0, 1.0]`. `sample` must be a uniformly random
/// `u32`; callers draw it from their own RNG so this function stays
/// deterministic and allocation-free.
pub fn jitter(base: Duration, frac: f64, sample: u32) -> Duration {
    let frac = frac.clamp(0.0, 1.0);
    let span = (base.as_secs_f64() * frac).max(0.0);
    let unit = sample as f64 / u32::MAX as f64; // [0.0, 1.0]
    let offset = span * (unit * 2.0 - 1.0); // [-span, +span]
    let secs = (base.as_secs_f64() + offset).max(0.0);
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(5);
        for sample in [0, u32::MAX / 4, u32::MAX / 2, (u32::MAX / 4) * 3, u32::MAX] {
            let d = jitter(base, 0.1, sample);
            assert!(d.as_secs_f64() >= base.as_secs_f64() * 0.9 - 0.001);
            assert!(d.as_secs_f64() <= base.as_secs_f64() * 1.1 + 0.001);
        }
    }

    #[test]
    fn random_index_uses_the_provided_rng() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let mut a = StdRng::seed_from_u64(1);
        let mut b = StdRng::seed_from_u64(1);
        assert_eq!(random_index(&mut a), random_index(&mut b));
    }
}
