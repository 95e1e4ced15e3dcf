//! The Mifare Classic nonce PRNG: a free-running LFSR clocked by the
//! carrier, visible to the reader only through the 32-bit nonce a tag
//! hands back on AUTH. This is a *timing* primitive the darkside/NACK
//! harness (C7) needs to reason about — "how many PRNG steps have elapsed
//! between these two observed nonces" — not a cryptographic primitive;
//! Crypto-1's keystream generator itself is the external collaborator in
//! `crypto.rs`.
//!
//! `dist_nt` returning `-99999` for "no relation found within range" and
//! the asymmetry `dist_nt(a, b) == -dist_nt(b, a)` are both load-bearing
//! for the darkside harness's resync logic in `attack.rs`.

/// Sentinel returned by `dist_nt` when no step count within the search
/// bound connects the two nonces.
pub const DIST_NT_INVALID: i32 = -99999;

/// Bound (in PRNG steps, either direction) the search in `dist_nt` gives up
/// at. Generous relative to the one-PRNG-period (2^16) cycle the darkside
/// harness tracks, so a single full period is always found.
const SEARCH_BOUND: u32 = 1 << 17;

/// Advances the 32-bit nonce LFSR `n` steps. `x` and the return value are
/// in the same byte order the tag hands the nonce over the air in; the
/// recurrence itself operates on the endian-swapped internal register.
pub fn prng_successor(x: u32, n: u32) -> u32 {
    let mut state = x.swap_bytes();
    for _ in 0..n {
        let feedback = ((state >> 16) ^ (state >> 18) ^ (state >> 19) ^ (state >> 20)) & 1;
        state = (state >> 1) | (feedback << 31);
    }
    state.swap_bytes()
}

/// Signed step distance from nonce `a` to nonce `b`: positive if `b` is
/// reached by stepping `a` forward, negative if `a` is reached by stepping
/// `b` forward (i.e. `b` precedes `a`), magnitude bounded to half the
/// PRNG's period so the result picks the shorter direction. Returns
/// `DIST_NT_INVALID` if no relation is found within the search bound
/// (e.g. `a` and `b` come from unrelated sessions).
pub fn dist_nt(a: u32, b: u32) -> i32 {
    let forward = steps_between(a, b);
    let Some(forward) = forward else {
        return DIST_NT_INVALID;
    };
    if forward == 0 {
        return 0;
    }
    let backward = steps_between(b, a);
    match backward {
        Some(backward) if backward < forward => -(backward as i32),
        _ => forward as i32,
    }
}

/// Number of forward PRNG steps to reach `to` from `from`, or `None` if not
/// found within `SEARCH_BOUND` steps.
fn steps_between(from: u32, to: u32) -> Option<u32> {
    let mut x = from;
    for k in 0..=SEARCH_BOUND {
        if x == to {
            return Some(k);
        }
        x = prng_successor(x, 1);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successor_of_zero_steps_is_identity() {
        assert_eq!(prng_successor(0xdead_beef, 0), 0xdead_beef);
    }

    #[test]
    fn dist_nt_of_equal_nonces_is_zero() {
        assert_eq!(dist_nt(0x1234_5678, 0x1234_5678), 0);
    }

    #[test]
    fn dist_nt_recovers_known_forward_step_counts() {
        let nt0 = 0xdead_beef;
        for k in [1u32, 17, 255, 4095] {
            let nt_k = prng_successor(nt0, k);
            assert_eq!(dist_nt(nt0, nt_k), k as i32, "k={k}");
        }
    }

    #[test]
    fn dist_nt_is_antisymmetric() {
        let nt0 = 0x0123_4567;
        let nt1 = prng_successor(nt0, 500);
        let fwd = dist_nt(nt0, nt1);
        let back = dist_nt(nt1, nt0);
        assert_eq!(fwd, -back);
    }
}
