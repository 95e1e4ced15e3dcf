//! Miller decoder (C1): reader-to-tag line code.
//!
//! Processes one nibble (4 samples = one half-bit period) at a time.
//! Mirrors the decoder state described in the data model: a
//! first-half/second-half modulation pairing, a 9-bit data+parity
//! shift register, and byte/parity output counters. Reset before
//! every frame; terminal on end-of-communication.
//!
//! Unlike the Manchester side (which needs a run of quiet nibbles to
//! find its start bit), a Miller frame opens with sequence Z as its
//! very first symbol — no stuffing precedes it — so start-of-communication
//! is just "the first fully-paired symbol turned out to be Z".

use super::lut::is_miller_modulated;
use crate::error::{Error, Result};
use crate::types::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Symbol {
    X,
    Y,
    Z,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unsyncd,
    StartOfCommunication,
    Active,
}

/// Result of feeding one nibble to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MillerSignal {
    /// Still accumulating; no frame boundary reached.
    Pending,
    /// A full frame was just terminated; call `take_frame`.
    EndOfCommunication,
}

/// Reader-to-tag Miller decoder.
pub struct MillerDecoder {
    state: State,
    first_half_mod: Option<bool>,
    prev_symbol: Option<Symbol>,
    shift_reg: u16,
    bit_count: u8,
    out_bytes: Vec<u8>,
    out_parity: Vec<bool>,
    /// Set when the tail flush at end-of-communication recognised a
    /// trailing partial byte as a 7-bit short frame (REQA/WUPA-style)
    /// rather than discarding it as the end-of-communication marker's
    /// spurious placeholder bit. See `flush_tail` for why both cases
    /// exist.
    short_frame: bool,
    start_time: u32,
    end_time: u32,
}

impl MillerDecoder {
    /// A freshly reset decoder, unsynchronised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets all state; safe to call before every frame.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether the decoder has locked onto a start-of-communication.
    pub fn is_synchronised(&self) -> bool {
        self.state != State::Unsyncd
    }

    /// Feeds one nibble (4 raw samples) at `timestamp` (ssp cycles).
    pub fn feed_nibble(&mut self, nibble: u8, timestamp: u32) -> Result<MillerSignal> {
        let first_mod = match self.first_half_mod {
            None => {
                self.first_half_mod = Some(is_miller_modulated(nibble));
                return Ok(MillerSignal::Pending);
            }
            Some(v) => v,
        };
        self.first_half_mod = None;
        let second_mod = is_miller_modulated(nibble);

        let symbol = match (first_mod, second_mod) {
            (true, false) => Symbol::Z,
            (false, true) => Symbol::X,
            (false, false) => Symbol::Y,
            (true, true) => {
                self.reset();
                return Err(Error::FramingViolation {
                    direction: "miller",
                    state: "both-halves-modulated",
                });
            }
        };

        if self.state == State::Unsyncd {
            // Anything other than a clean Z is noise ahead of the real
            // start; keep scanning symbol-pairs for one.
            if symbol == Symbol::Z {
                self.state = State::StartOfCommunication;
                self.start_time = timestamp;
            }
            return Ok(MillerSignal::Pending);
        }

        if self.state == State::StartOfCommunication && symbol == Symbol::Y {
            self.reset();
            return Err(Error::FramingViolation {
                direction: "miller",
                state: "y-after-soc",
            });
        }
        if symbol == Symbol::Y && matches!(self.prev_symbol, Some(Symbol::Y) | Some(Symbol::Z)) {
            self.end_time = timestamp;
            self.flush_tail();
            return Ok(MillerSignal::EndOfCommunication);
        }

        self.state = State::Active;
        self.prev_symbol = Some(symbol);
        let bit = u16::from(symbol == Symbol::X);
        self.shift_reg = (self.shift_reg << 1) | bit;
        self.bit_count += 1;
        if self.bit_count == 9 {
            let byte = (self.shift_reg >> 1) as u8;
            let parity = self.shift_reg & 1 != 0;
            self.out_bytes.push(byte);
            self.out_parity.push(parity);
            self.shift_reg = 0;
            self.bit_count = 0;
        }
        self.end_time = timestamp;
        Ok(MillerSignal::Pending)
    }

    /// Every end-of-communication is the data bit `logical 0` (encoded as
    /// whatever symbol naturally follows the last real bit) immediately
    /// followed by a terminating Y, per the encoder. That "logical 0" is
    /// indistinguishable from real data as it arrives, so it's already
    /// been shifted into `shift_reg`/`bit_count` by the time the
    /// terminating Y fires — one bit too many, and for a 7-bit short
    /// frame (REQA/WUPA) that's the only bit that will ever push
    /// `bit_count` past 7, since there's no ninth (parity) bit to
    /// complete a normal byte group. So: `bit_count == 1` means a
    /// byte-and-parity-aligned frame just ended and that lone bit is
    /// purely the spurious placeholder (discard it); `bit_count > 1`
    /// means a short frame ended mid-byte and the placeholder's trailing
    /// zero is also that byte's never-transmitted LSB, so the register
    /// already holds the reconstructed byte as-is.
    fn flush_tail(&mut self) {
        if self.bit_count > 1 {
            if self.out_bytes.is_empty() {
                self.short_frame = true;
            }
            self.out_bytes.push((self.shift_reg & 0xff) as u8);
            self.out_parity.push(false);
        }
        self.shift_reg = 0;
        self.bit_count = 0;
    }

    /// Consumes the accumulated bytes/parity into a `Frame` after an
    /// `EndOfCommunication` signal, leaving the decoder reset.
    pub fn take_frame(&mut self) -> Frame {
        let bytes = std::mem::take(&mut self.out_bytes);
        let parity = std::mem::take(&mut self.out_parity);
        let bit_len = if self.short_frame {
            7
        } else {
            bytes.len() * 8
        };
        let start = self.start_time;
        let end = self.end_time;
        self.reset();
        Frame {
            bytes,
            bit_len,
            parity,
            start_time: start,
            end_time: end,
        }
    }
}

impl Default for MillerDecoder {
    fn default() -> Self {
        MillerDecoder {
            state: State::Unsyncd,
            first_half_mod: None,
            prev_symbol: None,
            shift_reg: 0,
            bit_count: 0,
            out_bytes: Vec::new(),
            out_parity: Vec::new(),
            start_time: 0,
            end_time: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_decoder_is_unsynchronised() {
        let d = MillerDecoder::new();
        assert!(!d.is_synchronised());
    }

    #[test]
    fn reset_clears_accumulated_bytes() {
        let mut d = MillerDecoder::new();
        d.out_bytes.push(0xaa);
        d.reset();
        assert!(d.out_bytes.is_empty());
        assert!(!d.is_synchronised());
    }

    #[test]
    fn both_halves_modulated_is_framing_violation() {
        let mut d = MillerDecoder::new();
        d.state = State::Active;
        let err = d.feed_nibble(0b0001, 0); // first half
        assert!(err.is_ok());
        let err = d.feed_nibble(0b1001, 1); // second half also modulated
        assert!(err.is_err());
        assert!(!d.is_synchronised());
    }

    #[test]
    fn unsyncd_ignores_noise_until_a_clean_z_arrives() {
        let mut d = MillerDecoder::new();
        // X then Y: neither is Z, decoder stays unsynchronised.
        d.feed_nibble(0b0000, 0).unwrap(); // first half of X
        d.feed_nibble(0b0001, 1).unwrap(); // second half of X
        assert!(!d.is_synchronised());
        d.feed_nibble(0b0001, 2).unwrap(); // first half of Z
        d.feed_nibble(0b0000, 3).unwrap(); // second half of Z
        assert!(d.is_synchronised());
    }
}
