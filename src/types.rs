//! Core data-model types for the ISO 14443-A engine.
//!
//! Frames, card descriptors, tag profiles and polling profiles as
//! described by the data model: a `Frame` is a `(bytes, bit_len)` pair
//! with a parallel parity bitstring rather than a bare byte vector, so
//! that 7-bit short frames and odd-bit anti-collision fragments are
//! representable without a separate type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical ISO 14443-A frame: payload bytes, its bit length (to
/// support 7-bit short frames and anti-collision fragments), a
/// per-byte odd-parity bitstring, and timestamps in sub-carrier cycles.
///
/// Invariant: `parity.len() == bytes.len()` (one parity bit per whole
/// byte of payload, even for the last partial byte of a fragment —
/// callers with only `bit_len % 8` valid bits in the last byte simply
/// don't emit or check that byte's parity bit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Payload bytes, most-significant bit of `bit_len` first.
    pub bytes: Vec<u8>,
    /// Total length in bits. `bit_len % 8 == 7` marks a short frame.
    pub bit_len: usize,
    /// One odd-parity bit per byte of `bytes`.
    pub parity: Vec<bool>,
    /// Start timestamp, in sub-carrier cycles.
    pub start_time: u32,
    /// End timestamp, in sub-carrier cycles. Always `>= start_time`.
    pub end_time: u32,
}

impl Frame {
    /// Build a full-byte frame (`bit_len == bytes.len() * 8`) with
    /// odd parity computed from the payload.
    pub fn from_bytes(bytes: Vec<u8>, start_time: u32, end_time: u32) -> Self {
        let parity = bytes.iter().map(|b| odd_parity(*b)).collect();
        let bit_len = bytes.len() * 8;
        Frame {
            bytes,
            bit_len,
            parity,
            start_time,
            end_time,
        }
    }

    /// Build a 7-bit short frame (e.g. REQA/WUPA) carrying no parity.
    pub fn short(byte: u8, start_time: u32, end_time: u32) -> Self {
        Frame {
            bytes: vec![byte],
            bit_len: 7,
            parity: vec![false],
            start_time,
            end_time,
        }
    }

    /// Builds an anti-collision fragment: `bit_len` need not be a
    /// multiple of 8 (the trailing partial byte is zero-padded beyond
    /// its valid bits). Parity is still computed per the framing
    /// invariant, but `codec::encode::carries_parity` never emits it for
    /// a fragment whose `bit_len` isn't byte-aligned, matching real
    /// anti-collision framing (no parity bits at all while the UID is
    /// still being walked).
    pub fn fragment(bytes: Vec<u8>, bit_len: usize, start_time: u32, end_time: u32) -> Self {
        let parity = bytes.iter().map(|b| odd_parity(*b)).collect();
        Frame {
            bytes,
            bit_len,
            parity,
            start_time,
            end_time,
        }
    }

    /// Whether this is a 7-bit short frame per the framing invariant.
    pub fn is_short(&self) -> bool {
        self.bit_len % 8 == 7
    }

    /// Number of whole bytes represented (rounds up for short/partial frames).
    pub fn byte_len(&self) -> usize {
        self.bit_len.div_ceil(8)
    }
}

/// Returns the odd-parity bit of `byte`: true iff the number of set
/// bits in `byte` is even (so total set bits, including the parity
/// bit itself, is odd).
pub fn odd_parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

/// Packs a sequence of per-byte parity bits MSB-first into parity
/// bytes, eight bits per parity byte, mirroring `GetParity` in the
/// reference reader firmware.
pub fn pack_parity(bits: &[bool]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bits.len().div_ceil(8) + 1);
    let mut acc = 0u8;
    let mut count = 0u8;
    for &bit in bits {
        if bit {
            acc |= 1 << (7 - count);
        }
        count += 1;
        if count == 8 {
            out.push(acc);
            acc = 0;
            count = 0;
        }
    }
    out.push(acc);
    out
}

/// A fully resolved card descriptor, as produced by a successful
/// selection round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardDescriptor {
    /// 2-byte Answer To Request.
    pub atqa: [u8; 2],
    /// UID, 4, 7 or 10 bytes (cascade tag bytes stripped).
    pub uid: Vec<u8>,
    /// Select Acknowledge, final cascade level.
    pub sak: u8,
    /// Answer To Select, if the tag is ISO 14443-4 compliant.
    pub ats: Vec<u8>,
}

bitflags::bitflags! {
    /// Bits of the Select Acknowledge byte the engine inspects. Other
    /// bits are profile-specific and left unmodelled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SakFlags: u8 {
        /// More cascade levels remain (UID not yet complete).
        const CASCADE = 0x04;
        /// Tag is ISO/IEC 14443-4 compliant (RATS is meaningful).
        const COMPLIANT_14443_4 = 0x20;
    }
}

/// Mifare Classic key type, selecting between the `0x60`/`0x61` AUTH
/// command variants and indexing the darkside/NACK-bug nonce-capture
/// slots alongside the sector number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    A,
    B,
}

impl CardDescriptor {
    /// The last 4 UID bytes, reinterpreted big-endian, used as the
    /// Crypto-1 salt (CUID).
    pub fn cuid(&self) -> u32 {
        let n = self.uid.len();
        let tail = &self.uid[n.saturating_sub(4)..];
        let mut buf = [0u8; 4];
        buf[4 - tail.len()..].copy_from_slice(tail);
        u32::from_be_bytes(buf)
    }
}

/// Outcome of a full selection round trip (`iso14a_card_select_t`
/// analogue), always serialisable so the CLI can emit it as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectResult {
    /// Card descriptor, populated only on full success.
    pub card: Option<CardDescriptor>,
    /// Number of cascade levels walked (1, 2 or 3).
    pub cascade_levels: u8,
    /// Whether RATS was attempted and an ATS recovered.
    pub rats_performed: bool,
}

/// Tag-type enumeration, each determining default ATQA/SAK/ATS, page
/// count, and the dispatch subset the emulator honours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TagType {
    /// Mifare Classic 1K.
    MifareClassic1k,
    /// Mifare Classic 4K.
    MifareClassic4k,
    /// Mifare Classic Mini (320 bytes).
    MifareClassicMini,
    /// Mifare Ultralight.
    MifareUltralight,
    /// Mifare Ultralight C (3DES authentication).
    MifareUltralightC,
    /// NXP NTAG-215.
    Ntag215,
    /// MIFARE DESFire.
    Desfire,
    /// NXP JCOP Java Card.
    Jcop,
    /// JCOP configured for EMV payment applets.
    JcopEmv,
    /// TNP3 (gaming token) profile.
    Tnp3,
    /// Fudan FM11RF005SH Mifare Classic clone.
    Fm11Rf005sh,
    /// ST25TA NFC Forum Type 4 tag.
    St25ta,
    /// HID Seos credential.
    HidSeos,
}

impl fmt::Display for TagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TagType::MifareClassic1k => "Mifare Classic 1K",
            TagType::MifareClassic4k => "Mifare Classic 4K",
            TagType::MifareClassicMini => "Mifare Classic Mini",
            TagType::MifareUltralight => "Mifare Ultralight",
            TagType::MifareUltralightC => "Mifare Ultralight C",
            TagType::Ntag215 => "NTAG-215",
            TagType::Desfire => "DESFire",
            TagType::Jcop => "JCOP",
            TagType::JcopEmv => "JCOP-EMV",
            TagType::Tnp3 => "TNP3",
            TagType::Fm11Rf005sh => "FM11RF005SH",
            TagType::St25ta => "ST25TA",
            TagType::HidSeos => "HID Seos",
        };
        f.write_str(s)
    }
}

impl TagType {
    /// True for tag types that speak ISO 14443-4 (RATS-capable).
    pub fn iso14443_4_compliant(self) -> bool {
        matches!(
            self,
            TagType::Desfire
                | TagType::Jcop
                | TagType::JcopEmv
                | TagType::St25ta
                | TagType::HidSeos
        )
    }

    /// True for the Mifare Ultralight / NTAG family (shared command set).
    pub fn is_ultralight_family(self) -> bool {
        matches!(
            self,
            TagType::MifareUltralight | TagType::MifareUltralightC | TagType::Ntag215
        )
    }

    /// True for the Mifare Classic family (CRYPTO1 AUTH command set).
    pub fn is_classic_family(self) -> bool {
        matches!(
            self,
            TagType::MifareClassic1k
                | TagType::MifareClassic4k
                | TagType::MifareClassicMini
                | TagType::Fm11Rf005sh
                | TagType::Tnp3
        )
    }

    /// Page/block count used to range-check READ/WRITE arguments.
    pub fn page_count(self) -> u16 {
        match self {
            TagType::MifareUltralight => 16,
            TagType::MifareUltralightC => 48,
            TagType::Ntag215 => 135,
            TagType::MifareClassicMini => 20,
            TagType::MifareClassic1k => 64,
            TagType::MifareClassic4k => 256,
            _ => 0,
        }
    }
}

/// One entry of the reader's ordered polling profile: a frame to
/// send, the bit length of its last byte, and an optional post-send
/// delay in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingFrame {
    /// Raw bytes to transmit.
    pub frame: Vec<u8>,
    /// Bit length of the final byte (7 for REQA/WUPA-style wake-ups).
    pub last_byte_bits: u8,
    /// Delay after sending this frame before the next one, in ms.
    pub post_delay_ms: u16,
}

/// An ordered polling profile plus a global extra timeout, used to
/// wake tags that require non-standard wake-up sequences (e.g.
/// "Magsafe"-style WUPA variants).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingProfile {
    /// Frames to cycle through, in order.
    pub frames: Vec<PollingFrame>,
    /// Extra timeout (ms) added on top of the per-frame receive window.
    pub extra_timeout_ms: u32,
}

impl PollingProfile {
    /// The standard single-frame WUPA profile.
    pub fn wupa() -> Self {
        PollingProfile {
            frames: vec![PollingFrame {
                frame: vec![0x52],
                last_byte_bits: 7,
                post_delay_ms: 0,
            }],
            extra_timeout_ms: 0,
        }
    }

    /// The standard single-frame REQA profile.
    pub fn reqa() -> Self {
        PollingProfile {
            frames: vec![PollingFrame {
                frame: vec![0x26],
                last_byte_bits: 7,
                post_delay_ms: 0,
            }],
            extra_timeout_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odd_parity_of_known_bytes() {
        assert!(odd_parity(0x00)); // 0 set bits -> parity bit set to keep total odd
        assert!(!odd_parity(0x01)); // 1 set bit -> already odd
        assert!(odd_parity(0x03)); // 2 set bits -> even, parity bit set
    }

    #[test]
    fn pack_parity_msb_first() {
        let bits = vec![true, false, true, false, false, false, false, false];
        let packed = pack_parity(&bits);
        assert_eq!(packed[0], 0b1010_0000);
    }

    #[test]
    fn frame_from_bytes_has_one_parity_per_byte() {
        let f = Frame::from_bytes(vec![0x93, 0x20], 0, 10);
        assert_eq!(f.parity.len(), f.bytes.len());
        assert_eq!(f.bit_len, 16);
        assert!(!f.is_short());
    }

    #[test]
    fn short_frame_is_seven_bits() {
        let f = Frame::short(0x26, 0, 5);
        assert!(f.is_short());
        assert_eq!(f.byte_len(), 1);
    }

    #[test]
    fn cuid_is_last_four_uid_bytes_big_endian() {
        let card = CardDescriptor {
            atqa: [0x04, 0x00],
            uid: vec![0x11, 0xDE, 0xAD, 0xBE, 0xEF],
            sak: 0x08,
            ats: vec![],
        };
        assert_eq!(card.cuid(), 0xDEADBEEF);
    }
}
