//! An in-process half-duplex transport that drives the Miller and
//! Manchester codecs from each other's output, so the reader selection
//! engine (C4) and tag emulator (C5) can exchange frames without real RF
//! sampling hardware.
//!
//! This is the "narrow interface" machinery described in the data-flow
//! overview made concrete: a reader-side send is Miller-encoded, expanded
//! to sample nibbles, and fed into a fresh `MillerDecoder` representing the
//! tag's receiver; a tag-side send is Manchester-encoded (optionally
//! substituting `SEC_COLL` for a simulated collision) and fed into a fresh
//! `ManchesterDecoder` representing the reader's receiver. Running the
//! frame back through its matching decoder is what lets collisions,
//! framing violations and `collision_pos` surface exactly as they would
//! over the air.

use crate::codec::{
    expand_manchester, expand_miller, manchester_encode, merge_tag_nibbles, miller_encode,
    ManchesterDecoder, ManchesterSignal, MillerDecoder, MillerSignal,
};
use crate::error::{Error, Result};
use crate::types::Frame;

/// Miller-encodes `frame` and decodes it back through a fresh
/// `MillerDecoder`, as the tag's receiver would. Returns the frame the tag
/// actually perceives (its framing, bit length and parity may legitimately
/// differ from the input for malformed fragments fed in by a test).
pub fn reader_send(frame: &Frame, start_time: u32) -> Result<Frame> {
    let symbols = miller_encode(frame);
    let nibbles = expand_miller(&symbols);
    decode_miller_nibbles(&nibbles, start_time)
}

/// Feeds `nibbles` through a fresh `MillerDecoder`, returning the first
/// completed frame.
pub fn decode_miller_nibbles(nibbles: &[u8], start_time: u32) -> Result<Frame> {
    let mut dec = MillerDecoder::new();
    for (i, &nibble) in nibbles.iter().enumerate() {
        if dec.feed_nibble(nibble, start_time + i as u32)? == MillerSignal::EndOfCommunication {
            return Ok(dec.take_frame());
        }
    }
    Err(Error::FramingViolation {
        direction: "miller",
        state: "no-eoc",
    })
}

/// Result of a reader demodulating a tag's Manchester response: the
/// recovered frame (if any bits were received before end-of-communication)
/// and the first collision bit position, 1-based, zero if none.
#[derive(Debug, Clone)]
pub struct TagReceipt {
    /// The decoded frame, if the decoder reached a clean end-of-communication.
    pub frame: Option<Frame>,
    /// 1-based bit index of the first collision, zero if none was seen.
    pub collision_pos: u32,
}

/// Manchester-encodes `frame` (or a collision pattern, if `collision` is
/// set) and decodes it back through a fresh `ManchesterDecoder`, as the
/// reader's receiver would.
pub fn tag_send(frame: &Frame, collision: bool, start_time: u32) -> TagReceipt {
    let symbols = manchester_encode(frame, collision);
    let nibbles = expand_manchester(&symbols);
    decode_manchester_nibbles(&nibbles, start_time)
}

/// Synthesises the nibble stream several tags would jointly produce by
/// OR-combining their individually-encoded Manchester streams (§4.6's
/// physical-layer collision model), then decodes it as the reader would.
/// Used to simulate cascade-level collisions between multiple UIDs.
pub fn tag_send_collision(frames: &[&Frame], start_time: u32) -> TagReceipt {
    let streams: Vec<Vec<u8>> = frames
        .iter()
        .map(|f| expand_manchester(&manchester_encode(f, false)))
        .collect();
    let merged = merge_tag_nibbles(&streams);
    decode_manchester_nibbles(&merged, start_time)
}

/// Feeds `nibbles` through a fresh `ManchesterDecoder` until
/// end-of-communication or exhaustion, returning whatever was recovered.
pub fn decode_manchester_nibbles(nibbles: &[u8], start_time: u32) -> TagReceipt {
    let mut dec = ManchesterDecoder::new();
    for (i, &nibble) in nibbles.iter().enumerate() {
        if dec.feed_nibble(nibble, start_time + i as u32) == ManchesterSignal::EndOfCommunication {
            let collision_pos = dec.collision_pos();
            return TagReceipt {
                frame: Some(dec.take_frame()),
                collision_pos,
            };
        }
    }
    TagReceipt {
        frame: None,
        collision_pos: dec.collision_pos(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_send_round_trips_a_short_frame() {
        let frame = Frame::short(0x26, 0, 0);
        let received = reader_send(&frame, 0).unwrap();
        assert_eq!(received.bytes, frame.bytes);
        assert_eq!(received.bit_len, frame.bit_len);
    }

    #[test]
    fn reader_send_round_trips_a_full_byte_frame_with_parity() {
        let frame = Frame::from_bytes(vec![0x93, 0x20], 0, 0);
        let received = reader_send(&frame, 0).unwrap();
        assert_eq!(received.bytes, frame.bytes);
        assert_eq!(received.parity, frame.parity);
    }

    #[test]
    fn tag_send_round_trips_a_frame() {
        let frame = Frame::from_bytes(vec![0x04, 0x00], 0, 0);
        let receipt = tag_send(&frame, false, 0);
        assert_eq!(receipt.frame.unwrap().bytes, frame.bytes);
        assert_eq!(receipt.collision_pos, 0);
    }

    #[test]
    fn tag_send_collision_flags_every_bit_position() {
        let frame = Frame::from_bytes(vec![0xff], 0, 0);
        let receipt = tag_send(&frame, true, 0);
        assert!(receipt.collision_pos > 0);
    }

    #[test]
    fn merged_collision_detects_bit_where_uids_differ() {
        // Two UIDs agreeing on byte 0 (0xAA) but differing at bit 0 of byte 1.
        let a = Frame::from_bytes(vec![0xaa, 0x00], 0, 0);
        let b = Frame::from_bytes(vec![0xaa, 0x80], 0, 0);
        let receipt = tag_send_collision(&[&a, &b], 0);
        // Bits 1-8 are byte0's data (identical), bit 9 its parity (identical
        // since the byte is identical); bit 10 is the first data bit of
        // byte1, where the two frames first disagree.
        assert_eq!(receipt.collision_pos, 10);
    }
}
