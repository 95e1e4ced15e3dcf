//! Reader-side selection engine (C4): the POLL loop, the anti-collision
//! bit walk, SELECT/SAK handling and RATS, driving one or more
//! `TagEmulator`s (or any other `RespondingTag`) through a session the way
//! a real reader drives tags in its field.
//!
//! Every transmit goes through `TimingController::align_transmit` so the
//! request guard time invariant holds even in this in-process simulation;
//! the actual byte exchange is delegated to `link`'s Manchester round trip
//! so collisions surface exactly as `link::TagReceipt::collision_pos`
//! reports them over the air.

use crate::config::{AnticolOverride, BccOverride, CascadeOverride, RatsOverride};
use crate::context::EngineContext;
use crate::emulator::{self, TagEmulator, TagResponse};
use crate::error::{Error, Result};
use crate::framer;
use crate::link;
use crate::rf::RfFrontend;
use crate::types::{CardDescriptor, Frame, SakFlags, SelectResult};

/// Anything that answers a dispatched frame the way `TagEmulator` does.
/// `CollidingTags` is generic over this rather than `TagEmulator`
/// directly so a future mock or a real-hardware adapter can stand in for
/// it in tests without touching the selection engine.
pub trait RespondingTag {
    fn dispatch(&mut self, frame: &Frame, now_ssp: u32) -> Option<TagResponse>;
}

impl RespondingTag for TagEmulator {
    fn dispatch(&mut self, frame: &Frame, now_ssp: u32) -> Option<TagResponse> {
        TagEmulator::dispatch(self, frame, now_ssp)
    }
}

/// One or more tags sharing the same field. A broadcast frame is
/// dispatched to every tag; their `Frame`-type answers are OR-merged
/// through `link::tag_send_collision`'s physical-layer model so a real
/// bit collision between two UIDs is visible to the caller exactly as it
/// would be over the air. `Ack4` answers (post-selection command
/// responses) are assumed collision-free, since only one tag is ever
/// active by the time those commands are sent.
pub struct CollidingTags<'a> {
    tags: Vec<&'a mut dyn RespondingTag>,
}

impl<'a> CollidingTags<'a> {
    /// Wraps an already-built list of tags.
    pub fn new(tags: Vec<&'a mut dyn RespondingTag>) -> Self {
        CollidingTags { tags }
    }

    /// Convenience for the common single-tag case.
    pub fn single(tag: &'a mut dyn RespondingTag) -> Self {
        CollidingTags { tags: vec![tag] }
    }

    fn broadcast(&mut self, frame: &Frame, now_ssp: u32) -> link::TagReceipt {
        let mut frames = Vec::new();
        for tag in self.tags.iter_mut() {
            if let Some(TagResponse::Frame(f)) = tag.dispatch(frame, now_ssp) {
                frames.push(f);
            }
        }
        match frames.len() {
            0 => link::TagReceipt {
                frame: None,
                collision_pos: 0,
            },
            1 => link::tag_send(&frames[0], false, now_ssp),
            _ => {
                let refs: Vec<&Frame> = frames.iter().collect();
                link::tag_send_collision(&refs, now_ssp)
            }
        }
    }

    /// Sends a command to the single currently-selected tag and returns
    /// its 4-bit ACK/NACK code, if any. Used by post-selection commands
    /// (READ/WRITE/AUTH) where collisions can't occur.
    pub fn send_ack4(&mut self, frame: &Frame, now_ssp: u32) -> Option<u8> {
        for tag in self.tags.iter_mut() {
            if let Some(TagResponse::Ack4(code)) = tag.dispatch(frame, now_ssp) {
                return Some(code);
            }
        }
        None
    }
}

/// NVB byte for `known_bits` already agreed: high nibble counts whole
/// bytes of SEL+NVB+UID known so far (2 fixed plus whatever UID bytes are
/// complete), low nibble counts valid bits of the trailing partial byte.
/// Inverse of the parsing `emulator::handle_anticol_or_select` does.
fn nvb_byte(known_bits: usize) -> u8 {
    let complete_bytes = (known_bits / 8) as u8;
    let extra_bits = (known_bits % 8) as u8;
    ((2 + complete_bytes) << 4) | extra_bits
}

fn set_bit(buf: &mut [u8; 5], bit_index: usize, value: bool) {
    let byte = bit_index / 8;
    let off = 7 - (bit_index % 8);
    if value {
        buf[byte] |= 1 << off;
    } else {
        buf[byte] &= !(1 << off);
    }
}

/// Splices `take_bits` MSB-first bits of `source` into `buf` starting at
/// absolute bit offset `known_bits`. The inverse of `emulator::tail_bits`.
fn merge_bits(buf: &mut [u8; 5], known_bits: usize, source: &[u8], take_bits: usize) {
    for i in 0..take_bits {
        let bit = (source[i / 8] >> (7 - i % 8)) & 1;
        set_bit(buf, known_bits + i, bit == 1);
    }
}

/// One step of the anti-collision bit walk: given how many bits were
/// already known and the collision position a round just reported (1-based,
/// zero for "no collision, fully resolved"), returns how many bits are
/// known after splicing in the forced `1` at the collision point. Pure so
/// the convergence arithmetic is testable without a tag or RF front end.
pub fn walk(known_bits: usize, collision_pos: u32) -> usize {
    if collision_pos == 0 {
        40
    } else {
        known_bits + collision_pos as usize
    }
}

fn anticollision_level(
    ctx: &mut EngineContext,
    rf: &dyn RfFrontend,
    tags: &mut CollidingTags,
    level: u8,
) -> Result<([u8; 5], u8)> {
    let sel = 0x93 + 2 * (level - 1);
    let mut known_bits = 0usize;
    let mut buf = [0u8; 5];
    let mut rounds = 0usize;

    while known_bits < 40 {
        rounds += 1;
        if rounds > ctx.options.max_collision_rounds {
            return Err(Error::CollisionWalkFailed { rounds });
        }

        let whole_bytes = known_bits / 8;
        let extra_bits = known_bits % 8;
        let (start, _) = ctx.timing.align_transmit(None, rf);

        let mut payload = vec![sel, nvb_byte(known_bits)];
        payload.extend_from_slice(&buf[..whole_bytes]);
        let bit_len = 16 + known_bits;
        let frame = if extra_bits > 0 {
            payload.push(buf[whole_bytes]);
            Frame::fragment(payload, bit_len, start, start)
        } else {
            Frame::from_bytes(payload, start, start)
        };

        let receipt = tags.broadcast(&frame, start);
        let Some(resp) = receipt.frame else {
            return Err(Error::CollisionWalkFailed { rounds });
        };

        if receipt.collision_pos == 0 {
            merge_bits(&mut buf, known_bits, &resp.bytes, 40 - known_bits);
        } else {
            let take = receipt.collision_pos as usize - 1;
            merge_bits(&mut buf, known_bits, &resp.bytes, take);
            set_bit(&mut buf, known_bits + take, true);
        }
        known_bits = walk(known_bits, receipt.collision_pos);
    }

    match ctx.config.forcebcc {
        BccOverride::Std => {
            let expected = buf[0] ^ buf[1] ^ buf[2] ^ buf[3];
            if buf[4] != expected {
                return Err(Error::BccMismatch {
                    expected,
                    actual: buf[4],
                });
            }
        }
        BccOverride::Fix => buf[4] = buf[0] ^ buf[1] ^ buf[2] ^ buf[3],
        BccOverride::Accept => {}
    }

    let (start, _) = ctx.timing.align_transmit(None, rf);
    let mut select_payload = vec![sel, 0x70];
    select_payload.extend_from_slice(&buf);
    let select_frame = framer::frame_with_crc(&select_payload, start, start);
    let receipt = tags.broadcast(&select_frame, start);
    let sak = receipt
        .frame
        .and_then(|f| f.bytes.first().copied())
        .ok_or(Error::NoSak { level })?;

    Ok((buf, sak))
}

/// Sends each frame of the session's polling profile in turn, returning
/// the first ATQA received.
pub fn poll(ctx: &mut EngineContext, rf: &dyn RfFrontend, tags: &mut CollidingTags) -> Result<[u8; 2]> {
    let mut attempts = 0usize;
    for pf in ctx.polling.frames.clone() {
        attempts += 1;
        let (start, _) = ctx.timing.align_transmit(None, rf);
        let frame = if pf.last_byte_bits == 7 {
            Frame::short(pf.frame[0], start, start)
        } else {
            Frame::from_bytes(pf.frame.clone(), start, start)
        };
        let receipt = tags.broadcast(&frame, start);
        if let Some(resp) = receipt.frame {
            if resp.bytes.len() >= 2 {
                return Ok([resp.bytes[0], resp.bytes[1]]);
            }
        }
    }
    Err(Error::NoAtqa { attempts })
}

/// ATQA prefixes a Fudan FM11RF005SH clone answers with: a Classic-style
/// ATQA whose second byte is always zero.
fn is_fudan_atqa(atqa: [u8; 2]) -> bool {
    (atqa[0] == 0x03 || atqa[0] == 0x05) && atqa[1] == 0x00
}

/// Fudan clones don't implement real anti-collision: their UID sits
/// behind an out-of-band `{0x30, 0x01, 0x8B, 0xB9}` read instead, and SAK
/// is synthesised as `0x0A` since no genuine SELECT response exists. Two
/// throwaway re-polls settle the card back into a normal pollable state
/// afterwards, matching the reference reader's handling of this clone.
fn fudan_select(
    ctx: &mut EngineContext,
    rf: &dyn RfFrontend,
    tags: &mut CollidingTags,
    atqa: [u8; 2],
) -> Result<CardDescriptor> {
    let (start, _) = ctx.timing.align_transmit(None, rf);
    let read_cmd = Frame::from_bytes(vec![0x30, 0x01, 0x8b, 0xb9], start, start);
    let receipt = tags.broadcast(&read_cmd, start);
    let uid = receipt
        .frame
        .map(|f| f.bytes.iter().take(4).copied().collect())
        .unwrap_or_default();

    for _ in 0..2 {
        let _ = poll(ctx, rf, tags);
    }

    Ok(CardDescriptor {
        atqa,
        uid,
        sak: 0x0a,
        ats: Vec::new(),
    })
}

fn rats(ctx: &mut EngineContext, rf: &dyn RfFrontend, tags: &mut CollidingTags) -> Result<Option<Vec<u8>>> {
    let (start, _) = ctx.timing.align_transmit(None, rf);
    let frame = framer::frame_with_crc(&[0xe0, 0x80], start, start);
    let receipt = tags.broadcast(&frame, start);
    let Some(resp) = receipt.frame else {
        return Ok(None);
    };
    framer::verify_crc(&resp.bytes)?;
    Ok(Some(resp.bytes[..resp.bytes.len() - 2].to_vec()))
}

/// Full selection round trip: POLL, the Fudan special case or the
/// anti-collision cascade (CL1 through CL3, gated by the configured
/// per-level overrides), then RATS if the final SAK calls for it (or the
/// config forces/skips it regardless).
pub fn select_card(
    ctx: &mut EngineContext,
    rf: &dyn RfFrontend,
    tags: &mut CollidingTags,
) -> Result<SelectResult> {
    if ctx.cancel.is_cancelled() {
        return Err(Error::UserAbort);
    }

    let atqa = poll(ctx, rf, tags)?;

    if is_fudan_atqa(atqa) {
        let card = fudan_select(ctx, rf, tags, atqa)?;
        return Ok(SelectResult {
            card: Some(card),
            cascade_levels: 1,
            rats_performed: false,
        });
    }

    if ctx.config.forceanticol == AnticolOverride::Skip {
        return Ok(SelectResult {
            card: None,
            cascade_levels: 0,
            rats_performed: false,
        });
    }

    let mut uid = Vec::new();
    let mut sak = 0u8;
    let mut cascade_levels = 0u8;

    for level in 1..=3u8 {
        let (buf, level_sak) = anticollision_level(ctx, rf, tags, level)?;
        cascade_levels = level;
        sak = level_sak;
        if buf[0] == 0x88 {
            uid.extend_from_slice(&buf[1..4]);
        } else {
            uid.extend_from_slice(&buf[..4]);
        }

        let flags = SakFlags::from_bits_truncate(sak);
        let continue_override = if level == 1 {
            ctx.config.forcecl2
        } else {
            ctx.config.forcecl3
        };
        let want_continue = match continue_override {
            CascadeOverride::Force => true,
            CascadeOverride::Skip => false,
            CascadeOverride::Std => flags.contains(SakFlags::CASCADE),
        };
        if !want_continue || level == 3 {
            break;
        }
    }

    let mut result = SelectResult {
        card: Some(CardDescriptor {
            atqa,
            uid,
            sak,
            ats: Vec::new(),
        }),
        cascade_levels,
        rats_performed: false,
    };

    let do_rats = match ctx.config.forcerats {
        RatsOverride::Force => true,
        RatsOverride::Skip => false,
        RatsOverride::Std => SakFlags::from_bits_truncate(sak).contains(SakFlags::COMPLIANT_14443_4),
    };

    if do_rats {
        if let Some(ats) = rats(ctx, rf, tags)? {
            if let Some(&tb1) = ats.get(3) {
                let (_fwt, sfgt) = crate::timing::TimingController::parse_ats_timing(tb1);
                ctx.timing.apply_sfgt(sfgt);
            }
            if let Some(card) = result.card.as_mut() {
                card.ats = ats;
            }
            result.rats_performed = true;
        }
    }

    Ok(result)
}

/// Selects a card whose UID is already known, skipping the anti-collision
/// bit walk entirely (`iso14443a_fast_select_card`'s equivalent) — used
/// once a prior full selection has already resolved the UID and the
/// reader just needs to reselect the same tag.
pub fn fast_select_card(
    ctx: &mut EngineContext,
    rf: &dyn RfFrontend,
    tags: &mut CollidingTags,
    uid: &[u8],
    cascade_levels: u8,
) -> Result<u8> {
    let levels = emulator::build_cascade_levels(uid);
    let mut sak = 0u8;
    for (i, bytes5) in levels
        .uid_bytes
        .iter()
        .enumerate()
        .take(cascade_levels as usize)
    {
        let sel = 0x93 + 2 * i as u8;
        let (start, _) = ctx.timing.align_transmit(None, rf);
        let mut payload = vec![sel, 0x70];
        payload.extend_from_slice(bytes5);
        let frame = framer::frame_with_crc(&payload, start, start);
        let receipt = tags.broadcast(&frame, start);
        sak = receipt
            .frame
            .and_then(|f| f.bytes.first().copied())
            .ok_or(Error::NoSak { level: i as u8 + 1 })?;
    }
    Ok(sak)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rf::SimulatedFrontend;
    use crate::types::TagType;

    #[test]
    fn nvb_byte_matches_emulators_known_bits_formula() {
        for known_bits in [0usize, 8, 13, 24, 32] {
            let nvb = nvb_byte(known_bits);
            let recovered = (((nvb >> 4) - 2) as usize) * 8 + (nvb & 0x0f) as usize;
            assert_eq!(recovered, known_bits);
        }
    }

    #[test]
    fn walk_converges_to_forty_on_no_collision() {
        assert_eq!(walk(24, 0), 40);
    }

    #[test]
    fn walk_advances_past_the_forced_bit_on_collision() {
        // Collision reported at 1-based bit 5 of this round's response:
        // bits [0,4) were valid, bit 4 gets forced to 1.
        assert_eq!(walk(0, 5), 5);
    }

    #[test]
    fn select_card_succeeds_for_single_classic_tag() {
        let mut tag = TagEmulator::new(TagType::MifareClassic1k, vec![0xde, 0xad, 0xbe, 0xef]);
        let mut ctx = EngineContext::new();
        let rf = SimulatedFrontend::new();
        let mut tags = CollidingTags::single(&mut tag);

        let result = select_card(&mut ctx, &rf, &mut tags).unwrap();
        let card = result.card.unwrap();
        assert_eq!(card.uid, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(card.sak, 0x08);
        assert_eq!(result.cascade_levels, 1);
        assert!(!result.rats_performed);
    }

    #[test]
    fn select_card_walks_two_cascade_levels_for_seven_byte_uid() {
        let uid = vec![0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
        let mut tag = TagEmulator::new(TagType::MifareUltralight, uid.clone());
        let mut ctx = EngineContext::new();
        let rf = SimulatedFrontend::new();
        let mut tags = CollidingTags::single(&mut tag);

        let result = select_card(&mut ctx, &rf, &mut tags).unwrap();
        let card = result.card.unwrap();
        assert_eq!(card.uid, uid);
        assert_eq!(result.cascade_levels, 2);
        assert_eq!(card.sak, 0x00);
    }

    #[test]
    fn select_card_performs_rats_for_iso14443_4_compliant_tag() {
        let mut tag = TagEmulator::new(TagType::Desfire, vec![0x04, 0x11, 0x22, 0x33]);
        let mut ctx = EngineContext::new();
        let rf = SimulatedFrontend::new();
        let mut tags = CollidingTags::single(&mut tag);

        let result = select_card(&mut ctx, &rf, &mut tags).unwrap();
        assert!(result.rats_performed);
        let card = result.card.unwrap();
        assert_eq!(card.ats, vec![0x05, 0x78, 0x80, 0x61, 0x02]);
    }

    #[test]
    fn colliding_tags_resolve_to_exactly_one_known_uid() {
        let uid_a = vec![0x11, 0x22, 0x33, 0x44];
        let uid_b = vec![0x11, 0x22, 0x33, 0x45];
        let mut tag_a = TagEmulator::new(TagType::MifareClassic1k, uid_a.clone());
        let mut tag_b = TagEmulator::new(TagType::MifareClassic1k, uid_b.clone());
        let mut ctx = EngineContext::new();
        let rf = SimulatedFrontend::new();
        let tag_list: Vec<&mut dyn RespondingTag> = vec![&mut tag_a, &mut tag_b];
        let mut tags = CollidingTags::new(tag_list);

        let result = select_card(&mut ctx, &rf, &mut tags).unwrap();
        let card = result.card.unwrap();
        assert!(card.uid == uid_a || card.uid == uid_b);
        assert_eq!(card.sak, 0x08);
        assert_eq!(result.cascade_levels, 1);
    }

    #[test]
    fn fast_select_card_matches_full_selections_sak() {
        let uid = vec![0xde, 0xad, 0xbe, 0xef];
        let mut tag = TagEmulator::new(TagType::MifareClassic1k, uid.clone());
        let mut ctx = EngineContext::new();
        let rf = SimulatedFrontend::new();

        let full_sak = {
            let mut tags = CollidingTags::single(&mut tag);
            select_card(&mut ctx, &rf, &mut tags).unwrap().card.unwrap().sak
        };

        let fast_sak = {
            let mut tags = CollidingTags::single(&mut tag);
            fast_select_card(&mut ctx, &rf, &mut tags, &uid, 1).unwrap()
        };

        assert_eq!(full_sak, fast_sak);
    }
}
