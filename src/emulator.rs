//! Tag emulator (C5): the dispatch-table state machine that answers a
//! reader's frames as a Mifare Classic / Ultralight-family / ISO 14443-4
//! tag would, including the Mifare Classic nonce-capture side effect that
//! feeds the darkside/NACK harness (C7).
//!
//! Dispatch is a flat, ordered table of `(predicate, handler)` pairs
//! (§9 Design Notes) rather than a cascaded `if`/`else` chain: `dispatch`
//! walks `DISPATCH_TABLE` in order and stops at the first rule whose guard
//! matches. A handler returning `Outcome::NoMatch` means "not mine, try
//! the next rule"; `Outcome::Silent` means the command was recognised but
//! the protocol calls for no reply (HALT, a captured `{nr}{ar}` pair, a
//! chained I-block); `Outcome::Respond(_)` carries the frame or 4-bit code
//! to send back.

use crate::crypto::TripleDes;
use crate::framer::{self, verify_crc};
use crate::prng;
use crate::types::{CardDescriptor, Frame, KeyType, TagType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a dispatch rule produced.
enum Outcome {
    /// This rule's guard didn't match; try the next one.
    NoMatch,
    /// The command matched but the protocol defines no reply.
    Silent,
    /// Send this back to the reader.
    Respond(TagResponse),
}

/// A tag's answer to a dispatched command: either a full frame (with CRC
/// already appended where the command calls for one) or a 4-bit
/// acknowledgement code to run through `codec::encode_4bit_ack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagResponse {
    Frame(Frame),
    Ack4(u8),
}

/// Emulator lifecycle state. Only the states the dispatch table actually
/// branches on are modelled; everything else is "idle and selectable".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagState {
    Idle,
    Halted,
    ClassicAuth { sector: u8, key_type: KeyType },
    UlcAuth1,
}

/// One captured `(nt, nr, ar)` triplet awaiting its Moebius-pair partner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NonceCapture {
    pub cuid: u32,
    pub nt: u32,
    pub nr: u32,
    pub ar: u32,
}

/// Two nonce/response transcripts captured under the same (sector,
/// key type) from the same reader — sufficient input for external key
/// recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoebiusPair {
    pub sector: u8,
    pub key_type: KeyType,
    pub first: NonceCapture,
    pub second: NonceCapture,
}

/// Precompiled ATQA/UIDCn/SAKCn levels computed once at init so
/// anti-collision responses can be emitted within the tight FDT budget,
/// rather than rebuilt on every frame. Shared with `selection.rs`, which
/// needs the same UID-to-cascade-bytes split to drive
/// `iso14443a_fast_select_card` without duplicating the splitting logic.
pub(crate) struct CascadeLevels {
    pub(crate) uid_bytes: Vec<[u8; 5]>, // 4 data bytes + BCC, per level
    pub(crate) sak_bytes: Vec<u8>,
}

fn default_atqa(tag_type: TagType) -> [u8; 2] {
    match tag_type {
        TagType::MifareClassic1k
        | TagType::MifareClassicMini
        | TagType::Fm11Rf005sh
        | TagType::Tnp3 => [0x04, 0x00],
        TagType::MifareClassic4k => [0x02, 0x00],
        TagType::MifareUltralight | TagType::MifareUltralightC | TagType::Ntag215 => {
            [0x44, 0x00]
        }
        TagType::Desfire => [0x44, 0x03],
        TagType::Jcop | TagType::JcopEmv | TagType::HidSeos => [0x04, 0x00],
        TagType::St25ta => [0x44, 0x00],
    }
}

fn default_sak(tag_type: TagType) -> u8 {
    match tag_type {
        TagType::MifareClassic1k | TagType::Fm11Rf005sh | TagType::Tnp3 => 0x08,
        TagType::MifareClassic4k => 0x18,
        TagType::MifareClassicMini => 0x09,
        TagType::MifareUltralight | TagType::MifareUltralightC | TagType::Ntag215 => 0x00,
        TagType::Desfire => 0x20,
        TagType::Jcop | TagType::JcopEmv => 0x28,
        TagType::St25ta => 0x20,
        TagType::HidSeos => 0x20,
    }
}

/// Fixed ATS for every ISO 14443-4-compliant profile: `TL=5, T0=0x78`
/// (TA/TB/TC all present, FSCI=8), `TA=0x80`, `TB=0x61` (FWI=6, SFGI=1),
/// `TC=0x02`. `TB(1)` is always at offset 3 in this fixed layout, which
/// `selection.rs` relies on when deriving FWT/SFGT.
fn default_ats(tag_type: TagType) -> Vec<u8> {
    if tag_type.iso14443_4_compliant() {
        vec![0x05, 0x78, 0x80, 0x61, 0x02]
    } else {
        Vec::new()
    }
}

fn bcc(uid4: &[u8]) -> u8 {
    uid4[0] ^ uid4[1] ^ uid4[2] ^ uid4[3]
}

pub(crate) fn build_cascade_levels(uid: &[u8]) -> CascadeLevels {
    match uid.len() {
        4 => {
            let mut bytes = [0u8; 5];
            bytes[..4].copy_from_slice(uid);
            bytes[4] = bcc(uid);
            CascadeLevels {
                uid_bytes: vec![bytes],
                sak_bytes: vec![0], // filled in by caller with the real final SAK
            }
        }
        7 => {
            let mut cl1 = [0u8; 5];
            cl1[0] = 0x88;
            cl1[1..4].copy_from_slice(&uid[0..3]);
            cl1[4] = bcc(&cl1[..4]);
            let mut cl2 = [0u8; 5];
            cl2[..4].copy_from_slice(&uid[3..7]);
            cl2[4] = bcc(&cl2[..4]);
            CascadeLevels {
                uid_bytes: vec![cl1, cl2],
                sak_bytes: vec![0x04, 0],
            }
        }
        10 => {
            let mut cl1 = [0u8; 5];
            cl1[0] = 0x88;
            cl1[1..4].copy_from_slice(&uid[0..3]);
            cl1[4] = bcc(&cl1[..4]);
            let mut cl2 = [0u8; 5];
            cl2[0] = 0x88;
            cl2[1..4].copy_from_slice(&uid[3..6]);
            cl2[4] = bcc(&cl2[..4]);
            let mut cl3 = [0u8; 5];
            cl3[..4].copy_from_slice(&uid[6..10]);
            cl3[4] = bcc(&cl3[..4]);
            CascadeLevels {
                uid_bytes: vec![cl1, cl2, cl3],
                sak_bytes: vec![0x04, 0x04, 0],
            }
        }
        other => panic!("unsupported UID length {other}; expected 4, 7 or 10"),
    }
}

/// Dispatch-table-driven emulation of a single tag profile.
pub struct TagEmulator {
    pub tag_type: TagType,
    pub uid: Vec<u8>,
    pub atqa: [u8; 2],
    pub ats: Vec<u8>,
    levels: CascadeLevels,
    state: TagState,
    memory: Vec<u8>,
    block_size: usize,
    pending_write_page: Option<u8>,
    password: [u8; 4],
    pack: [u8; 2],
    counters: [u32; 3],
    tearing: [u8; 3],
    prng_seed: u32,
    capture_nonces: bool,
    nonce_slots: HashMap<(u8, KeyType), NonceCapture>,
    moebius_pairs: Vec<MoebiusPair>,
    cipher: Option<Box<dyn TripleDes>>,
    pending_rnd_b: Option<[u8; 8]>,
    iv: [u8; 8],
}

impl TagEmulator {
    /// Builds a fresh emulator for `tag_type` with the given UID (4, 7 or
    /// 10 bytes), not yet selected or halted.
    pub fn new(tag_type: TagType, uid: Vec<u8>) -> Self {
        let mut levels = build_cascade_levels(&uid);
        *levels.sak_bytes.last_mut().unwrap() = default_sak(tag_type);
        let block_size = if tag_type.is_classic_family() { 16 } else { 4 };
        let page_count = if tag_type.is_classic_family() {
            tag_type.page_count() as usize
        } else {
            tag_type.page_count().max(16) as usize
        };
        TagEmulator {
            atqa: default_atqa(tag_type),
            ats: default_ats(tag_type),
            uid,
            levels,
            tag_type,
            state: TagState::Idle,
            memory: vec![0u8; page_count * block_size],
            block_size,
            pending_write_page: None,
            password: [0xff; 4],
            pack: [0x00, 0x00],
            counters: [0; 3],
            tearing: [0xbd; 3],
            prng_seed: 0x1234_5678,
            capture_nonces: false,
            nonce_slots: HashMap::new(),
            moebius_pairs: Vec::new(),
            cipher: None,
            pending_rnd_b: None,
            iv: [0; 8],
        }
    }

    /// Enables darkside/NACK-bug nonce capture for Classic AUTH exchanges.
    pub fn set_capture_nonces(&mut self, enabled: bool) {
        self.capture_nonces = enabled;
    }

    /// Installs the 3DES collaborator used by the Ultralight-C AUTH_1/2
    /// handshake. Without one, AUTH commands against a UL-C profile are
    /// simply never matched (the tag stays silent), which is the correct
    /// behaviour for a profile that isn't UL-C in the first place.
    pub fn set_cipher(&mut self, cipher: Box<dyn TripleDes>) {
        self.cipher = Some(cipher);
    }

    /// The card descriptor this emulator would report if selected.
    pub fn card_descriptor(&self) -> CardDescriptor {
        CardDescriptor {
            atqa: self.atqa,
            uid: self.uid.clone(),
            sak: *self.levels.sak_bytes.last().unwrap(),
            ats: self.ats.clone(),
        }
    }

    /// Drains every Moebius pair collected so far.
    pub fn take_moebius_pairs(&mut self) -> Vec<MoebiusPair> {
        std::mem::take(&mut self.moebius_pairs)
    }

    fn cuid(&self) -> u32 {
        self.card_descriptor().cuid()
    }

    fn nonce_at(&self, now_ssp: u32) -> u32 {
        prng::prng_successor(self.prng_seed, now_ssp & 0xffff)
    }

    fn respond_frame(&self, payload_with_crc: Vec<u8>, at: u32) -> TagResponse {
        TagResponse::Frame(Frame::from_bytes(payload_with_crc, at, at))
    }

    fn respond_with_crc(&self, payload: &[u8], at: u32) -> TagResponse {
        self.respond_frame(framer::append_crc(payload), at)
    }

    /// Runs `frame` through the dispatch table, returning the tag's
    /// answer (if any) and applying whatever state transition the
    /// matching rule calls for.
    pub fn dispatch(&mut self, frame: &Frame, now_ssp: u32) -> Option<TagResponse> {
        for handler in DISPATCH_TABLE {
            match handler(self, frame, now_ssp) {
                Outcome::NoMatch => continue,
                Outcome::Silent => return None,
                Outcome::Respond(r) => return Some(r),
            }
        }
        None
    }
}

type Handler = fn(&mut TagEmulator, &Frame, u32) -> Outcome;

const DISPATCH_TABLE: &[Handler] = &[
    handle_wupa,
    handle_reqa,
    handle_anticol_or_select,
    handle_pps,
    handle_halt,
    handle_rats,
    handle_classic_auth_response,
    handle_classic_auth,
    handle_ulc_auth2,
    handle_ulc_auth1,
    handle_comp_write_part2,
    handle_ul_write,
    handle_fast_read,
    handle_read,
    handle_read_sig,
    handle_read_cnt,
    handle_incr,
    handle_check_tearing,
    handle_pwd_auth,
    handle_iblock,
    handle_sblock_deselect,
];

fn handle_wupa(tag: &mut TagEmulator, frame: &Frame, now: u32) -> Outcome {
    if frame.is_short() && frame.bytes == [0x52] {
        Outcome::Respond(tag.respond_frame(tag.atqa.to_vec(), now))
    } else {
        Outcome::NoMatch
    }
}

fn handle_reqa(tag: &mut TagEmulator, frame: &Frame, now: u32) -> Outcome {
    if frame.is_short() && frame.bytes == [0x26] {
        if tag.state == TagState::Halted {
            Outcome::Silent
        } else {
            Outcome::Respond(tag.respond_frame(tag.atqa.to_vec(), now))
        }
    } else {
        Outcome::NoMatch
    }
}

fn sel_level(byte0: u8) -> Option<usize> {
    match byte0 {
        0x93 => Some(0),
        0x95 => Some(1),
        0x97 => Some(2),
        _ => None,
    }
}

fn handle_anticol_or_select(tag: &mut TagEmulator, frame: &Frame, now: u32) -> Outcome {
    if frame.bytes.len() < 2 {
        return Outcome::NoMatch;
    }
    let Some(level) = sel_level(frame.bytes[0]) else {
        return Outcome::NoMatch;
    };
    if level >= tag.levels.uid_bytes.len() {
        return Outcome::NoMatch;
    }
    let nvb = frame.bytes[1];
    let our = tag.levels.uid_bytes[level];

    if nvb == 0x70 {
        // SELECT: full 5 bytes + CRC must match our UID/BCC exactly.
        if frame.bytes.len() < 9 || &frame.bytes[2..7] != our.as_slice() {
            return Outcome::NoMatch;
        }
        if verify_crc(&frame.bytes[2..]).is_err() {
            return Outcome::NoMatch;
        }
        let sak = tag.levels.sak_bytes[level];
        return Outcome::Respond(tag.respond_with_crc(&[sak], now));
    }

    // Anti-collision: NVB's high nibble counts whole SEL+NVB+UID bytes
    // already agreed on (2 fixed + however many UID bytes), low nibble
    // counts the valid bits of the last partial byte.
    if nvb < 0x20 || nvb > 0x70 || (nvb >> 4) < 2 {
        return Outcome::NoMatch;
    }
    let known_bits = (((nvb >> 4) - 2) as usize) * 8 + (nvb & 0x0f) as usize;
    if known_bits > 32 {
        return Outcome::NoMatch;
    }
    let known_bytes = known_bits / 8;
    let known_extra_bits = known_bits % 8;
    let given = &frame.bytes[2..];
    if given.len() < known_bytes + usize::from(known_extra_bits > 0) {
        return Outcome::NoMatch;
    }
    for i in 0..known_bytes {
        if given[i] != our[i] {
            return Outcome::NoMatch;
        }
    }
    if known_extra_bits > 0 {
        let mask = 0xffu8 << (8 - known_extra_bits);
        if given[known_bytes] & mask != our[known_bytes] & mask {
            return Outcome::NoMatch;
        }
    }

    if known_bits == 0 {
        Outcome::Respond(tag.respond_frame(our.to_vec(), now))
    } else {
        let remaining_bits = 40 - known_bits;
        Outcome::Respond(TagResponse::Frame(Frame::fragment(
            tail_bits(&our, known_bits),
            remaining_bits,
            now,
            now,
        )))
    }
}

/// Left-shifts the bits of `data` from bit offset `known_bits` (0-based,
/// MSB first) down to bit 0 of a fresh, minimally-sized byte buffer — what
/// a tag actually puts on the air after a collision: only the bits beyond
/// what the reader already echoed back as known, not the known prefix
/// itself.
fn tail_bits(data: &[u8; 5], known_bits: usize) -> Vec<u8> {
    let total_bits = data.len() * 8;
    let remaining = total_bits - known_bits;
    let mut out = vec![0u8; remaining.div_ceil(8).max(1)];
    for i in 0..remaining {
        let src_bit = known_bits + i;
        let bit = (data[src_bit / 8] >> (7 - src_bit % 8)) & 1;
        out[i / 8] |= bit << (7 - i % 8);
    }
    out
}

fn handle_pps(tag: &mut TagEmulator, frame: &Frame, now: u32) -> Outcome {
    if frame.bytes.first().map(|b| b & 0xf0) == Some(0xd0) {
        let pps0 = frame.bytes[0];
        Outcome::Respond(tag.respond_with_crc(&[pps0], now))
    } else {
        Outcome::NoMatch
    }
}

fn handle_halt(tag: &mut TagEmulator, frame: &Frame, _now: u32) -> Outcome {
    if frame.bytes.len() >= 2 && frame.bytes[0] == 0x50 && frame.bytes[1] == 0x00 {
        tag.state = TagState::Halted;
        Outcome::Silent
    } else {
        Outcome::NoMatch
    }
}

fn handle_rats(tag: &mut TagEmulator, frame: &Frame, now: u32) -> Outcome {
    if frame.bytes.len() >= 2 && frame.bytes[0] == 0xe0 {
        if !tag.tag_type.iso14443_4_compliant() {
            return Outcome::Silent;
        }
        Outcome::Respond(tag.respond_with_crc(&tag.ats.clone(), now))
    } else {
        Outcome::NoMatch
    }
}

fn key_type_of(cmd: u8) -> Option<KeyType> {
    match cmd {
        0x60 => Some(KeyType::A),
        0x61 => Some(KeyType::B),
        _ => None,
    }
}

fn handle_classic_auth(tag: &mut TagEmulator, frame: &Frame, now: u32) -> Outcome {
    if frame.bytes.len() < 2 || !tag.tag_type.is_classic_family() {
        return Outcome::NoMatch;
    }
    let Some(key_type) = key_type_of(frame.bytes[0]) else {
        return Outcome::NoMatch;
    };
    let block = frame.bytes[1];
    let sector = block / 4;
    tag.state = TagState::ClassicAuth { sector, key_type };
    let nt = tag.nonce_at(now);
    Outcome::Respond(tag.respond_frame(nt.to_be_bytes().to_vec(), now))
}

fn handle_classic_auth_response(tag: &mut TagEmulator, frame: &Frame, now: u32) -> Outcome {
    let TagState::ClassicAuth { sector, key_type } = tag.state else {
        return Outcome::NoMatch;
    };
    if frame.bit_len != 64 || frame.bytes.len() != 8 {
        return Outcome::NoMatch;
    }
    if tag.capture_nonces {
        let nt = tag.nonce_at(now);
        let nr = u32::from_be_bytes(frame.bytes[0..4].try_into().unwrap());
        let ar = u32::from_be_bytes(frame.bytes[4..8].try_into().unwrap());
        let capture = NonceCapture {
            cuid: tag.cuid(),
            nt,
            nr,
            ar,
        };
        let key = (sector, key_type);
        if let Some(first) = tag.nonce_slots.remove(&key) {
            tag.moebius_pairs.push(MoebiusPair {
                sector,
                key_type,
                first,
                second: capture,
            });
        } else {
            tag.nonce_slots.insert(key, capture);
        }
    }
    tag.state = TagState::Idle;
    Outcome::Silent
}

fn handle_ulc_auth1(tag: &mut TagEmulator, frame: &Frame, now: u32) -> Outcome {
    if frame.bytes.len() < 2
        || frame.bytes[0] != 0x1a
        || tag.tag_type != TagType::MifareUltralightC
    {
        return Outcome::NoMatch;
    }
    let Some(cipher) = tag.cipher.as_ref() else {
        return Outcome::NoMatch;
    };
    let nt = tag.nonce_at(now);
    let mut rnd_b = [0u8; 8];
    rnd_b[..4].copy_from_slice(&nt.to_be_bytes());
    rnd_b[4..].copy_from_slice(&(!nt).to_be_bytes());

    let iv = [0u8; 8];
    let encrypted = cipher.encrypt_block(&rnd_b, &iv);
    tag.iv = encrypted;
    tag.pending_rnd_b = Some(rnd_b);
    tag.state = TagState::UlcAuth1;

    let mut payload = Vec::with_capacity(9);
    payload.push(0xaf);
    payload.extend_from_slice(&encrypted);
    Outcome::Respond(tag.respond_with_crc(&payload, now))
}

fn rol8(bytes: &[u8; 8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..7].copy_from_slice(&bytes[1..]);
    out[7] = bytes[0];
    out
}

fn handle_ulc_auth2(tag: &mut TagEmulator, frame: &Frame, now: u32) -> Outcome {
    if tag.state != TagState::UlcAuth1 || frame.bytes.first() != Some(&0xaf) {
        return Outcome::NoMatch;
    }
    if frame.bytes.len() < 17 || verify_crc(&frame.bytes[1..]).is_err() {
        tag.state = TagState::Idle;
        return Outcome::Respond(TagResponse::Ack4(crate::codec::NACK_PA));
    }
    let Some(cipher) = tag.cipher.as_ref() else {
        return Outcome::NoMatch;
    };
    let Some(rnd_b) = tag.pending_rnd_b else {
        return Outcome::NoMatch;
    };

    let block1: [u8; 8] = frame.bytes[1..9].try_into().unwrap();
    let block2: [u8; 8] = frame.bytes[9..17].try_into().unwrap();
    let decrypted1 = cipher.decrypt_block(&block1, &tag.iv);
    let decrypted2 = cipher.decrypt_block(&block2, &block1);

    let expected_rnd_b_rol = rol8(&rnd_b);
    tag.state = TagState::Idle;
    tag.pending_rnd_b = None;
    if decrypted2 != expected_rnd_b_rol {
        return Outcome::Respond(TagResponse::Ack4(crate::codec::NACK_IV));
    }

    let rnd_a_rol = rol8(&decrypted1);
    let response_cipher = cipher.encrypt_block(&rnd_a_rol, &block2);
    let mut payload = Vec::with_capacity(9);
    payload.push(0x00);
    payload.extend_from_slice(&response_cipher);
    Outcome::Respond(tag.respond_with_crc(&payload, now))
}

fn page_range_ok(tag: &TagEmulator, first: u8, count: u8) -> bool {
    tag.tag_type.is_ultralight_family()
        && u16::from(first) + u16::from(count) <= tag.tag_type.page_count()
}

fn handle_read(tag: &mut TagEmulator, frame: &Frame, now: u32) -> Outcome {
    if frame.bytes.len() < 2 || frame.bytes[0] != 0x30 {
        return Outcome::NoMatch;
    }
    let block = frame.bytes[1];
    if tag.tag_type.is_ultralight_family() {
        if !page_range_ok(tag, block, 1) {
            return Outcome::Respond(TagResponse::Ack4(crate::codec::NACK_IV));
        }
        let mut out = Vec::with_capacity(16);
        // READ returns 4 consecutive pages (16 bytes), wrapping at the
        // end of memory, as the Ultralight/NTAG family does.
        for i in 0..4 {
            let page = (block as usize + i) % tag.tag_type.page_count() as usize;
            let off = page * tag.block_size;
            out.extend_from_slice(&tag.memory[off..off + tag.block_size]);
        }
        Outcome::Respond(tag.respond_with_crc(&out, now))
    } else if tag.tag_type.is_classic_family() {
        if u16::from(block) >= tag.tag_type.page_count() {
            return Outcome::Respond(TagResponse::Ack4(crate::codec::NACK_IV));
        }
        let off = block as usize * tag.block_size;
        let out = tag.memory[off..off + tag.block_size].to_vec();
        Outcome::Respond(tag.respond_with_crc(&out, now))
    } else {
        Outcome::NoMatch
    }
}

fn handle_fast_read(tag: &mut TagEmulator, frame: &Frame, now: u32) -> Outcome {
    if frame.bytes.len() < 3 || frame.bytes[0] != 0x3a || !tag.tag_type.is_ultralight_family() {
        return Outcome::NoMatch;
    }
    let (b1, b2) = (frame.bytes[1], frame.bytes[2]);
    if b1 > b2 || u16::from(b2) >= tag.tag_type.page_count() {
        return Outcome::Respond(TagResponse::Ack4(crate::codec::NACK_IV));
    }
    let mut out = Vec::with_capacity((b2 - b1 + 1) as usize * 4);
    for page in b1..=b2 {
        let off = page as usize * tag.block_size;
        out.extend_from_slice(&tag.memory[off..off + tag.block_size]);
    }
    Outcome::Respond(tag.respond_with_crc(&out, now))
}

fn handle_ul_write(tag: &mut TagEmulator, frame: &Frame, _now: u32) -> Outcome {
    if frame.bytes.len() < 8 || frame.bytes[0] != 0xa2 || !tag.tag_type.is_ultralight_family() {
        return Outcome::NoMatch;
    }
    if verify_crc(&frame.bytes[..8]).is_err() {
        return Outcome::Respond(TagResponse::Ack4(crate::codec::NACK_PA));
    }
    let page = frame.bytes[1];
    if !page_range_ok(tag, page, 1) {
        return Outcome::Respond(TagResponse::Ack4(crate::codec::NACK_IV));
    }
    let data = &frame.bytes[2..6];
    let off = page as usize * tag.block_size;
    if page == 3 {
        // OTP page: bits only ever get set, never cleared.
        for i in 0..4 {
            tag.memory[off + i] |= data[i];
        }
    } else {
        tag.memory[off..off + 4].copy_from_slice(data);
    }
    Outcome::Respond(TagResponse::Ack4(crate::codec::ACK))
}

fn handle_comp_write_part2(tag: &mut TagEmulator, frame: &Frame, _now: u32) -> Outcome {
    let Some(page) = tag.pending_write_page else {
        if frame.bytes.len() >= 2 && frame.bytes[0] == 0xa0 && tag.tag_type.is_ultralight_family()
        {
            let page = frame.bytes[1];
            if !page_range_ok(tag, page, 1) {
                return Outcome::Respond(TagResponse::Ack4(crate::codec::NACK_IV));
            }
            tag.pending_write_page = Some(page);
            return Outcome::Respond(TagResponse::Ack4(crate::codec::ACK));
        }
        return Outcome::NoMatch;
    };
    if frame.bytes.len() != 18 {
        return Outcome::NoMatch;
    }
    tag.pending_write_page = None;
    if verify_crc(&frame.bytes).is_err() {
        return Outcome::Respond(TagResponse::Ack4(crate::codec::NACK_PA));
    }
    let off = page as usize * tag.block_size;
    tag.memory[off..off + 4].copy_from_slice(&frame.bytes[0..4]);
    Outcome::Respond(TagResponse::Ack4(crate::codec::ACK))
}

fn handle_read_sig(tag: &mut TagEmulator, frame: &Frame, now: u32) -> Outcome {
    if frame.bytes.len() < 2 || frame.bytes[0] != 0x3c || tag.tag_type != TagType::Ntag215 {
        return Outcome::NoMatch;
    }
    let out = vec![0u8; 32];
    Outcome::Respond(tag.respond_with_crc(&out, now))
}

fn handle_read_cnt(tag: &mut TagEmulator, frame: &Frame, now: u32) -> Outcome {
    if frame.bytes.len() < 2 || frame.bytes[0] != 0x39 || tag.tag_type != TagType::Ntag215 {
        return Outcome::NoMatch;
    }
    let i = frame.bytes[1];
    if i > 2 {
        return Outcome::Respond(TagResponse::Ack4(crate::codec::NACK_IV));
    }
    let v = tag.counters[i as usize];
    let out = vec![(v & 0xff) as u8, ((v >> 8) & 0xff) as u8, ((v >> 16) & 0xff) as u8];
    Outcome::Respond(tag.respond_with_crc(&out, now))
}

fn handle_incr(tag: &mut TagEmulator, frame: &Frame, _now: u32) -> Outcome {
    if frame.bytes.len() < 5 || frame.bytes[0] != 0xa5 || tag.tag_type != TagType::Ntag215 {
        return Outcome::NoMatch;
    }
    let i = frame.bytes[1];
    if i > 2 {
        return Outcome::Respond(TagResponse::Ack4(crate::codec::NACK_IV));
    }
    let delta = u32::from(frame.bytes[2])
        | (u32::from(frame.bytes[3]) << 8)
        | (u32::from(frame.bytes[4]) << 16);
    match tag.counters[i as usize].checked_add(delta) {
        Some(v) if v <= 0x00ff_ffff => {
            tag.counters[i as usize] = v;
            Outcome::Respond(TagResponse::Ack4(crate::codec::ACK))
        }
        _ => Outcome::Respond(TagResponse::Ack4(crate::codec::NACK_NA)),
    }
}

fn handle_check_tearing(tag: &mut TagEmulator, frame: &Frame, now: u32) -> Outcome {
    if frame.bytes.len() < 2 || frame.bytes[0] != 0x3e || tag.tag_type != TagType::Ntag215 {
        return Outcome::NoMatch;
    }
    let i = frame.bytes[1];
    if i > 2 {
        return Outcome::Respond(TagResponse::Ack4(crate::codec::NACK_IV));
    }
    Outcome::Respond(tag.respond_with_crc(&[tag.tearing[i as usize]], now))
}

fn handle_pwd_auth(tag: &mut TagEmulator, frame: &Frame, now: u32) -> Outcome {
    if frame.bytes.len() < 5 || frame.bytes[0] != 0x1b || tag.tag_type != TagType::Ntag215 {
        return Outcome::NoMatch;
    }
    if frame.bytes[1..5] == tag.password {
        Outcome::Respond(tag.respond_frame(tag.pack.to_vec(), now))
    } else {
        Outcome::Respond(TagResponse::Ack4(crate::codec::NACK_IV))
    }
}

fn handle_iblock(tag: &mut TagEmulator, frame: &Frame, now: u32) -> Outcome {
    let Some(&pcb) = frame.bytes.first() else {
        return Outcome::NoMatch;
    };
    if pcb & 0xe2 != 0x02 {
        return Outcome::NoMatch;
    }
    if pcb & 0x10 != 0 {
        // Chaining bit set: unsupported by this profile (§7 error table).
        return Outcome::Silent;
    }
    let mut out = Vec::with_capacity(frame.bytes.len() + 2);
    out.push(pcb);
    out.extend_from_slice(&frame.bytes[1..frame.bytes.len().saturating_sub(2)]);
    out.extend_from_slice(&[0x90, 0x00]);
    Outcome::Respond(tag.respond_with_crc(&out, now))
}

fn handle_sblock_deselect(tag: &mut TagEmulator, frame: &Frame, now: u32) -> Outcome {
    let Some(&pcb) = frame.bytes.first() else {
        return Outcome::NoMatch;
    };
    if pcb != 0xc2 && pcb != 0xca {
        return Outcome::NoMatch;
    }
    tag.state = TagState::Halted;
    Outcome::Respond(tag.respond_with_crc(&[pcb], now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_doubles::XorDes;

    #[test]
    fn wupa_answers_with_atqa() {
        let mut tag = TagEmulator::new(TagType::MifareClassic1k, vec![0xde, 0xad, 0xbe, 0xef]);
        let req = Frame::short(0x52, 0, 0);
        let resp = tag.dispatch(&req, 0).unwrap();
        assert_eq!(resp, TagResponse::Frame(Frame::from_bytes(vec![0x04, 0x00], 0, 0)));
    }

    #[test]
    fn reqa_is_silent_after_halt() {
        let mut tag = TagEmulator::new(TagType::MifareClassic1k, vec![0xde, 0xad, 0xbe, 0xef]);
        let halt = framer::frame_with_crc(&[0x50, 0x00], 0, 0);
        assert!(tag.dispatch(&halt, 0).is_none());
        let reqa = Frame::short(0x26, 0, 0);
        assert!(tag.dispatch(&reqa, 0).is_none());
    }

    #[test]
    fn anticol_then_select_returns_uid_then_sak() {
        let mut tag = TagEmulator::new(TagType::MifareClassic1k, vec![0xde, 0xad, 0xbe, 0xef]);
        let anticol = Frame::from_bytes(vec![0x93, 0x20], 0, 0);
        let resp = tag.dispatch(&anticol, 0).unwrap();
        let TagResponse::Frame(uid_frame) = resp else {
            panic!("expected frame");
        };
        let expected_bcc = 0xde ^ 0xad ^ 0xbe ^ 0xef;
        assert_eq!(uid_frame.bytes, vec![0xde, 0xad, 0xbe, 0xef, expected_bcc]);

        let mut select_payload = vec![0x93, 0x70];
        select_payload.extend_from_slice(&uid_frame.bytes);
        let select = framer::frame_with_crc(&select_payload, 0, 0);
        let resp = tag.dispatch(&select, 0).unwrap();
        let TagResponse::Frame(sak_frame) = resp else {
            panic!("expected frame");
        };
        assert_eq!(sak_frame.bytes[0], 0x08);
    }

    #[test]
    fn read_out_of_range_is_nack_invalid_argument() {
        let mut tag = TagEmulator::new(TagType::MifareUltralight, vec![0x04, 0x11, 0x22, 0x33]);
        let read = framer::frame_with_crc(&[0x30, 0x20], 0, 0);
        let resp = tag.dispatch(&read, 0).unwrap();
        assert_eq!(resp, TagResponse::Ack4(crate::codec::NACK_IV));
    }

    #[test]
    fn comp_write_round_trip_commits_first_four_bytes() {
        let mut tag = TagEmulator::new(TagType::MifareUltralight, vec![0x04, 0x11, 0x22, 0x33]);
        let part1 = framer::frame_with_crc(&[0xa0, 0x04], 0, 0);
        assert_eq!(
            tag.dispatch(&part1, 0).unwrap(),
            TagResponse::Ack4(crate::codec::ACK)
        );
        let mut data = vec![0xaa, 0xbb, 0xcc, 0xdd];
        data.extend_from_slice(&[0u8; 12]);
        let part2 = framer::frame_with_crc(&data, 0, 0);
        assert_eq!(
            tag.dispatch(&part2, 0).unwrap(),
            TagResponse::Ack4(crate::codec::ACK)
        );
        let off = 4 * tag.block_size;
        assert_eq!(&tag.memory[off..off + 4], &[0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn classic_auth_then_nr_ar_captures_nonce_and_is_silent() {
        let mut tag = TagEmulator::new(TagType::MifareClassic1k, vec![0xde, 0xad, 0xbe, 0xef]);
        tag.set_capture_nonces(true);
        let auth = Frame::from_bytes(vec![0x60, 0x00], 0, 0);
        let resp = tag.dispatch(&auth, 0).unwrap();
        assert!(matches!(resp, TagResponse::Frame(_)));

        let nr_ar = Frame::from_bytes(vec![1, 2, 3, 4, 5, 6, 7, 8], 0, 0);
        assert!(tag.dispatch(&nr_ar, 0).is_none());
        assert_eq!(tag.nonce_slots.len(), 1);
    }

    #[test]
    fn second_classic_auth_round_emits_moebius_pair() {
        let mut tag = TagEmulator::new(TagType::MifareClassic1k, vec![0xde, 0xad, 0xbe, 0xef]);
        tag.set_capture_nonces(true);
        for _ in 0..2 {
            let auth = Frame::from_bytes(vec![0x60, 0x00], 0, 0);
            tag.dispatch(&auth, 0);
            let nr_ar = Frame::from_bytes(vec![1, 2, 3, 4, 5, 6, 7, 8], 0, 0);
            tag.dispatch(&nr_ar, 0);
        }
        let pairs = tag.take_moebius_pairs();
        assert_eq!(pairs.len(), 1);
        assert!(tag.nonce_slots.is_empty());
    }

    #[test]
    fn ulc_auth_round_trip_succeeds_with_matching_cipher() {
        let mut tag = TagEmulator::new(TagType::MifareUltralightC, vec![0x04, 0x11, 0x22, 0x33]);
        tag.set_cipher(Box::new(XorDes { key: 0x42 }));
        let auth1 = framer::frame_with_crc(&[0x1a, 0x00], 0, 0);
        let resp = tag.dispatch(&auth1, 0).unwrap();
        let TagResponse::Frame(f) = resp else {
            panic!("expected frame")
        };
        assert_eq!(f.bytes[0], 0xaf);

        // Build a correctly-encrypted AUTH_2 payload using the same
        // (known-to-the-test) cipher and IV chain the tag just used.
        let cipher = XorDes { key: 0x42 };
        let rnd_b = tag.pending_rnd_b.unwrap();
        let rnd_a = [9u8, 8, 7, 6, 5, 4, 3, 2];
        let rnd_b_rol = rol8(&rnd_b);
        let block1 = cipher.encrypt_block(&rnd_a, &tag.iv);
        let block2 = cipher.encrypt_block(&rnd_b_rol, &block1);
        let mut payload = vec![0xaf];
        payload.extend_from_slice(&block1);
        payload.extend_from_slice(&block2);
        let auth2 = framer::frame_with_crc(&payload, 0, 0);

        let resp = tag.dispatch(&auth2, 0).unwrap();
        let TagResponse::Frame(f) = resp else {
            panic!("expected frame")
        };
        assert_eq!(f.bytes[0], 0x00);
    }
}
