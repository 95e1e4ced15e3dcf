//! Symbol codec layer (C1): nibble-level lookup tables, the Miller
//! (reader->tag) and Manchester (tag->reader) line decoders, and the
//! matching encoders.

pub mod bridge;
mod encode;
mod lut;
mod manchester;
mod miller;

pub use bridge::{expand_manchester, expand_miller, merge_tag_nibbles};
pub use encode::{
    encode_4bit_ack, manchester_encode, miller_duration, miller_encode, ACK, NACK_IV, NACK_NA,
    NACK_PA,
};
pub use lut::{SEC_COLL, SEC_D, SEC_E, SEC_F, SEC_X, SEC_Y, SEC_Z};
pub use manchester::{ManchesterDecoder, ManchesterSignal};
pub use miller::{MillerDecoder, MillerSignal};
