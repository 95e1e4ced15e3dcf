//! nfc14a-engine — a full-duplex ISO/IEC 14443-A air-interface engine.
//!
//! This crate implements the hard, bit-exact part of an ISO 14443-A
//! reader/tag simulation stack: the Miller and Manchester line codecs
//! (`codec`), byte+parity+CRC framing (`framer`), sub-carrier-cycle
//! timing alignment (`timing`), the reader-side anti-collision/selection
//! state machine (`selection`), a Mifare Classic/Ultralight-family/
//! ISO 14443-4 tag emulator (`emulator`), a concurrent sniffer
//! (`sniffer`), and the Mifare Classic darkside/NACK-bug nonce-collection
//! harness (`attack`).
//!
//! # Quick start
//!
//! ```
//! use nfc14a_engine::context::EngineContext;
//! use nfc14a_engine::emulator::TagEmulator;
//! use nfc14a_engine::rf::SimulatedFrontend;
//! use nfc14a_engine::selection::{select_card, CollidingTags};
//! use nfc14a_engine::types::TagType;
//!
//! let mut tag = TagEmulator::new(TagType::MifareClassic1k, vec![0xde, 0xad, 0xbe, 0xef]);
//! let mut ctx = EngineContext::new();
//! let rf = SimulatedFrontend::new();
//! let mut tags = CollidingTags::single(&mut tag);
//!
//! let result = select_card(&mut ctx, &rf, &mut tags).unwrap();
//! let card = result.card.unwrap();
//! assert_eq!(card.uid, vec![0xde, 0xad, 0xbe, 0xef]);
//! assert_eq!(card.sak, 0x08);
//! ```
//!
//! # Out of scope
//!
//! The RF front-end / sampler, trace/log storage, host transport
//! framing, button/LED glue, Mifare-Classic key recovery strategy
//! selection, and persistent emulator memory layout are all external
//! collaborators this crate consumes through narrow interfaces
//! (`rf::RfFrontend`, `crypto::Crypto1Cipher`, `crypto::TripleDes`) but
//! never implements.

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod attack;
pub mod codec;
pub mod config;
pub mod context;
pub mod crypto;
pub mod emulator;
pub mod error;
pub mod formatter;
pub mod framer;
pub mod link;
pub mod prng;
pub mod rf;
pub mod selection;
pub mod sniffer;
pub mod timing;
pub mod types;

pub use context::EngineContext;
pub use error::{Error, ErrorKind, Result};
pub use types::{CardDescriptor, Frame, SelectResult, TagType};
