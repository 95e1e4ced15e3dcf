//! Error types for the ISO 14443-A engine.
//!
//! This module defines all error types used throughout the engine,
//! mapping directly onto the propagation policy table of the error
//! handling design: most protocol-level hiccups are recovered locally
//! (a decoder reset, a NACK, a dropped frame) and never reach here —
//! these variants are for the cases that design marks as "surfaced".

use thiserror::Error;

/// Primary error type for the ISO 14443-A engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The circular sample buffer filled past its overrun threshold.
    #[error("sniffer sample buffer overrun at {fill_percent}% fill")]
    BufferOverrun { fill_percent: u8 },

    /// No ATQA was received before the polling timeout expired.
    #[error("no ATQA received after polling ({attempts} frame(s) sent)")]
    NoAtqa { attempts: usize },

    /// No SAK was received after a SELECT.
    #[error("no SAK received after SELECT at cascade level {level}")]
    NoSak { level: u8 },

    /// The anti-collision bit walk failed to converge on a unique UID.
    #[error("anti-collision walk failed to converge after {rounds} round(s)")]
    CollisionWalkFailed { rounds: usize },

    /// BCC did not match the received UID bytes, and policy said to abort.
    #[error("BCC mismatch: expected {expected:#04x}, got {actual:#04x}")]
    BccMismatch { expected: u8, actual: u8 },

    /// CRC-16 residual was not the canonical 0x6363 over the received frame.
    #[error("CRC-16 mismatch over frame of {len} byte(s)")]
    CrcMismatch { len: usize },

    /// A decoder detected an illegal sequence and had to reset mid-frame.
    #[error("{direction} decoder framing violation in state {state}")]
    FramingViolation {
        direction: &'static str,
        state: &'static str,
    },

    /// An argument to a tag-emulation command was out of range.
    #[error("invalid argument to {command} command: {detail}")]
    InvalidArgument {
        command: &'static str,
        detail: String,
    },

    /// An NTAG/Ultralight counter would have overflowed.
    #[error("counter overflow on INCR to counter {counter}")]
    CounterOverflow { counter: u8 },

    /// The user (or host) cancelled an in-flight operation.
    #[error("operation aborted by user")]
    UserAbort,

    /// The PRNG resynchronisation in the darkside harness could not lock on.
    #[error("darkside PRNG resync gave up after {attempts} attempt(s)")]
    UnstablePrng { attempts: usize },

    /// A chained I-block arrived for a tag profile that can't reassemble it.
    #[error("chained I-block unsupported for tag profile {profile}")]
    UnsupportedChaining { profile: &'static str },

    /// A WTX extension budget (WTXM x base FWT) was exhausted.
    #[error("WTX budget exhausted after {extensions} extension(s)")]
    WtxExhausted { extensions: u8 },
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse category of an `Error`, matching the rows of the error-handling
/// design's propagation table. Lets callers branch on failure kind without
/// matching against `Display` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Circular sample buffer overrun — fatal, abort session.
    BufferOverrun,
    /// No ATQA after polling timeout.
    NoAtqa,
    /// No SAK after SELECT.
    NoSak,
    /// Anti-collision bit walk failed to converge.
    CollisionWalkFailed,
    /// BCC mismatch, surfaced only when policy says to abort.
    BccMismatch,
    /// CRC-16 mismatch.
    CrcMismatch,
    /// Decoder framing violation.
    FramingViolation,
    /// Invalid argument to a UL/NTAG operation.
    InvalidArgument,
    /// NTAG/Ultralight counter overflow.
    CounterOverflow,
    /// User or host cancelled an in-flight operation.
    UserAbort,
    /// Darkside PRNG resynchronisation gave up.
    UnstablePrng,
    /// Chained I-block to an unsupported tag profile.
    UnsupportedChaining,
    /// WTX extension budget exhausted.
    WtxExhausted,
}

impl Error {
    /// The coarse category this error belongs to, per the error-handling
    /// design's propagation table.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BufferOverrun { .. } => ErrorKind::BufferOverrun,
            Error::NoAtqa { .. } => ErrorKind::NoAtqa,
            Error::NoSak { .. } => ErrorKind::NoSak,
            Error::CollisionWalkFailed { .. } => ErrorKind::CollisionWalkFailed,
            Error::BccMismatch { .. } => ErrorKind::BccMismatch,
            Error::CrcMismatch { .. } => ErrorKind::CrcMismatch,
            Error::FramingViolation { .. } => ErrorKind::FramingViolation,
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Error::CounterOverflow { .. } => ErrorKind::CounterOverflow,
            Error::UserAbort => ErrorKind::UserAbort,
            Error::UnstablePrng { .. } => ErrorKind::UnstablePrng,
            Error::UnsupportedChaining { .. } => ErrorKind::UnsupportedChaining,
            Error::WtxExhausted { .. } => ErrorKind::WtxExhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_fields() {
        let err = Error::BccMismatch {
            expected: 0x4b,
            actual: 0x00,
        };
        let msg = err.to_string();
        assert!(msg.contains("4b"));
        assert!(msg.contains("00"));
    }

    #[test]
    fn no_atqa_reports_attempts() {
        let err = Error::NoAtqa { attempts: 3 };
        assert!(err.to_string().contains('3'));
    }

    #[test]
    fn kind_matches_variant_without_string_matching() {
        let err = Error::NoSak { level: 2 };
        assert_eq!(err.kind(), ErrorKind::NoSak);
    }
}
