//! `hf14a` configuration (§6, §4.7 Supplemental): per-session overrides
//! for anticollision, BCC handling, per-cascade-level behaviour, RATS, and
//! the polling loop (magsafe wake-up variants plus a custom annotation
//! frame), mirroring `hf14a_config_t` / `setHf14aConfig` /
//! `printHf14aConfig` from the reference reader firmware.

use crate::types::{PollingFrame, PollingProfile};
use serde::{Deserialize, Serialize};

/// Anti-collision override: follow the standard, always run it, or always
/// skip it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnticolOverride {
    #[default]
    Std,
    Force,
    Skip,
}

/// BCC mismatch policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BccOverride {
    #[default]
    Std,
    Fix,
    Accept,
}

/// Per-cascade-level override (CL2/CL3): follow SAK's cascade bit, always
/// continue, or always stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeOverride {
    #[default]
    Std,
    Force,
    Skip,
}

/// RATS override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatsOverride {
    #[default]
    Std,
    Force,
    Skip,
}

macro_rules! override_codes {
    ($ty:ty, $std:expr, $a:expr, $b:expr) => {
        impl $ty {
            /// Decodes the `0`/`1`/`2` wire representation used by
            /// `hf14a_config_t`, `None` for anything out of range (the
            /// Rust stand-in for "`-1` means no change").
            pub fn from_code(code: u8) -> Option<Self> {
                match code {
                    0 => Some($std),
                    1 => Some($a),
                    2 => Some($b),
                    _ => None,
                }
            }
        }
    };
}

override_codes!(AnticolOverride, AnticolOverride::Std, AnticolOverride::Force, AnticolOverride::Skip);
override_codes!(BccOverride, BccOverride::Std, BccOverride::Fix, BccOverride::Accept);
override_codes!(CascadeOverride, CascadeOverride::Std, CascadeOverride::Force, CascadeOverride::Skip);
override_codes!(RatsOverride, RatsOverride::Std, RatsOverride::Force, RatsOverride::Skip);

/// Maximum number of polling frames `build_polling_profile` will place in
/// the rebuilt profile (WUPA + magsafe variants + the custom annotation).
/// The original firmware's `hf14a_polling_parameters.frames` array has one
/// more slot than this: `frame_count < ARRAYLEN(frames) - 1` is preserved
/// here as `< MAX_POLLING_FRAMES - 1`, which leaves the last of
/// `MAX_POLLING_FRAMES` slots permanently unused. Flagged in DESIGN.md as
/// a likely off-by-one in the source; kept rather than silently fixed,
/// since it isn't called out as a REDESIGN FLAG.
pub const MAX_POLLING_FRAMES: usize = 6;

/// The four alternate WUPA-style wake-up frames magsafe mode appends,
/// targeting readers that otherwise ignore cards under certain magnetic
/// wallet/case shielding.
fn magsafe_frames() -> [PollingFrame; 4] {
    [
        PollingFrame {
            frame: vec![0x52],
            last_byte_bits: 7,
            post_delay_ms: 0,
        },
        PollingFrame {
            frame: vec![0x26],
            last_byte_bits: 7,
            post_delay_ms: 1,
        },
        PollingFrame {
            frame: vec![0x52],
            last_byte_bits: 7,
            post_delay_ms: 2,
        },
        PollingFrame {
            frame: vec![0x26],
            last_byte_bits: 7,
            post_delay_ms: 5,
        },
    ]
}

/// Session-scoped 14a configuration: the engine's equivalent of the
/// reference firmware's static `hf14aconfig` plus the polling-loop
/// parameters it derives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hf14aConfig {
    pub forceanticol: AnticolOverride,
    pub forcebcc: BccOverride,
    pub forcecl2: CascadeOverride,
    pub forcecl3: CascadeOverride,
    pub forcerats: RatsOverride,
    pub magsafe: bool,
    pub polling_loop_annotation: Option<PollingFrame>,
}

/// A partial configuration update: each field is `None` to mean "no
/// change", matching `setHf14aConfig`'s `-1`-means-unchanged convention
/// without overloading signed integers for it.
#[derive(Debug, Clone, Default)]
pub struct Hf14aConfigUpdate {
    pub forceanticol: Option<u8>,
    pub forcebcc: Option<u8>,
    pub forcecl2: Option<u8>,
    pub forcecl3: Option<u8>,
    pub forcerats: Option<u8>,
    pub magsafe: Option<bool>,
    pub polling_loop_annotation: Option<PollingFrame>,
}

impl Hf14aConfig {
    /// A fresh configuration, every field at its "std" / disabled default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a partial update in, field by field, exactly as
    /// `setHf14aConfig` does: a field only changes if its incoming value
    /// decodes to a valid override.
    pub fn merge(&mut self, update: &Hf14aConfigUpdate) {
        if let Some(v) = update.forceanticol.and_then(AnticolOverride::from_code) {
            self.forceanticol = v;
        }
        if let Some(v) = update.forcebcc.and_then(BccOverride::from_code) {
            self.forcebcc = v;
        }
        if let Some(v) = update.forcecl2.and_then(CascadeOverride::from_code) {
            self.forcecl2 = v;
        }
        if let Some(v) = update.forcecl3.and_then(CascadeOverride::from_code) {
            self.forcecl3 = v;
        }
        if let Some(v) = update.forcerats.and_then(RatsOverride::from_code) {
            self.forcerats = v;
        }
        if let Some(v) = update.magsafe {
            self.magsafe = v;
        }
        if update.polling_loop_annotation.is_some() {
            self.polling_loop_annotation = update.polling_loop_annotation.clone();
        }
    }

    /// Rebuilds the polling profile from scratch: WUPA first, then
    /// magsafe variants if enabled, then the custom annotation frame if
    /// set, bounded by `MAX_POLLING_FRAMES` with the off-by-one preserved
    /// from the source (see `MAX_POLLING_FRAMES`'s doc comment). Setting
    /// the annotation also bumps the profile's extra timeout to 250ms, as
    /// the source does to give the custom frame room to be answered.
    pub fn build_polling_profile(&self) -> PollingProfile {
        let mut frames = vec![PollingFrame {
            frame: vec![0x52],
            last_byte_bits: 7,
            post_delay_ms: 0,
        }];
        let mut extra_timeout_ms = 0;

        if self.magsafe {
            for frame in magsafe_frames() {
                if frames.len() < MAX_POLLING_FRAMES - 1 {
                    frames.push(frame);
                }
            }
        }

        if let Some(annotation) = &self.polling_loop_annotation {
            if frames.len() < MAX_POLLING_FRAMES - 1 {
                frames.push(annotation.clone());
            }
            extra_timeout_ms = 250;
        }

        PollingProfile {
            frames,
            extra_timeout_ms,
        }
    }

    /// Six-line human-readable summary, matching `printHf14aConfig`'s
    /// per-field std/force/skip wording (without the firmware's ANSI
    /// colour codes).
    pub fn describe(&self) -> String {
        let anticol = match self.forceanticol {
            AnticolOverride::Std => "std    ( follow standard )",
            AnticolOverride::Force => "force  ( always do anticol )",
            AnticolOverride::Skip => "skip   ( always skip anticol )",
        };
        let bcc = match self.forcebcc {
            BccOverride::Std => "std    ( follow standard )",
            BccOverride::Fix => "fix    ( fix bad BCC )",
            BccOverride::Accept => "ignore ( ignore bad BCC, always use card BCC )",
        };
        let cl2 = match self.forcecl2 {
            CascadeOverride::Std => "std    ( follow standard )",
            CascadeOverride::Force => "force  ( always do CL2 )",
            CascadeOverride::Skip => "skip   ( always skip CL2 )",
        };
        let cl3 = match self.forcecl3 {
            CascadeOverride::Std => "std    ( follow standard )",
            CascadeOverride::Force => "force  ( always do CL3 )",
            CascadeOverride::Skip => "skip   ( always skip CL3 )",
        };
        let rats = match self.forcerats {
            RatsOverride::Std => "std    ( follow standard )",
            RatsOverride::Force => "force  ( always do RATS )",
            RatsOverride::Skip => "skip   ( always skip RATS )",
        };
        let magsafe = if self.magsafe { "enabled" } else { "disabled" };
        let annotation = if self.polling_loop_annotation.is_some() {
            "enabled"
        } else {
            "disabled"
        };
        format!(
            "HF 14a config\n  [a] Anticol override........... {anticol}\n  [b] BCC override............... {bcc}\n  [2] CL2 override............... {cl2}\n  [3] CL3 override............... {cl3}\n  [r] RATS override.............. {rats}\n  [m] Magsafe polling............ {magsafe}\n  [p] Polling loop annotation.... {annotation}"
        )
    }
}

/// Timeouts, nonce-capture, and trigger-mode knobs the classifier-style
/// `ClassifierOptions::{new, fast, thorough}` pattern maps onto for this
/// engine: how aggressively to poll, whether to collect darkside
/// nonces, and which sniffer trigger to arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Start recording on the first tag answer.
    FirstTagAnswer,
    /// Start recording on the first 7-bit reader frame.
    FirstReaderFrame,
    /// Start recording immediately.
    Immediate,
}

/// Top-level engine options, analogous to the teacher's `ClassifierOptions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Receive timeout for a single frame, in ms (pre-bias; see `timing::TimingController::set_timeout`).
    pub receive_timeout_ms: u32,
    /// Extra timeout added on top of the polling profile's own, in ms.
    pub extra_poll_timeout_ms: u32,
    /// Maximum anti-collision bit-walk rounds per cascade level before giving up.
    pub max_collision_rounds: usize,
    /// Whether the tag emulator should capture NR/AR pairs for darkside analysis.
    pub capture_nonces: bool,
    /// Sniffer trigger mode.
    pub trigger: TriggerMode,
}

impl EngineOptions {
    /// Balanced defaults.
    pub fn new() -> Self {
        EngineOptions {
            receive_timeout_ms: 1000,
            extra_poll_timeout_ms: 0,
            max_collision_rounds: 32,
            capture_nonces: false,
            trigger: TriggerMode::FirstTagAnswer,
        }
    }

    /// Short timeouts, no nonce capture: quick single-card reads.
    pub fn fast() -> Self {
        EngineOptions {
            receive_timeout_ms: 200,
            extra_poll_timeout_ms: 0,
            max_collision_rounds: 8,
            capture_nonces: false,
            trigger: TriggerMode::Immediate,
        }
    }

    /// Long timeouts, nonce capture on: multi-card / attack scenarios.
    pub fn thorough() -> Self {
        EngineOptions {
            receive_timeout_ms: 5000,
            extra_poll_timeout_ms: 250,
            max_collision_rounds: 64,
            capture_nonces: true,
            trigger: TriggerMode::FirstReaderFrame,
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_ignores_out_of_range_codes() {
        let mut cfg = Hf14aConfig::new();
        let update = Hf14aConfigUpdate {
            forceanticol: Some(9),
            ..Default::default()
        };
        cfg.merge(&update);
        assert_eq!(cfg.forceanticol, AnticolOverride::Std);
    }

    #[test]
    fn merge_applies_valid_codes() {
        let mut cfg = Hf14aConfig::new();
        let update = Hf14aConfigUpdate {
            forcebcc: Some(1),
            ..Default::default()
        };
        cfg.merge(&update);
        assert_eq!(cfg.forcebcc, BccOverride::Fix);
    }

    #[test]
    fn default_polling_profile_is_just_wupa() {
        let cfg = Hf14aConfig::new();
        let profile = cfg.build_polling_profile();
        assert_eq!(profile.frames.len(), 1);
        assert_eq!(profile.extra_timeout_ms, 0);
    }

    #[test]
    fn magsafe_appends_frames_but_respects_capacity() {
        let mut cfg = Hf14aConfig::new();
        cfg.magsafe = true;
        let profile = cfg.build_polling_profile();
        // WUPA + up to (MAX_POLLING_FRAMES - 1 - 1) magsafe frames fit
        // before the off-by-one guard stops admitting more.
        assert!(profile.frames.len() <= MAX_POLLING_FRAMES - 1);
        assert!(profile.frames.len() > 1);
    }

    #[test]
    fn annotation_bumps_extra_timeout() {
        let mut cfg = Hf14aConfig::new();
        cfg.polling_loop_annotation = Some(PollingFrame {
            frame: vec![0x50, 0x00],
            last_byte_bits: 8,
            post_delay_ms: 0,
        });
        let profile = cfg.build_polling_profile();
        assert_eq!(profile.extra_timeout_ms, 250);
    }

    #[test]
    fn describe_mentions_all_seven_fields() {
        let cfg = Hf14aConfig::new();
        let text = cfg.describe();
        for marker in ["Anticol", "BCC", "CL2", "CL3", "RATS", "Magsafe", "Polling loop"] {
            assert!(text.contains(marker), "missing {marker}");
        }
    }

    #[test]
    fn options_presets_differ() {
        assert!(EngineOptions::fast().receive_timeout_ms < EngineOptions::new().receive_timeout_ms);
        assert!(EngineOptions::thorough().receive_timeout_ms > EngineOptions::new().receive_timeout_ms);
        assert!(EngineOptions::thorough().capture_nonces);
    }
}
