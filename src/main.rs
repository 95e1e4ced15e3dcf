//! nfc14a-engine CLI
//!
//! Drives a simulated ISO 14443-A session end to end (poll → select →
//! optionally RATS, or the darkside nonce-collection harness) against an
//! in-memory tag and prints a human/JSON/short report. There is no real
//! RF front end here — the engine's out-of-scope RF sampler (§1) is
//! always the in-memory `SimulatedFrontend`; this binary is a test
//! harness and demo surface, not a hardware driver.

use clap::{Parser, ValueEnum};
use nfc14a_engine::attack::{run_darkside, DarksideStatus, NackBugOracle, ACCIDENTAL_AUTH};
use nfc14a_engine::config::EngineOptions;
use nfc14a_engine::context::{Cancel, EngineContext};
use nfc14a_engine::emulator::TagEmulator;
use nfc14a_engine::formatter::{HumanFormatter, JsonFormatter, ResultFormatter, ShortFormatter};
use nfc14a_engine::prng::prng_successor;
use nfc14a_engine::rf::SimulatedFrontend;
use nfc14a_engine::selection::{select_card, CollidingTags};
use nfc14a_engine::types::TagType;
use std::process::ExitCode;

/// Simulated ISO 14443-A session driver.
#[derive(Parser, Debug)]
#[command(name = "nfc14a-engine")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tag profile to emulate.
    #[arg(short, long, default_value = "mifare-classic1k")]
    tag: TagProfile,

    /// UID, as hex (4, 7 or 10 bytes). Defaults to a fixed demo UID.
    #[arg(short, long, default_value = "DEADBEEF")]
    uid: String,

    /// Output format.
    #[arg(short, long, default_value = "human")]
    format: OutputFormat,

    /// Timing/retry preset.
    #[arg(short, long, default_value = "normal")]
    mode: Mode,

    /// Run the darkside nonce-collection harness against a scripted
    /// vulnerable tag instead of a plain selection.
    #[arg(long)]
    darkside: bool,

    /// Append the magsafe wake-up polling frames.
    #[arg(long)]
    magsafe: bool,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Short,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Fast,
    Normal,
    Thorough,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TagProfile {
    MifareClassic1k,
    MifareClassic4k,
    MifareUltralight,
    Ntag215,
    Desfire,
}

impl From<TagProfile> for TagType {
    fn from(p: TagProfile) -> Self {
        match p {
            TagProfile::MifareClassic1k => TagType::MifareClassic1k,
            TagProfile::MifareClassic4k => TagType::MifareClassic4k,
            TagProfile::MifareUltralight => TagType::MifareUltralight,
            TagProfile::Ntag215 => TagType::Ntag215,
            TagProfile::Desfire => TagType::Desfire,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("nfc14a_engine=debug")
            .init();
    }

    let uid = match hex::decode(&args.uid) {
        Ok(bytes) if matches!(bytes.len(), 4 | 7 | 10) => bytes,
        Ok(bytes) => {
            eprintln!(
                "UID must be 4, 7 or 10 bytes, got {} byte(s)",
                bytes.len()
            );
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("invalid UID hex: {e}");
            return ExitCode::FAILURE;
        }
    };

    if args.darkside {
        run_darkside_demo(&args);
        return ExitCode::SUCCESS;
    }

    let options = match args.mode {
        Mode::Fast => EngineOptions::fast(),
        Mode::Normal => EngineOptions::new(),
        Mode::Thorough => EngineOptions::thorough(),
    };

    let mut ctx = EngineContext::new();
    ctx.options = options;
    if args.magsafe {
        ctx.set_config(&nfc14a_engine::config::Hf14aConfigUpdate {
            magsafe: Some(true),
            ..Default::default()
        });
    }

    let rf = SimulatedFrontend::new();
    let mut tag = TagEmulator::new(args.tag.into(), uid);
    let mut tags = CollidingTags::single(&mut tag);

    match select_card(&mut ctx, &rf, &mut tags) {
        Ok(result) => {
            print_result(&result, args.format);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("selection failed: {e} ({:?})", e.kind());
            ExitCode::FAILURE
        }
    }
}

fn print_result(result: &nfc14a_engine::types::SelectResult, format: OutputFormat) {
    let text = match format {
        OutputFormat::Human => HumanFormatter::default().format_result(result),
        OutputFormat::Json => JsonFormatter.format_result(result),
        OutputFormat::Short => ShortFormatter.format_result(result),
    };
    print!("{text}");
}

/// A scripted tag vulnerable to the parity-leak NACK bug, used only to
/// demonstrate the darkside harness end to end without real hardware.
struct ScriptedVulnerableTag {
    nt0: u32,
}

impl NackBugOracle for ScriptedVulnerableTag {
    fn nonce_at(&self, sync_time: u32) -> u32 {
        let periods = sync_time / nfc14a_engine::attack::SYNC_CYCLES_INITIAL;
        prng_successor(self.nt0, periods * (1 << 16))
    }

    fn probe(&mut self, _nt: u32, nr: u32, _ar: u32) -> Option<u8> {
        let slot = (nr >> 29) as u8 & 0x07;
        if slot == 7 {
            return Some(ACCIDENTAL_AUTH);
        }
        Some(slot ^ 0x05)
    }
}

fn run_darkside_demo(args: &Args) {
    let _ = args;
    let mut tag = ScriptedVulnerableTag { nt0: 0xdead_beef };
    let cancel = Cancel::new();
    let result = run_darkside(&mut tag, &cancel);
    println!("darkside status: {:?} (isOK={})", result.status, result.status as u8);
    println!("nt_attacked:     {:#010x}", result.nt_attacked);
    println!("iterations:      {}", result.iterations);
    if result.status as u8 == DarksideStatus::Success as u8 {
        for (i, (par, ks)) in result.par_list.iter().zip(result.ks_list.iter()).enumerate() {
            println!("  slot {i}: par={par:?} ks={ks:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_args() {
        let args = Args::try_parse_from(["nfc14a-engine"]).unwrap();
        assert_eq!(args.uid, "DEADBEEF");
        assert!(!args.darkside);
    }

    #[test]
    fn parses_format_flag() {
        let args = Args::try_parse_from(["nfc14a-engine", "-f", "json"]).unwrap();
        assert!(matches!(args.format, OutputFormat::Json));
    }

    #[test]
    fn parses_darkside_flag() {
        let args = Args::try_parse_from(["nfc14a-engine", "--darkside"]).unwrap();
        assert!(args.darkside);
    }
}
