//! Output formatters for a completed selection (CLI-only; `cli` feature).
//!
//! Mirrors the teacher's `PayloadFormatter` trait: one method per report
//! section, a default `format_result` that concatenates them, and three
//! implementations (human, JSON, short) the CLI picks between on `--format`.

use crate::types::SelectResult;

/// Trait for formatting a completed selection result.
pub trait ResultFormatter {
    /// Formats the card summary (UID, ATQA, SAK, ATS).
    fn format_card(&self, result: &SelectResult) -> String;

    /// Formats the full report for `result`.
    fn format_result(&self, result: &SelectResult) -> String {
        self.format_card(result)
    }
}

/// Human-readable report.
#[derive(Debug, Clone, Default)]
pub struct HumanFormatter {
    /// Include the full ATS byte dump even when empty.
    pub verbose: bool,
}

impl ResultFormatter for HumanFormatter {
    fn format_card(&self, result: &SelectResult) -> String {
        let Some(card) = &result.card else {
            return "no card selected\n".to_string();
        };
        let mut out = String::new();
        out.push_str(&format!("UID:    {}\n", hex::encode_upper(&card.uid)));
        out.push_str(&format!(
            "ATQA:   {}\n",
            hex::encode_upper(card.atqa)
        ));
        out.push_str(&format!("SAK:    {:02X}\n", card.sak));
        out.push_str(&format!("Cascade levels: {}\n", result.cascade_levels));
        if result.rats_performed || self.verbose {
            out.push_str(&format!("ATS:    {}\n", hex::encode_upper(&card.ats)));
        }
        out
    }
}

/// JSON report (the `SelectResult` serialised directly).
#[derive(Debug, Clone, Default)]
pub struct JsonFormatter;

impl ResultFormatter for JsonFormatter {
    fn format_card(&self, result: &SelectResult) -> String {
        serde_json::to_string_pretty(result).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

/// Compact single-line report.
#[derive(Debug, Clone, Default)]
pub struct ShortFormatter;

impl ResultFormatter for ShortFormatter {
    fn format_card(&self, result: &SelectResult) -> String {
        match &result.card {
            Some(card) => format!(
                "{}\t{}\t{:02X}\t{}\n",
                hex::encode_upper(&card.uid),
                hex::encode_upper(card.atqa),
                card.sak,
                result.cascade_levels
            ),
            None => "-\t-\t-\t0\n".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CardDescriptor;

    fn sample_result() -> SelectResult {
        SelectResult {
            card: Some(CardDescriptor {
                atqa: [0x04, 0x00],
                uid: vec![0xde, 0xad, 0xbe, 0xef],
                sak: 0x08,
                ats: vec![],
            }),
            cascade_levels: 1,
            rats_performed: false,
        }
    }

    #[test]
    fn human_formatter_includes_uid_and_sak() {
        let text = HumanFormatter::default().format_result(&sample_result());
        assert!(text.contains("DEADBEEF"));
        assert!(text.contains("08"));
    }

    #[test]
    fn json_formatter_round_trips_through_serde() {
        let text = JsonFormatter.format_result(&sample_result());
        let back: SelectResult = serde_json::from_str(&text).unwrap();
        assert_eq!(back.card.unwrap().uid, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn short_formatter_is_one_line() {
        let text = ShortFormatter.format_result(&sample_result());
        assert_eq!(text.matches('\n').count(), 1);
    }

    #[test]
    fn no_card_reports_gracefully_in_every_format() {
        let empty = SelectResult::default();
        assert!(HumanFormatter::default().format_result(&empty).contains("no card"));
        assert!(ShortFormatter.format_result(&empty).starts_with('-'));
    }
}
