//! Aider chat-history decoder
//!
//! Aider appends a markdown transcript to `.aider.chat.history.md` in the
//! project root. User prompts are `#### ` headings; tool output lines are
//! quoted with `> ` and include usage reports such as
//!
//! ```text
//! > Model: claude-3-5-sonnet-20241022 with diff edit format
//! > Tokens: 2.3k sent, 1.1k cache write, 123 received. Cost: $0.01 message, $0.02 session.
//! ```

use crate::ingest::{Decoder, Delta, DeltaKind};
use once_cell::sync::Lazy;
use regex::Regex;

static RE_TOKENS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)Tokens:\s*([\d.,]+[km]?)\s*(?:sent|input)\b.*?([\d.,]+[km]?)\s*(?:received|output)\b",
    )
    .unwrap()
});
static RE_COST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Cost:\s*\$?([\d.]+)(?:\s*message)?(?:,\s*\$?([\d.]+)\s*session)?").unwrap()
});
static RE_MODEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:Main model|Model):\s*(\S+)").unwrap());

/// Decoder for `.aider.chat.history.md`
#[derive(Debug, Default)]
pub struct AiderDecoder;

impl AiderDecoder {
    pub fn new() -> Self {
        Self
    }

    fn decode_line(&self, line: &str, out: &mut Vec<Delta>) {
        if let Some(prompt) = line.strip_prefix("#### ") {
            let text = prompt.trim();
            if !text.is_empty() {
                out.push(Delta::new(DeltaKind::Prompt {
                    text: text.to_string(),
                }));
            }
            return;
        }

        let body = line.trim_start_matches('>').trim();

        if let Some(caps) = RE_MODEL.captures(body) {
            out.push(Delta::new(DeltaKind::Model {
                model: caps[1].to_string(),
            }));
        }

        if let Some(caps) = RE_TOKENS.captures(body) {
            if let (Some(input), Some(output)) = (parse_count(&caps[1]), parse_count(&caps[2])) {
                out.push(Delta::new(DeltaKind::Tokens { input, output }));
            }
        }

        if let Some(caps) = RE_COST.captures(body) {
            if let Ok(amount) = caps[1].parse::<f64>() {
                let session_total = caps.get(2).and_then(|m| m.as_str().parse::<f64>().ok());
                out.push(Delta::new(DeltaKind::Cost {
                    amount,
                    session_total,
                }));
            }
        }
    }
}

impl Decoder for AiderDecoder {
    fn decode(&mut self, lines: &[String]) -> Vec<Delta> {
        let mut out = Vec::new();
        for line in lines {
            self.decode_line(line, &mut out);
        }
        out
    }
}

/// Parse counts like `1,234`, `2.3k` or `1.2m`
fn parse_count(raw: &str) -> Option<i64> {
    let cleaned = raw.replace(',', "").to_lowercase();
    let (number, multiplier) = if let Some(n) = cleaned.strip_suffix('k') {
        (n, 1_000.0)
    } else if let Some(n) = cleaned.strip_suffix('m') {
        (n, 1_000_000.0)
    } else {
        (cleaned.as_str(), 1.0)
    };
    let value: f64 = number.parse().ok()?;
    Some((value * multiplier).round() as i64)
}
