//! Formatting helpers for terminal output.

use chrono::{DateTime, Utc};
use std::path::Path;

/// Format a timestamp as relative time (e.g., "2m ago").
pub fn format_relative_time(ts: DateTime<Utc>) -> String {
    let now = Utc::now();
    let duration = now.signed_duration_since(ts);

    if duration.num_seconds() < 0 {
        "just now".to_string()
    } else if duration.num_seconds() < 60 {
        format!("{}s ago", duration.num_seconds())
    } else if duration.num_minutes() < 60 {
        format!("{}m ago", duration.num_minutes())
    } else if duration.num_hours() < 24 {
        format!("{}h ago", duration.num_hours())
    } else if duration.num_days() < 7 {
        format!("{}d ago", duration.num_days())
    } else {
        ts.format("%b %d").to_string()
    }
}

/// Format an optional timestamp as relative time, or "-" if missing.
pub fn format_relative_time_opt(ts: Option<DateTime<Utc>>) -> String {
    match ts {
        Some(ts) => format_relative_time(ts),
        None => "-".to_string(),
    }
}

/// Compact token count: 950, 12.3k, 4.1M
pub fn format_tokens(tokens: i64) -> String {
    let t = tokens as f64;
    if tokens >= 1_000_000 {
        format!("{:.1}M", t / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}k", t / 1_000.0)
    } else {
        tokens.to_string()
    }
}

pub fn format_cost(cost: f64) -> String {
    if cost > 0.0 && cost < 0.01 {
        "<$0.01".to_string()
    } else {
        format!("${:.2}", cost)
    }
}

/// Seconds as "1h 05m", "3m 20s" or "12s"
pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    if seconds >= 3600 {
        format!("{}h {:02}m", seconds / 3600, (seconds % 3600) / 60)
    } else if seconds >= 60 {
        format!("{}m {:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

/// Shorten a path for display by abbreviating the home directory
pub fn shorten_path(path: &str) -> String {
    if let Ok(home) = std::env::var("HOME") {
        if let Ok(suffix) = Path::new(path).strip_prefix(&home) {
            return format!("~/{}", suffix.display());
        }
    }
    path.to_string()
}

/// Truncate to `max` characters, marking the cut with "..."
pub fn truncate(text: &str, max: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max {
        return single_line;
    }
    let kept: String = single_line.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

/// First 8 characters of an id
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
