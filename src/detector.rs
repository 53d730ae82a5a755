use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use std::sync::LazyLock;

use crate::profile::LimitKind;

/// Classification of captured subprocess output
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RateLimitDetection {
    pub is_rate_limited: bool,
    pub kind: Option<LimitKind>,
    pub resets_at: Option<DateTime<Utc>>,
    /// Optional hint surfaced from the output ("try profile X"); the selector
    /// decides, the detector only recommends.
    pub suggested_profile: Option<String>,
}

static LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)usage limit reached|rate.?limit(?:ed|\s+reached|\s+exceeded)?|too many requests|\b429\b|quota exceeded",
    )
    .expect("limit pattern")
});

static WEEKLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)weekly\s+(?:usage\s+)?limit|7.?day|rolling\s+limit").expect("weekly pattern")
});

// "usage limit reached|1735689600" — the CLI appends the reset epoch after a pipe
static EPOCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)limit reached\|(\d{9,13})").expect("epoch pattern"));

static RESETS_AT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)resets?\s+(?:at\s+)?(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2}))",
    )
    .expect("resets-at pattern")
});

static RETRY_AFTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:retry|try again)\s+(?:in|after)\s+(\d+)\s*(?:s\b|sec|seconds)")
        .expect("retry-after pattern")
});

static SUGGESTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:switch to|try)\s+(?:profile|account)\s+['"]?([A-Za-z0-9._-]+)"#)
        .expect("suggestion pattern")
});

/// Classify combined stdout+stderr of an exited subprocess.
///
/// Pure function over text; robust to truncated or garbled streams. Absence of
/// a recognizable pattern means "not rate limited". A reset time is extracted
/// only when the output states one; it is never estimated from thin air.
pub fn classify(combined_output: &str) -> RateLimitDetection {
    let text = strip_ansi(combined_output);

    // Weekly phrasing alone ("weekly limit", "7-day") is limiting even
    // without a generic rate-limit phrase next to it.
    let weekly = WEEKLY_RE.is_match(&text);
    if !weekly && !LIMIT_RE.is_match(&text) {
        return RateLimitDetection::default();
    }

    let kind = if weekly {
        LimitKind::Weekly
    } else {
        LimitKind::Session
    };

    RateLimitDetection {
        is_rate_limited: true,
        kind: Some(kind),
        resets_at: extract_reset(&text),
        suggested_profile: SUGGESTED_RE
            .captures(&text)
            .map(|caps| caps[1].to_string()),
    }
}

fn extract_reset(text: &str) -> Option<DateTime<Utc>> {
    if let Some(caps) = EPOCH_RE.captures(text) {
        if let Some(at) = parse_epoch(&caps[1]) {
            return Some(at);
        }
    }

    if let Some(caps) = RESETS_AT_RE.captures(text) {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&caps[1]) {
            return Some(parsed.with_timezone(&Utc));
        }
    }

    if let Some(caps) = RETRY_AFTER_RE.captures(text) {
        if let Ok(seconds) = caps[1].parse::<i64>() {
            return Some(Utc::now() + chrono::Duration::seconds(seconds));
        }
    }

    extract_reset_from_json(text)
}

/// Structured error bodies sometimes survive in the captured stream; look for
/// the reset fields providers put inside the error object.
fn extract_reset_from_json(text: &str) -> Option<DateTime<Utc>> {
    for line in text.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
            continue;
        };
        let error_obj = value.get("error").unwrap_or(&value);

        for key in ["resets_in_seconds", "reset_in_seconds", "reset_seconds", "retry_after"] {
            if let Some(seconds) = error_obj.get(key).and_then(|v| v.as_f64()) {
                if seconds >= 0.0 {
                    return Some(Utc::now() + chrono::Duration::seconds(seconds as i64));
                }
            }
        }

        for key in ["resets_at", "reset_at"] {
            if let Some(raw) = error_obj.get(key) {
                if let Some(text) = raw.as_str() {
                    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                        return Some(parsed.with_timezone(&Utc));
                    }
                }
                if let Some(epoch) = raw.as_i64() {
                    if let Some(at) = parse_epoch(&epoch.to_string()) {
                        return Some(at);
                    }
                }
            }
        }
    }
    None
}

fn parse_epoch(raw: &str) -> Option<DateTime<Utc>> {
    let mut value = raw.parse::<i64>().ok()?;
    // Millisecond epochs show up in some transcripts
    if value > 1_000_000_000_000 {
        value /= 1000;
    }
    Utc.timestamp_opt(value, 0).single()
}

fn strip_ansi(raw: &str) -> String {
    let mut output = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\u{1b}' {
            if chars.peek() == Some(&'[') {
                let _ = chars.next();
                for next in chars.by_ref() {
                    if next.is_ascii_alphabetic() {
                        break;
                    }
                }
                continue;
            }
        }
        output.push(ch);
    }
    output
}
