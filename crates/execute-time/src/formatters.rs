//! Human-readable durations and timestamps.
//!
//! Durations follow the classic notebook "ExecuteTime" layout (`17ms`,
//! `1.02s`, `2m 1.82s`, `2h 0m 2s`, `1d 2h 18m`). Timestamps are rendered with
//! a small date-fns compatible pattern language:
//!
//! - runs of the same ASCII letter form a token (`yyyy`, `MM`, `HH`, ...)
//! - `'...'` quotes literal text, `''` is a literal single quote
//! - every other character is copied verbatim
//!
//! Patterns are compiled once into a [`DatePattern`] so the renderer never
//! has to handle a format error mid-render.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};

/// Pattern used when the configured `dateFormat` is missing or invalid.
pub const DEFAULT_DATE_FORMAT: &str = "yyy-MM-dd HH:mm:ss";

const MS_IN_SEC: i64 = 1000;
const MS_IN_MIN: i64 = 60 * MS_IN_SEC;
const MS_IN_HR: i64 = 60 * MS_IN_MIN;
const MS_IN_DAY: i64 = 24 * MS_IN_HR;

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

const WEEKDAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

// ── Durations ───────────────────────────────────────────────────────

/// Format the time between `start` and `end`.
///
/// A negative span (clock skew between kernel messages) is shown as `0ms`.
pub fn format_duration(end: DateTime<Utc>, start: DateTime<Utc>) -> String {
    format_millis((end - start).num_milliseconds())
}

/// Format a span given in milliseconds.
pub fn format_millis(ms: i64) -> String {
    let total = ms.max(0);
    if total < MS_IN_SEC {
        return format!("{total}ms");
    }

    let days = total / MS_IN_DAY;
    let hours = (total % MS_IN_DAY) / MS_IN_HR;
    let mins = (total % MS_IN_HR) / MS_IN_MIN;
    let rest = total % MS_IN_MIN;

    let mut parts = Vec::with_capacity(4);
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if days > 0 || hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if days > 0 || hours > 0 || mins > 0 {
        parts.push(format!("{mins}m"));
    }
    // Seconds are dropped once we're counting days, and lose their
    // fractional part once we're counting hours.
    if days == 0 {
        if hours > 0 {
            parts.push(format!("{}s", (rest + 500) / MS_IN_SEC));
        } else {
            let centis = (rest + 5) / 10;
            parts.push(format!("{}.{:02}s", centis / 100, centis % 100));
        }
    }
    parts.join(" ")
}

// ── Timestamp patterns ──────────────────────────────────────────────

/// Errors from compiling a date format pattern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("Unsupported token '{token}' at position {position} in date format")]
    UnsupportedToken { token: char, position: usize },

    #[error("Malformed token '{token}' at position {position} in date format")]
    MalformedToken { token: String, position: usize },

    #[error("Unterminated quoted text starting at position {position} in date format")]
    UnterminatedLiteral { position: usize },
}

/// Outcome of [`validate_pattern`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PatternValidation {
    pub valid: bool,
    /// Why the pattern was rejected (absent when valid).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Year,
    Quarter,
    Month,
    Day,
    Weekday,
    DayPeriod,
    /// `H`: 0-23
    Hour0To23,
    /// `h`: 1-12
    Hour1To12,
    /// `k`: 1-24
    Hour1To24,
    /// `K`: 0-11
    Hour0To11,
    Minute,
    Second,
    Fraction,
}

impl Field {
    fn from_letter(letter: char) -> Option<Self> {
        Some(match letter {
            'y' => Field::Year,
            'Q' | 'q' => Field::Quarter,
            'M' | 'L' => Field::Month,
            'd' => Field::Day,
            'E' => Field::Weekday,
            'a' => Field::DayPeriod,
            'H' => Field::Hour0To23,
            'h' => Field::Hour1To12,
            'k' => Field::Hour1To24,
            'K' => Field::Hour0To11,
            'm' => Field::Minute,
            's' => Field::Second,
            'S' => Field::Fraction,
            _ => return None,
        })
    }

    fn max_width(self) -> usize {
        match self {
            Field::Year | Field::Quarter | Field::Month | Field::DayPeriod => 5,
            Field::Weekday => 6,
            Field::Fraction => 9,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field, usize),
}

/// A compiled date format pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatePattern {
    source: String,
    segments: Vec<Segment>,
}

impl Default for DatePattern {
    fn default() -> Self {
        let lit = |s: &str| Segment::Literal(s.to_string());
        Self {
            source: DEFAULT_DATE_FORMAT.to_string(),
            segments: vec![
                Segment::Field(Field::Year, 3),
                lit("-"),
                Segment::Field(Field::Month, 2),
                lit("-"),
                Segment::Field(Field::Day, 2),
                lit(" "),
                Segment::Field(Field::Hour0To23, 2),
                lit(":"),
                Segment::Field(Field::Minute, 2),
                lit(":"),
                Segment::Field(Field::Second, 2),
            ],
        }
    }
}

impl DatePattern {
    /// Compile a pattern string.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars().enumerate().peekable();

        while let Some((position, c)) = chars.next() {
            if c == '\'' {
                if matches!(chars.peek(), Some((_, '\''))) {
                    chars.next();
                    literal.push('\'');
                    continue;
                }
                let mut closed = false;
                while let Some((_, q)) = chars.next() {
                    if q == '\'' {
                        if matches!(chars.peek(), Some((_, '\''))) {
                            chars.next();
                            literal.push('\'');
                            continue;
                        }
                        closed = true;
                        break;
                    }
                    literal.push(q);
                }
                if !closed {
                    return Err(PatternError::UnterminatedLiteral { position });
                }
            } else if c.is_ascii_alphabetic() {
                let mut width = 1;
                while matches!(chars.peek(), Some((_, next)) if *next == c) {
                    chars.next();
                    width += 1;
                }
                let field = Field::from_letter(c)
                    .ok_or(PatternError::UnsupportedToken { token: c, position })?;
                if width > field.max_width() {
                    return Err(PatternError::MalformedToken {
                        token: c.to_string().repeat(width),
                        position,
                    });
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Field(field, width));
            } else {
                literal.push(c);
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    /// The pattern string this was compiled from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Render a timestamp. Works for naive and zoned chrono types alike.
    pub fn format<T: Datelike + Timelike>(&self, t: &T) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(field, width) => push_field(&mut out, *field, *width, t),
            }
        }
        out
    }
}

fn push_field<T: Datelike + Timelike>(out: &mut String, field: Field, width: usize, t: &T) {
    let padded = |value: u32| format!("{value:0width$}");
    let text = match field {
        Field::Year => match width {
            2 => format!("{:02}", t.year().rem_euclid(100)),
            _ => format!("{:0width$}", t.year()),
        },
        Field::Quarter => {
            let quarter = t.month0() / 3 + 1;
            match width {
                3 => format!("Q{quarter}"),
                4 => format!("{}{} quarter", quarter, ordinal_suffix(quarter)),
                5 => quarter.to_string(),
                _ => padded(quarter),
            }
        }
        Field::Month => {
            let name = MONTH_NAMES[t.month0() as usize];
            match width {
                3 => name[..3].to_string(),
                4 => name.to_string(),
                5 => name[..1].to_string(),
                _ => padded(t.month()),
            }
        }
        Field::Day => padded(t.day()),
        Field::Weekday => {
            let name = WEEKDAY_NAMES[t.weekday().num_days_from_monday() as usize];
            match width {
                4 => name.to_string(),
                5 => name[..1].to_string(),
                6 => name[..2].to_string(),
                _ => name[..3].to_string(),
            }
        }
        Field::DayPeriod => {
            let pm = t.hour() >= 12;
            match (width, pm) {
                (3, false) => "am".to_string(),
                (3, true) => "pm".to_string(),
                (4, false) => "a.m.".to_string(),
                (4, true) => "p.m.".to_string(),
                (5, false) => "a".to_string(),
                (5, true) => "p".to_string(),
                (_, false) => "AM".to_string(),
                (_, true) => "PM".to_string(),
            }
        }
        Field::Hour0To23 => padded(t.hour()),
        Field::Hour1To12 => match t.hour() % 12 {
            0 => padded(12),
            h => padded(h),
        },
        Field::Hour1To24 => match t.hour() {
            0 => padded(24),
            h => padded(h),
        },
        Field::Hour0To11 => padded(t.hour() % 12),
        Field::Minute => padded(t.minute()),
        Field::Second => padded(t.second()),
        Field::Fraction => {
            // Leap seconds report nanos >= 1e9
            let nanos = format!("{:09}", t.nanosecond() % 1_000_000_000);
            nanos[..width].to_string()
        }
    };
    out.push_str(&text);
}

fn ordinal_suffix(n: u32) -> &'static str {
    match n {
        1 => "st",
        2 => "nd",
        3 => "rd",
        _ => "th",
    }
}

/// Render a timestamp with a pattern string.
pub fn format_timestamp<T: Datelike + Timelike>(
    t: &T,
    pattern: &str,
) -> Result<String, PatternError> {
    Ok(DatePattern::parse(pattern)?.format(t))
}

/// Check whether a pattern can be used as `dateFormat`.
///
/// Compiles the pattern and renders a probe timestamp with it. Never panics;
/// problems come back as `valid: false` with a message.
pub fn validate_pattern(pattern: &str) -> PatternValidation {
    match DatePattern::parse(pattern) {
        Ok(compiled) => {
            if let Some(probe) =
                NaiveDate::from_ymd_opt(2019, 12, 3).and_then(|d| d.and_hms_milli_opt(16, 4, 42, 10))
            {
                log::trace!("[formatters] Probe render: {}", compiled.format(&probe));
            }
            PatternValidation {
                valid: true,
                message: None,
            }
        }
        Err(e) => PatternValidation {
            valid: false,
            message: Some(format!(
                "{e}. See https://date-fns.org/docs/format for valid tokens"
            )),
        },
    }
}
