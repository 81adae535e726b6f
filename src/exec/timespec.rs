// src/exec/timespec.rs

//! Time literals accepted by `schedule` and by condition delays.
//!
//! Two forms are understood:
//! - relative: a decimal number followed by a unit, e.g. `"0.5s"`, `"2m"`,
//!   `"10ms"`, `"250us"`, `"1h"`
//! - absolute: a 20-digit local timestamp `YYYYmmddHHMMSSffffff`
//!   (microsecond precision), e.g. `"20240807124732894211"`

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::{Duration, Instant, SystemTime};

use chrono::{Local, NaiveDate, TimeZone};
use regex::Regex;

use crate::errors::{ExpctlError, Result};

/// Stand-in for "never" when a deadline would overflow the monotonic clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

static RELATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<time>\d+(\.\d+)?)(?P<units>ms|us|h|m|s)$")
        .expect("relative time regex is valid")
});

/// When a scheduled callback (or a delayed action) becomes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSpec {
    /// Due immediately.
    Now,
    /// Due once this much time has passed since scheduling.
    After(Duration),
    /// Due at a wall-clock time.
    At(SystemTime),
}

impl TimeSpec {
    /// Resolve to a monotonic deadline relative to `now`.
    ///
    /// Wall-clock times already in the past resolve to `now`.
    pub fn deadline_from(&self, now: Instant) -> Instant {
        match self {
            TimeSpec::Now => now,
            TimeSpec::After(d) => saturating_deadline(now, *d),
            TimeSpec::At(at) => match at.duration_since(SystemTime::now()) {
                Ok(ahead) => saturating_deadline(now, ahead),
                Err(_) => now,
            },
        }
    }

    /// Time still to wait, measured from `since`, before this spec is met.
    ///
    /// For relative specs `since` is the reference point (e.g. when a guard
    /// reached its state); absolute specs ignore it.
    pub fn remaining(&self, since: Instant, now: Instant) -> Duration {
        match self {
            TimeSpec::Now => Duration::ZERO,
            TimeSpec::After(d) => saturating_deadline(since, *d).saturating_duration_since(now),
            TimeSpec::At(at) => at
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO),
        }
    }
}

/// `from + delay`, clamped to a point decades ahead when the sum does not
/// fit in an [`Instant`].
pub fn saturating_deadline(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

impl From<Duration> for TimeSpec {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            TimeSpec::Now
        } else {
            TimeSpec::After(d)
        }
    }
}

impl FromStr for TimeSpec {
    type Err = ExpctlError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(TimeSpec::Now);
        }
        if s.len() == 20 && s.bytes().all(|b| b.is_ascii_digit()) {
            return parse_absolute(s).map(TimeSpec::At);
        }
        parse_duration(s).map(TimeSpec::from)
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeSpec::Now => f.write_str("now"),
            TimeSpec::After(d) => write!(f, "{}s", d.as_secs_f64()),
            TimeSpec::At(at) => f.write_str(&format_timestamp(*at)),
        }
    }
}

/// Parse a relative time literal such as `"1.5s"` into a [`Duration`].
pub fn parse_duration(s: &str) -> Result<Duration> {
    let caps = RELATIVE
        .captures(s.trim())
        .ok_or_else(|| ExpctlError::InvalidTimeSpec(s.to_string()))?;

    let value: f64 = caps["time"]
        .parse()
        .map_err(|_| ExpctlError::InvalidTimeSpec(s.to_string()))?;

    let secs = match &caps["units"] {
        "h" => value * 3600.0,
        "m" => value * 60.0,
        "s" => value,
        "ms" => value / 1_000.0,
        _ => value / 1_000_000.0,
    };

    Duration::try_from_secs_f64(secs).map_err(|_| ExpctlError::InvalidTimeSpec(s.to_string()))
}

fn parse_absolute(s: &str) -> Result<SystemTime> {
    let invalid = || ExpctlError::InvalidTimeSpec(s.to_string());
    let field = |range: std::ops::Range<usize>| -> Result<u32> {
        s.get(range)
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(invalid)
    };

    let year = field(0..4)? as i32;
    let naive = NaiveDate::from_ymd_opt(year, field(4..6)?, field(6..8)?)
        .and_then(|date| {
            date.and_hms_micro_opt(
                field(8..10).ok()?,
                field(10..12).ok()?,
                field(12..14).ok()?,
                field(14..20).ok()?,
            )
        })
        .ok_or_else(invalid)?;

    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(invalid)?;

    Ok(SystemTime::from(local))
}

/// Render a wall-clock time in the 20-digit absolute format.
pub fn format_timestamp(at: SystemTime) -> String {
    let local: chrono::DateTime<Local> = at.into();
    local.format("%Y%m%d%H%M%S%6f").to_string()
}
