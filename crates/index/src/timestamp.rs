//! Backup timestamps.
//!
//! A [`Timestamp`] is whole seconds since the Unix epoch (UTC). Inside stored
//! names it is written as `YYYYMMDDhhmmss`; instants outside the four-digit
//! year range fall back to `u<seconds>`, which also decodes.

use crate::error::{Error, ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_unix(secs: i64) -> Self {
        Self(secs)
    }

    pub const fn as_unix(self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        Self(OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn to_datetime(self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(self.0).ok()
    }

    /// `self - duration`, or `None` on overflow.
    pub fn checked_sub(self, duration: Duration) -> Option<Self> {
        let secs = i64::try_from(duration.as_secs()).ok()?;
        self.0.checked_sub(secs).map(Self)
    }

    /// Decode the time token of a stored name (without its flag).
    ///
    /// Accepts `YYYYMMDDhhmmss`, `YYYYMMDDThhmmss`, `YYYY-MM-DDThh:mm:ss` (the
    /// last two with an optional trailing `Z`) and `u<seconds>`.
    pub fn from_token(token: &str) -> Option<Self> {
        if let Some(epoch) = token.strip_prefix('u') {
            let digits = epoch.strip_prefix('-').unwrap_or(epoch);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            return epoch.parse().ok().map(Self);
        }

        let token = token.strip_suffix('Z').unwrap_or(token);
        let bytes = token.as_bytes();
        let compact: Vec<u8> = match bytes.len() {
            14 => bytes.to_vec(),
            15 if bytes[8] == b'T' => [&bytes[..8], &bytes[9..]].concat(),
            19 if bytes[4] == b'-' && bytes[7] == b'-' && bytes[10] == b'T' && bytes[13] == b':' && bytes[16] == b':' => {
                bytes.iter().enumerate().filter(|(i, _)| ![4, 7, 10, 13, 16].contains(i)).map(|(_, b)| *b).collect()
            },
            _ => return None,
        };
        if !compact.iter().all(u8::is_ascii_digit) {
            return None;
        }

        let field = |range: Range<usize>| compact[range].iter().fold(0u32, |acc, d| acc * 10 + u32::from(d - b'0'));
        let month = Month::try_from(field(4..6) as u8).ok()?;
        let date = Date::from_calendar_date(field(0..4) as i32, month, field(6..8) as u8).ok()?;
        let time = Time::from_hms(field(8..10) as u8, field(10..12) as u8, field(12..14) as u8).ok()?;
        Some(Self(PrimitiveDateTime::new(date, time).assume_utc().unix_timestamp()))
    }

    fn parse_absolute(text: &str) -> Option<Self> {
        Self::from_token(text)
            .or_else(|| OffsetDateTime::parse(text, &Rfc3339).ok().map(Self::from))
            .or_else(|| {
                Date::parse(text, format_description!("[year]-[month]-[day]"))
                    .ok()
                    .map(|date| Self::from(date.midnight().assume_utc()))
            })
    }

    /// Parse a user-supplied instant.
    ///
    /// On top of the absolute forms accepted by [`FromStr`], this understands
    /// `now` and relative durations such as `3days` or `12h ago`, both
    /// measured back from `now`.
    pub fn parse_instant(text: &str, now: Timestamp) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("now") {
            return Ok(now);
        }
        if let Some(absolute) = Self::parse_absolute(trimmed) {
            return Ok(absolute);
        }
        let relative = trimmed.strip_suffix("ago").map(str::trim_end).unwrap_or(trimmed);
        let duration =
            humantime::parse_duration(relative).or_raise(|| ErrorKind::InvalidTimestamp(text.to_string()))?;
        now.checked_sub(duration).ok_or_raise(|| ErrorKind::InvalidTimestamp(text.to_string()))
    }

    /// RFC 3339 rendering, used for index metadata.
    pub fn to_rfc3339(self) -> Option<String> {
        self.to_datetime()?.format(&Rfc3339).ok()
    }
}

impl From<OffsetDateTime> for Timestamp {
    fn from(datetime: OffsetDateTime) -> Self {
        Self(datetime.unix_timestamp())
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    /// Absolute instants only: any stored-name token form, RFC 3339, or a
    /// bare `YYYY-MM-DD` (midnight UTC).
    fn from_str(s: &str) -> Result<Self> {
        Self::parse_absolute(s.trim()).ok_or_raise(|| ErrorKind::InvalidTimestamp(s.to_string()))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) if (0..=9999).contains(&dt.year()) => write!(
                f,
                "{:04}{:02}{:02}{:02}{:02}{:02}",
                dt.year(),
                u8::from(dt.month()),
                dt.day(),
                dt.hour(),
                dt.minute(),
                dt.second()
            ),
            _ => write!(f, "u{}", self.0),
        }
    }
}
