//! Campaign send-window parsing
//!
//! Campaigns may restrict sending to an hour-of-day window. The one
//! accepted grammar is `"HH:MM-HH:MM"` in UTC; a window may wrap past
//! midnight (`"22:00-06:00"`). Anything else is rejected at pipe creation.

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use std::time::Duration;
use thiserror::Error;

/// Send-window parse errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SendWindowError {
    #[error("Send interval must be \"HH:MM-HH:MM\", got {0:?}")]
    Grammar(String),

    #[error("Send interval start and end are equal: {0:?}")]
    Empty(String),
}

/// An hour-of-day sending window in UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    from: NaiveTime,
    to: NaiveTime,
}

impl SendWindow {
    /// Parse the canonical `"HH:MM-HH:MM"` form.
    pub fn parse(s: &str) -> Result<Self, SendWindowError> {
        let raw = s.trim();
        let (from_s, to_s) = raw
            .split_once('-')
            .ok_or_else(|| SendWindowError::Grammar(s.to_string()))?;

        let from = NaiveTime::parse_from_str(from_s.trim(), "%H:%M")
            .map_err(|_| SendWindowError::Grammar(s.to_string()))?;
        let to = NaiveTime::parse_from_str(to_s.trim(), "%H:%M")
            .map_err(|_| SendWindowError::Grammar(s.to_string()))?;

        if from == to {
            return Err(SendWindowError::Empty(s.to_string()));
        }

        Ok(Self { from, to })
    }

    /// Whether `now` falls inside the window. The end bound is exclusive.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let t = now.time();
        if self.from < self.to {
            t >= self.from && t < self.to
        } else {
            // Wraps past midnight.
            t >= self.from || t < self.to
        }
    }

    /// How long until the window next opens, measured from `now`.
    /// Returns at least one second so callers never busy-loop.
    pub fn until_open(&self, now: DateTime<Utc>) -> Duration {
        if self.contains(now) {
            return Duration::from_secs(1);
        }

        let now_secs = now.time().num_seconds_from_midnight() as i64;
        let open_secs = self.from.num_seconds_from_midnight() as i64;

        let mut wait = open_secs - now_secs;
        if wait <= 0 {
            wait += 24 * 3600;
        }

        Duration::from_secs(wait.max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_parse_valid() {
        let w = SendWindow::parse("09:00-17:00").unwrap();
        assert!(w.contains(at(9, 0)));
        assert!(w.contains(at(12, 30)));
        assert!(!w.contains(at(17, 0)));
        assert!(!w.contains(at(8, 59)));
    }

    #[test]
    fn test_parse_wraps_midnight() {
        let w = SendWindow::parse("22:00-06:00").unwrap();
        assert!(w.contains(at(23, 0)));
        assert!(w.contains(at(2, 0)));
        assert!(!w.contains(at(12, 0)));
        assert!(!w.contains(at(6, 0)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            SendWindow::parse("9am to 5pm"),
            Err(SendWindowError::Grammar(_))
        ));
        assert!(SendWindow::parse("09:00").is_err());
        assert!(SendWindow::parse("25:00-26:00").is_err());
        assert!(SendWindow::parse("").is_err());
        assert!(matches!(
            SendWindow::parse("09:00-09:00"),
            Err(SendWindowError::Empty(_))
        ));
    }

    #[test]
    fn test_until_open() {
        let w = SendWindow::parse("09:00-17:00").unwrap();
        assert_eq!(w.until_open(at(8, 0)), Duration::from_secs(3600));
        // Already open: minimum wait.
        assert_eq!(w.until_open(at(10, 0)), Duration::from_secs(1));
        // After close: wait until tomorrow 09:00.
        assert_eq!(w.until_open(at(18, 0)), Duration::from_secs(15 * 3600));
    }
}
