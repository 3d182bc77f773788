//! Local-time activity window, written `HH:MM-HH:MM`.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveTime;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
#[error("invalid active hours '{0}', expected HH:MM-HH:MM")]
pub struct InvalidActiveHours(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ActiveHours {
    /// `end < start` wraps past midnight. `start == end` covers the whole day.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            t >= self.start && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }

    /// Parse an optional window. A malformed one is logged and ignored, which
    /// leaves the heartbeat always active.
    pub fn from_config(raw: Option<&str>) -> Option<Self> {
        let raw = raw?.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.parse() {
            Ok(hours) => Some(hours),
            Err(e) => {
                warn!(error = %e, "Ignoring active hours, heartbeat stays always active");
                None
            }
        }
    }
}

impl FromStr for ActiveHours {
    type Err = InvalidActiveHours;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidActiveHours(s.to_string());
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").map_err(|_| invalid())?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").map_err(|_| invalid())?;
        Ok(Self { start, end })
    }
}

impl fmt::Display for ActiveHours {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn daytime_window() {
        let w: ActiveHours = "09:00-17:30".parse().unwrap();
        assert!(w.contains(at(9, 0)));
        assert!(w.contains(at(17, 29)));
        assert!(!w.contains(at(17, 30)));
        assert!(!w.contains(at(3, 0)));
    }

    #[test]
    fn window_spanning_midnight() {
        let w: ActiveHours = " 22:00 - 06:00 ".parse().unwrap();
        assert!(w.contains(at(23, 15)));
        assert!(w.contains(at(0, 0)));
        assert!(w.contains(at(5, 59)));
        assert!(!w.contains(at(6, 0)));
        assert!(!w.contains(at(12, 0)));
        assert_eq!(w.to_string(), "22:00-06:00");
    }

    #[test]
    fn equal_bounds_mean_all_day() {
        let w: ActiveHours = "08:00-08:00".parse().unwrap();
        assert!(w.contains(at(3, 0)));
        assert!(w.contains(at(8, 0)));
    }

    #[test]
    fn malformed_or_absent_means_always_active() {
        assert!("9-5".parse::<ActiveHours>().is_err());
        assert!("25:00-06:00".parse::<ActiveHours>().is_err());
        assert_eq!(ActiveHours::from_config(Some("whenever")), None);
        assert_eq!(ActiveHours::from_config(None), None);
        assert_eq!(ActiveHours::from_config(Some("  ")), None);
    }
}
