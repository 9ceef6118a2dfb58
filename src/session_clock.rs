// =============================================================================
// Session Clock — venue open/closed classification in Eastern Time
// =============================================================================
//
// Pure functions of wall-clock time in America/New_York. The fan-out servers
// broadcast the current session to browsers every 30 s; the tick path uses
// the extended-hours predicate to drop off-hours equity prints.
// =============================================================================

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Tz;
use serde::Serialize;

/// Market session buckets, classified on minute boundaries in ET.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MarketSession {
    #[serde(rename = "PRE_MARKET")]
    PreMarket,
    #[serde(rename = "REGULAR")]
    Regular,
    #[serde(rename = "AFTER_HOURS")]
    AfterHours,
    #[serde(rename = "CLOSED")]
    Closed,
}

impl MarketSession {
    /// Frontend label for the session banner.
    pub fn label(self) -> &'static str {
        match self {
            Self::PreMarket => "Pre-Market (4:00-9:30 AM ET)",
            Self::Regular => "Regular (9:30 AM-4:00 PM ET)",
            Self::AfterHours => "After Hours (4:00-8:00 PM ET)",
            Self::Closed => "Closed (8:00 PM-4:00 AM ET)",
        }
    }

    pub fn is_open(self) -> bool {
        self != Self::Closed
    }
}

impl std::fmt::Display for MarketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreMarket => write!(f, "PRE_MARKET"),
            Self::Regular => write!(f, "REGULAR"),
            Self::AfterHours => write!(f, "AFTER_HOURS"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Session payload sent to every tick client as `{"type":"session",...}`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session: MarketSession,
    pub label: &'static str,
    pub time_et: String,
    pub is_weekend: bool,
    pub is_open: bool,
}

/// Classify an instant already expressed in ET.
pub fn session_at(et: DateTime<Tz>) -> MarketSession {
    // Saturday / Sunday are closed regardless of the hour.
    if et.weekday().num_days_from_monday() >= 5 {
        return MarketSession::Closed;
    }
    let minutes = et.hour() * 60 + et.minute();
    match minutes {
        m if m < 240 => MarketSession::Closed,
        m if m < 570 => MarketSession::PreMarket,
        m if m < 960 => MarketSession::Regular,
        m if m < 1200 => MarketSession::AfterHours,
        _ => MarketSession::Closed,
    }
}

/// Current session from the system clock.
pub fn current() -> MarketSession {
    session_at(Utc::now().with_timezone(&New_York))
}

pub fn is_open() -> bool {
    current().is_open()
}

/// Full session payload from the system clock.
pub fn info() -> SessionInfo {
    let et = Utc::now().with_timezone(&New_York);
    let session = session_at(et);
    SessionInfo {
        session,
        label: session.label(),
        time_et: et.format("%H:%M:%S ET").to_string(),
        is_weekend: et.weekday().num_days_from_monday() >= 5,
        is_open: session.is_open(),
    }
}

/// Extended-hours test for an epoch-second timestamp: ET weekday with
/// hour in [4, 20). Covers pre-market, regular, and after-hours so the
/// equity timeline stays continuous without dead night gaps.
pub fn in_extended_hours(epoch_secs: i64) -> bool {
    let Some(utc) = Utc.timestamp_opt(epoch_secs, 0).single() else {
        return false;
    };
    let et = utc.with_timezone(&New_York);
    if et.weekday().num_days_from_monday() >= 5 {
        return false;
    }
    (4..20).contains(&et.hour())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn et(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Tz> {
        New_York
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .expect("unambiguous ET time")
    }

    #[test]
    fn weekday_session_boundaries() {
        // 2024-06-12 is a Wednesday.
        assert_eq!(session_at(et(2024, 6, 12, 3, 59)), MarketSession::Closed);
        assert_eq!(session_at(et(2024, 6, 12, 4, 0)), MarketSession::PreMarket);
        assert_eq!(session_at(et(2024, 6, 12, 9, 29)), MarketSession::PreMarket);
        assert_eq!(session_at(et(2024, 6, 12, 9, 30)), MarketSession::Regular);
        assert_eq!(session_at(et(2024, 6, 12, 15, 59)), MarketSession::Regular);
        assert_eq!(session_at(et(2024, 6, 12, 16, 0)), MarketSession::AfterHours);
        assert_eq!(session_at(et(2024, 6, 12, 19, 59)), MarketSession::AfterHours);
        assert_eq!(session_at(et(2024, 6, 12, 20, 0)), MarketSession::Closed);
    }

    #[test]
    fn weekend_always_closed() {
        // 2024-06-15 / 16 are Saturday / Sunday.
        assert_eq!(session_at(et(2024, 6, 15, 12, 0)), MarketSession::Closed);
        assert_eq!(session_at(et(2024, 6, 16, 10, 30)), MarketSession::Closed);
    }

    #[test]
    fn extended_hours_predicate() {
        // Wednesday 2024-06-12 10:00 ET.
        let open = et(2024, 6, 12, 10, 0).timestamp();
        assert!(in_extended_hours(open));

        // Wednesday 03:00 ET — overnight.
        let night = et(2024, 6, 12, 3, 0).timestamp();
        assert!(!in_extended_hours(night));

        // Wednesday 20:00 ET — boundary is exclusive.
        let evening = et(2024, 6, 12, 20, 0).timestamp();
        assert!(!in_extended_hours(evening));

        // Saturday noon ET.
        let weekend = et(2024, 6, 15, 12, 0).timestamp();
        assert!(!in_extended_hours(weekend));
    }

    #[test]
    fn open_flag_tracks_session() {
        assert!(!MarketSession::Closed.is_open());
        assert!(MarketSession::PreMarket.is_open());
        assert!(MarketSession::Regular.is_open());
        assert!(MarketSession::AfterHours.is_open());
    }
}
