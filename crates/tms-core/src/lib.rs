pub mod clock;
pub mod cursor;
pub mod guard;
pub mod indicator;
pub mod patcher;
pub mod schedule;
pub mod sync_contracts;
pub mod view;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Check-in status of a bus route.
///
/// The only legal transitions form a fixed 3-cycle:
/// `not_present -> arrived -> ready -> not_present`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    NotPresent,
    Arrived,
    Ready,
}

impl Default for RouteStatus {
    fn default() -> Self {
        Self::NotPresent
    }
}

impl RouteStatus {
    pub const ALL: [RouteStatus; 3] = [
        RouteStatus::NotPresent,
        RouteStatus::Arrived,
        RouteStatus::Ready,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteStatus::NotPresent => "not_present",
            RouteStatus::Arrived => "arrived",
            RouteStatus::Ready => "ready",
        }
    }

    pub fn next(self) -> Self {
        match self {
            RouteStatus::NotPresent => RouteStatus::Arrived,
            RouteStatus::Arrived => RouteStatus::Ready,
            RouteStatus::Ready => RouteStatus::NotPresent,
        }
    }

    /// Bootstrap contextual colour used for the badge.
    pub fn color(&self) -> &'static str {
        match self {
            RouteStatus::NotPresent => "danger",
            RouteStatus::Arrived => "warning",
            RouteStatus::Ready => "success",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RouteStatus::NotPresent => "Not Present",
            RouteStatus::Arrived => "Arrived",
            RouteStatus::Ready => "Ready",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            RouteStatus::NotPresent => "fa-times-circle",
            RouteStatus::Arrived => "fa-clock",
            RouteStatus::Ready => "fa-check-circle",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, RouteStatus::Ready)
    }
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouteStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "not_present" | "not-present" | "notpresent" => Ok(RouteStatus::NotPresent),
            "arrived" => Ok(RouteStatus::Arrived),
            "ready" => Ok(RouteStatus::Ready),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_has_period_three_from_every_start() {
        for start in RouteStatus::ALL {
            let mut seen = vec![start];
            let mut current = start;
            for _ in 0..6 {
                current = current.next();
                seen.push(current);
            }
            assert_eq!(seen[3], start);
            assert_eq!(seen[6], start);
            assert_ne!(seen[1], start);
            assert_ne!(seen[2], start);
            assert_ne!(seen[1], seen[2]);
        }
    }

    #[test]
    fn cycle_order_matches_check_in_flow() {
        assert_eq!(RouteStatus::NotPresent.next(), RouteStatus::Arrived);
        assert_eq!(RouteStatus::Arrived.next(), RouteStatus::Ready);
        assert_eq!(RouteStatus::Ready.next(), RouteStatus::NotPresent);
    }

    #[test]
    fn parse_accepts_wire_and_loose_spellings() {
        assert_eq!("not_present".parse(), Ok(RouteStatus::NotPresent));
        assert_eq!(" Not-Present ".parse(), Ok(RouteStatus::NotPresent));
        assert_eq!("READY".parse(), Ok(RouteStatus::Ready));
        assert!("departed".parse::<RouteStatus>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let raw = serde_json::to_string(&RouteStatus::NotPresent).expect("serialize");
        assert_eq!(raw, "\"not_present\"");
        let parsed: RouteStatus = serde_json::from_str("\"arrived\"").expect("parse");
        assert_eq!(parsed, RouteStatus::Arrived);
    }
}
