use crate::RouteStatus;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const ROUTES_POLL_INTERVAL_MS: u64 = 2_000;
pub const STUDENTS_POLL_INTERVAL_MS: u64 = 5_000;

/// Category of live data a page monitors. Pages outside these domains do not poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDomain {
    Routes,
    Students,
}

impl SyncDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDomain::Routes => "routes",
            SyncDomain::Students => "students",
        }
    }

    /// Maps a page name to the domain it monitors, `None` for pages that should not poll.
    pub fn for_page(page: &str) -> Option<Self> {
        page.parse().ok()
    }

    pub fn default_interval_ms(&self) -> u64 {
        match self {
            SyncDomain::Routes => ROUTES_POLL_INTERVAL_MS,
            SyncDomain::Students => STUDENTS_POLL_INTERVAL_MS,
        }
    }

    pub fn page_path(&self) -> &'static str {
        match self {
            SyncDomain::Routes => "/routes",
            SyncDomain::Students => "/students",
        }
    }

    pub fn sync_path(&self) -> String {
        format!("/api/sync/{}", self.as_str())
    }

    /// Element id of the table body the page renders for this domain.
    pub fn table_body_id(&self) -> &'static str {
        match self {
            SyncDomain::Routes => "routes-table-body",
            SyncDomain::Students => "students-table-body",
        }
    }
}

impl fmt::Display for SyncDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncDomain {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().trim_matches('/').to_lowercase();
        match normalized.as_str() {
            "routes" => Ok(SyncDomain::Routes),
            "students" => Ok(SyncDomain::Students),
            other => Err(format!("Unknown sync domain: {other}")),
        }
    }
}

/// Raw `GET /api/sync/{domain}` body. Every field except `success` is optional
/// on the wire; `parse_sync_body` decides what a usable payload is.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(
        default,
        deserialize_with = "deserialize_epoch_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes_updated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<BTreeMap<String, RouteSyncEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_refresh: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteSyncEntry {
    pub status: String,
    #[serde(default)]
    pub status_color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guide_present: Option<bool>,
}

impl RouteSyncEntry {
    pub fn from_status(status: RouteStatus, guide_present: bool) -> Self {
        Self {
            status: status.as_str().to_string(),
            status_color: status.color().to_string(),
            status_text: Some(status.label().to_string()),
            guide_present: Some(guide_present),
        }
    }
}

/// Response of `POST /routes/{id}/cycle-status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleStatusResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RouteStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Response of `POST /routes/bulk-update-status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkUpdateResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RouteStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDelta {
    pub route_id: String,
    pub status: RouteStatus,
    pub guide_present: Option<bool>,
}

/// A validated sync response, ready for the patcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPayload {
    Routes {
        timestamp: i64,
        routes_updated: bool,
        /// `None` when the response carried no `routes` field at all.
        routes: Option<Vec<RouteDelta>>,
        /// Route ids whose status string could not be understood.
        invalid: Vec<String>,
    },
    Students {
        timestamp: i64,
        student_count: Option<u64>,
        needs_refresh: bool,
    },
}

impl SyncPayload {
    pub fn timestamp(&self) -> i64 {
        match self {
            SyncPayload::Routes { timestamp, .. } => *timestamp,
            SyncPayload::Students { timestamp, .. } => *timestamp,
        }
    }

    pub fn domain(&self) -> SyncDomain {
        match self {
            SyncPayload::Routes { .. } => SyncDomain::Routes,
            SyncPayload::Students { .. } => SyncDomain::Students,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("unexpected http status {status}")]
    Http { status: u16 },
    #[error("malformed sync response: {0}")]
    Malformed(String),
    #[error("server reported an unsuccessful sync")]
    Rejected,
    #[error("sync response has no usable timestamp")]
    MissingTimestamp,
}

impl SyncError {
    /// Transport-level failures; these drive the connection indicator.
    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Http { .. })
    }

    /// Failures that count against poll health. A well-formed `success: false`
    /// counts; a garbled body does not.
    pub fn marks_disconnected(&self) -> bool {
        self.is_network() || matches!(self, SyncError::Rejected)
    }
}

pub fn parse_sync_body(domain: SyncDomain, body: &str) -> Result<SyncPayload, SyncError> {
    let response: SyncResponse =
        serde_json::from_str(body).map_err(|err| SyncError::Malformed(err.to_string()))?;
    validate_sync_response(domain, response)
}

pub fn validate_sync_response(
    domain: SyncDomain,
    response: SyncResponse,
) -> Result<SyncPayload, SyncError> {
    if !response.success {
        return Err(SyncError::Rejected);
    }
    let timestamp = match response.timestamp {
        Some(value) if value >= 0 => value,
        _ => return Err(SyncError::MissingTimestamp),
    };

    match domain {
        SyncDomain::Routes => {
            let mut invalid = Vec::new();
            let routes = response.routes.map(|entries| {
                let mut deltas = Vec::with_capacity(entries.len());
                for (route_id, entry) in entries {
                    match entry.status.parse::<RouteStatus>() {
                        Ok(status) => deltas.push(RouteDelta {
                            route_id,
                            status,
                            guide_present: entry.guide_present,
                        }),
                        Err(_) => invalid.push(route_id),
                    }
                }
                deltas
            });
            Ok(SyncPayload::Routes {
                timestamp,
                routes_updated: response.routes_updated.unwrap_or(false),
                routes,
                invalid,
            })
        }
        SyncDomain::Students => Ok(SyncPayload::Students {
            timestamp,
            student_count: response.student_count,
            needs_refresh: response.needs_refresh.unwrap_or(false),
        }),
    }
}

/// Parses the `last_update` query value. Anything that is not a finite,
/// non-negative number (including `nan` and `inf`) reads as 0.
pub fn parse_last_update(raw: &str) -> i64 {
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse::<i64>() {
        return value.max(0);
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => value.floor() as i64,
        _ => 0,
    }
}

/// Accepts integer or float epoch milliseconds.
fn deserialize_epoch_ms<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<Value> = Option::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            if let Some(v) = n.as_i64() {
                Ok(Some(v))
            } else if let Some(v) = n.as_f64() {
                Ok(Some(v.floor() as i64))
            } else {
                Err(serde::de::Error::custom("timestamp out of range"))
            }
        }
        Some(_) => Err(serde::de::Error::custom("expected numeric timestamp")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_payload_parses_deltas() {
        let body = r#"{
            "success": true,
            "timestamp": 1700000000123,
            "routes": {
                "r1": {"status": "arrived", "status_color": "warning", "guide_present": false},
                "r2": {"status": "ready", "status_color": "success"}
            }
        }"#;
        let payload = parse_sync_body(SyncDomain::Routes, body).expect("parse");
        match payload {
            SyncPayload::Routes {
                timestamp,
                routes_updated,
                routes,
                invalid,
            } => {
                assert_eq!(timestamp, 1_700_000_000_123);
                assert!(!routes_updated);
                assert!(invalid.is_empty());
                let routes = routes.expect("routes present");
                assert_eq!(routes.len(), 2);
                assert_eq!(routes[0].route_id, "r1");
                assert_eq!(routes[0].status, RouteStatus::Arrived);
                assert_eq!(routes[0].guide_present, Some(false));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn success_without_routes_still_carries_timestamp() {
        let payload =
            parse_sync_body(SyncDomain::Routes, r#"{"success": true, "timestamp": 50}"#)
                .expect("parse");
        assert_eq!(payload.timestamp(), 50);
        assert!(matches!(payload, SyncPayload::Routes { routes: None, .. }));
    }

    #[test]
    fn success_without_timestamp_is_rejected() {
        let err = parse_sync_body(SyncDomain::Routes, r#"{"success": true}"#).unwrap_err();
        assert_eq!(err, SyncError::MissingTimestamp);
        assert!(!err.marks_disconnected());
    }

    #[test]
    fn unsuccessful_payload_counts_as_disconnect() {
        let err =
            parse_sync_body(SyncDomain::Routes, r#"{"success": false, "timestamp": 9}"#)
                .unwrap_err();
        assert_eq!(err, SyncError::Rejected);
        assert!(err.marks_disconnected());
    }

    #[test]
    fn garbage_body_is_malformed() {
        let err = parse_sync_body(SyncDomain::Students, "<html>oops</html>").unwrap_err();
        assert!(matches!(err, SyncError::Malformed(_)));
        assert!(!err.is_network());
    }

    #[test]
    fn unknown_status_entries_are_dropped_not_fatal() {
        let body = r#"{"success": true, "timestamp": 1, "routes": {
            "a": {"status": "teleported", "status_color": "secondary"},
            "b": {"status": "not_present", "status_color": "danger"}
        }}"#;
        let payload = parse_sync_body(SyncDomain::Routes, body).expect("parse");
        let SyncPayload::Routes { routes, invalid, .. } = payload else {
            panic!("expected routes payload");
        };
        assert_eq!(invalid, vec!["a".to_string()]);
        assert_eq!(routes.expect("routes").len(), 1);
    }

    #[test]
    fn float_timestamps_are_truncated() {
        let payload =
            parse_sync_body(SyncDomain::Students, r#"{"success": true, "timestamp": 12.9, "needs_refresh": true}"#)
                .expect("parse");
        assert_eq!(
            payload,
            SyncPayload::Students {
                timestamp: 12,
                student_count: None,
                needs_refresh: true
            }
        );
    }

    #[test]
    fn last_update_query_is_sanitized() {
        assert_eq!(parse_last_update("1700"), 1700);
        assert_eq!(parse_last_update("1700.75"), 1700);
        assert_eq!(parse_last_update("nan"), 0);
        assert_eq!(parse_last_update("-inf"), 0);
        assert_eq!(parse_last_update("Infinity"), 0);
        assert_eq!(parse_last_update("-5"), 0);
        assert_eq!(parse_last_update("abc"), 0);
    }

    #[test]
    fn only_live_pages_map_to_domains() {
        assert_eq!(SyncDomain::for_page("routes"), Some(SyncDomain::Routes));
        assert_eq!(SyncDomain::for_page("/students/"), Some(SyncDomain::Students));
        assert_eq!(SyncDomain::for_page("schools"), None);
        assert_eq!(SyncDomain::for_page("dashboard"), None);
    }
}
