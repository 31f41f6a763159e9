use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tms_core::clock::Clock;
use tms_core::sync_contracts::{RouteSyncEntry, SyncResponse};
use tms_core::view::RowNode;
use tms_core::RouteStatus;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteRecord {
    pub id: String,
    pub route_number: String,
    #[serde(default)]
    pub school: String,
    #[serde(default)]
    pub status: RouteStatus,
    #[serde(default)]
    pub guide_present: bool,
    #[serde(default)]
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StudentRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub route_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub routes: Vec<RouteRecord>,
    #[serde(default)]
    pub students: Vec<StudentRecord>,
}

impl SeedData {
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| StoreError::Seed(format!("{}: {err}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|err| StoreError::Seed(format!("{}: {err}", path.display())))
    }

    pub fn demo() -> Self {
        let routes = [("r1", "101", "Hamilton North"), ("r2", "102", "Hamilton North"), ("r3", "205", "Hamilton South")]
            .into_iter()
            .map(|(id, number, school)| RouteRecord {
                id: id.to_string(),
                route_number: number.to_string(),
                school: school.to_string(),
                status: RouteStatus::NotPresent,
                guide_present: false,
                updated_at_ms: 0,
            })
            .collect();
        let students = [("s1", "Amara Okafor", Some("r1")), ("s2", "Ben Carter", Some("r2")), ("s3", "Chloe Singh", None)]
            .into_iter()
            .map(|(id, name, route)| StudentRecord {
                id: id.to_string(),
                name: name.to_string(),
                route_id: route.map(str::to_string),
            })
            .collect();
        Self { routes, students }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("route not found: {0}")]
    RouteNotFound(String),
    #[error("route already exists: {0}")]
    DuplicateRoute(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("seed error: {0}")]
    Seed(String),
}

/// Authoritative route and student state.
///
/// Every write is stamped with a strictly increasing epoch-millisecond value;
/// sync responses carry a stamp no smaller than any write they reflect, so a
/// client that polls with the returned timestamp never misses a later write.
pub struct StatusStore {
    clock: Arc<dyn Clock>,
    last_stamp: i64,
    next_route_seq: u64,
    next_student_seq: u64,
    routes: BTreeMap<String, RouteRecord>,
    students: BTreeMap<String, StudentRecord>,
    routes_membership_at: i64,
    students_membership_at: i64,
}

impl StatusStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last_stamp: 0,
            next_route_seq: 1,
            next_student_seq: 1,
            routes: BTreeMap::new(),
            students: BTreeMap::new(),
            routes_membership_at: 0,
            students_membership_at: 0,
        }
    }

    pub fn with_seed(clock: Arc<dyn Clock>, seed: SeedData) -> Self {
        let mut store = Self::new(clock);
        let stamp = store.write_stamp();
        for mut route in seed.routes {
            route.updated_at_ms = stamp;
            if route.status.is_ready() {
                route.guide_present = true;
            }
            store.routes.insert(route.id.clone(), route);
        }
        for student in seed.students {
            store.students.insert(student.id.clone(), student);
        }
        store.next_route_seq = store.routes.len() as u64 + 1;
        store.next_student_seq = store.students.len() as u64 + 1;
        store
    }

    fn write_stamp(&mut self) -> i64 {
        let now = self.clock.now_ms();
        self.last_stamp = now.max(self.last_stamp + 1);
        self.last_stamp
    }

    /// Stamp for anything that reports state as of now. Every later write
    /// gets a strictly greater stamp.
    pub fn read_stamp(&mut self) -> i64 {
        let now = self.clock.now_ms();
        self.last_stamp = now.max(self.last_stamp);
        self.last_stamp
    }

    pub fn route(&self, id: &str) -> Option<&RouteRecord> {
        self.routes.get(id)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn student_count(&self) -> usize {
        self.students.len()
    }

    /// Every route's current status. Sending the whole map each time lets a
    /// client re-evaluate rows it skipped while they were guarded.
    /// `routes_updated` is set when rows were added or removed after a
    /// non-zero `since`. Boards seed `since` from the stamp their page was
    /// rendered at, so only a client with no stamp at all sends 0.
    pub fn sync_routes(&mut self, since: i64) -> SyncResponse {
        let timestamp = self.read_stamp();
        let routes = self
            .routes
            .values()
            .map(|route| {
                (
                    route.id.clone(),
                    RouteSyncEntry::from_status(route.status, route.guide_present),
                )
            })
            .collect();
        SyncResponse {
            success: true,
            timestamp: Some(timestamp),
            routes_updated: Some(since > 0 && self.routes_membership_at > since),
            routes: Some(routes),
            ..SyncResponse::default()
        }
    }

    pub fn sync_students(&mut self, since: i64) -> SyncResponse {
        let timestamp = self.read_stamp();
        SyncResponse {
            success: true,
            timestamp: Some(timestamp),
            student_count: Some(self.students.len() as u64),
            needs_refresh: Some(since > 0 && self.students_membership_at > since),
            ..SyncResponse::default()
        }
    }

    /// Basic shape for pages without live data.
    pub fn sync_other(&mut self) -> SyncResponse {
        SyncResponse {
            success: true,
            timestamp: Some(self.read_stamp()),
            data: Some(Value::Object(Default::default())),
            ..SyncResponse::default()
        }
    }

    pub fn cycle_status(&mut self, route_id: &str) -> Result<RouteStatus, StoreError> {
        let current = self
            .routes
            .get(route_id)
            .map(|route| route.status)
            .ok_or_else(|| StoreError::RouteNotFound(route_id.to_string()))?;
        let next = current.next();
        self.set_status(route_id, next)?;
        Ok(next)
    }

    /// Last write wins; a ready route always has its guide present.
    pub fn set_status(&mut self, route_id: &str, status: RouteStatus) -> Result<(), StoreError> {
        if !self.routes.contains_key(route_id) {
            return Err(StoreError::RouteNotFound(route_id.to_string()));
        }
        let stamp = self.write_stamp();
        if let Some(route) = self.routes.get_mut(route_id) {
            route.status = status;
            route.updated_at_ms = stamp;
            if status.is_ready() {
                route.guide_present = true;
            }
        }
        Ok(())
    }

    /// Returns how many of `route_ids` existed and were updated.
    pub fn bulk_update(&mut self, route_ids: &[String], status: RouteStatus) -> usize {
        route_ids
            .iter()
            .filter(|id| self.set_status(id, status).is_ok())
            .count()
    }

    pub fn create_route(
        &mut self,
        route_number: &str,
        school: &str,
    ) -> Result<RouteRecord, StoreError> {
        let route_number = route_number.trim();
        if route_number.is_empty() {
            return Err(StoreError::Invalid("route number is required".to_string()));
        }
        if self
            .routes
            .values()
            .any(|route| route.route_number == route_number && route.school == school.trim())
        {
            return Err(StoreError::DuplicateRoute(route_number.to_string()));
        }
        let mut id = format!("r{}", self.next_route_seq);
        while self.routes.contains_key(&id) {
            self.next_route_seq += 1;
            id = format!("r{}", self.next_route_seq);
        }
        self.next_route_seq += 1;
        let stamp = self.write_stamp();
        let route = RouteRecord {
            id: id.clone(),
            route_number: route_number.to_string(),
            school: school.trim().to_string(),
            status: RouteStatus::NotPresent,
            guide_present: false,
            updated_at_ms: stamp,
        };
        self.routes.insert(id, route.clone());
        self.routes_membership_at = stamp;
        Ok(route)
    }

    /// Removes a route and unassigns its students.
    pub fn delete_route(&mut self, route_id: &str) -> Result<RouteRecord, StoreError> {
        let route = self
            .routes
            .remove(route_id)
            .ok_or_else(|| StoreError::RouteNotFound(route_id.to_string()))?;
        let mut unassigned = false;
        for student in self.students.values_mut() {
            if student.route_id.as_deref() == Some(route_id) {
                student.route_id = None;
                unassigned = true;
            }
        }
        let stamp = self.write_stamp();
        self.routes_membership_at = stamp;
        if unassigned {
            self.students_membership_at = stamp;
        }
        Ok(route)
    }

    /// Bulk student upload. Blank names are skipped; returns how many were added.
    pub fn add_students(&mut self, names: &[String], route_id: Option<&str>) -> Result<usize, StoreError> {
        if let Some(route_id) = route_id {
            if !self.routes.contains_key(route_id) {
                return Err(StoreError::RouteNotFound(route_id.to_string()));
            }
        }
        let mut added = 0;
        for name in names.iter().map(|name| name.trim()).filter(|name| !name.is_empty()) {
            let mut id = format!("s{}", self.next_student_seq);
            while self.students.contains_key(&id) {
                self.next_student_seq += 1;
                id = format!("s{}", self.next_student_seq);
            }
            self.next_student_seq += 1;
            self.students.insert(
                id.clone(),
                StudentRecord {
                    id,
                    name: name.to_string(),
                    route_id: route_id.map(str::to_string),
                },
            );
            added += 1;
        }
        if added > 0 {
            self.students_membership_at = self.write_stamp();
        }
        Ok(added)
    }

    pub fn route_rows(&self) -> Vec<RowNode> {
        let mut routes: Vec<_> = self.routes.values().collect();
        routes.sort_by(|a, b| {
            a.school
                .cmp(&b.school)
                .then_with(|| a.route_number.cmp(&b.route_number))
        });
        routes
            .into_iter()
            .map(|route| {
                RowNode::new(
                    route.id.clone(),
                    vec![
                        route.route_number.clone(),
                        route.school.clone(),
                        if route.guide_present { "Present" } else { "Absent" }.to_string(),
                    ],
                    Some(route.status),
                )
            })
            .collect()
    }

    pub fn student_rows(&self) -> Vec<RowNode> {
        let mut students: Vec<_> = self.students.values().collect();
        students.sort_by(|a, b| a.name.cmp(&b.name));
        students
            .into_iter()
            .map(|student| {
                let route = student
                    .route_id
                    .as_deref()
                    .and_then(|id| self.routes.get(id))
                    .map(|route| route.route_number.clone())
                    .unwrap_or_else(|| "Unassigned".to_string());
                RowNode::new(student.id.clone(), vec![student.name.clone(), route], None)
            })
            .collect()
    }
}
