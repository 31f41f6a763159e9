use crate::guard::ChangeGuard;
use crate::sync_contracts::SyncPayload;
use crate::view::{apply_view, render_row, BoardDocument, ReloadReason};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub applied: Vec<String>,
    pub unchanged: Vec<String>,
    /// Skipped because of a recent local change; re-evaluated next poll.
    pub guarded: Vec<String>,
    /// No rendered row for the key; skipped without error.
    pub missing: Vec<String>,
    /// Rows that turned `ready` through this patch.
    pub became_ready: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    FullReload(ReloadReason),
    ContentRefresh,
    Patched(PatchReport),
    NoOp,
}

/// Reconciles a board document with one sync payload.
#[derive(Debug, Clone, Default)]
pub struct ViewPatcher {
    rows_patched: u64,
    deltas_guarded: u64,
}

impl ViewPatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows_patched(&self) -> u64 {
        self.rows_patched
    }

    pub fn deltas_guarded(&self) -> u64 {
        self.deltas_guarded
    }

    pub fn apply(
        &mut self,
        doc: &mut BoardDocument,
        payload: &SyncPayload,
        guard: &ChangeGuard,
        now_ms: i64,
    ) -> PatchOutcome {
        match payload {
            SyncPayload::Routes {
                routes_updated: true,
                ..
            } => {
                doc.request_reload(ReloadReason::MembershipChanged);
                PatchOutcome::FullReload(ReloadReason::MembershipChanged)
            }
            SyncPayload::Routes {
                routes: Some(deltas),
                ..
            } if !deltas.is_empty() => {
                if doc.body().is_none() {
                    doc.request_reload(ReloadReason::TableMissing);
                    return PatchOutcome::FullReload(ReloadReason::TableMissing);
                }
                let Some(body) = doc.body_mut() else {
                    return PatchOutcome::NoOp;
                };
                let mut report = PatchReport::default();
                for delta in deltas {
                    if guard.is_guarded(&delta.route_id, now_ms) {
                        report.guarded.push(delta.route_id.clone());
                        continue;
                    }
                    let Some(row) = body.row_mut(&delta.route_id) else {
                        report.missing.push(delta.route_id.clone());
                        continue;
                    };
                    let previous = row.status();
                    let view = render_row(delta.status);
                    if apply_view(row, &view) {
                        if delta.status.is_ready() && previous != Some(delta.status) {
                            report.became_ready.push(delta.route_id.clone());
                        }
                        report.applied.push(delta.route_id.clone());
                    } else {
                        report.unchanged.push(delta.route_id.clone());
                    }
                }
                self.rows_patched += report.applied.len() as u64;
                self.deltas_guarded += report.guarded.len() as u64;
                PatchOutcome::Patched(report)
            }
            SyncPayload::Routes { .. } => PatchOutcome::NoOp,
            SyncPayload::Students {
                needs_refresh: true,
                ..
            } => PatchOutcome::ContentRefresh,
            SyncPayload::Students { .. } => PatchOutcome::NoOp,
        }
    }
}
