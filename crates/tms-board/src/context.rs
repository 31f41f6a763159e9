//! Per-page sync context.
//!
//! One `PageContext` exists per open board page. It owns everything the
//! background sync touches for that page: the rendered document, the local
//! change guards, the patcher, the connection indicator and the poller.
//! Nothing here is shared between pages or devices; the hub is the only
//! shared state.

use crate::poller::{FetchResult, PollOutcome, Poller};
use crate::transport::SyncTransport;
use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tms_core::clock::Clock;
use tms_core::guard::{ActivityGuard, ChangeGuard};
use tms_core::indicator::ConnectionIndicator;
use tms_core::patcher::{PatchOutcome, ViewPatcher};
use tms_core::sync_contracts::{CycleStatusResponse, SyncDomain, SyncError};
use tms_core::view::{
    apply_view, extract_table_body, render_row, BoardDocument, ReloadReason, RowNode,
};
use tms_core::RouteStatus;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long the table stays faded before refreshed rows are swapped in.
pub const FADE_DELAY_MS: i64 = 150;
pub const LAST_USER_ACTION_FILE: &str = "last_user_action.json";

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("page {0} does not show live data")]
    NotLive(String),
    #[error("no row for route {0}")]
    UnknownRow(String),
    #[error("page has no csrf token")]
    MissingCsrf,
    #[error("change rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Page fetch handed to a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFetch {
    Reload(ReloadReason),
    Refresh,
}

/// A status change already shown on the board and waiting for the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCycle {
    pub route_id: String,
    pub previous: RouteStatus,
    pub optimistic: RouteStatus,
}

/// Completion of background work started by the page.
#[derive(Debug)]
pub enum PageEvent {
    PageFetched {
        fetch: PageFetch,
        result: Result<String, SyncError>,
    },
    CycleSettled {
        pending: PendingCycle,
        result: Result<CycleStatusResponse, SyncError>,
    },
}

/// Whatever woke the page up next.
#[derive(Debug)]
pub enum PageSignal {
    Poll(FetchResult),
    Page(PageEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// A fresh copy of the page replaced the document.
    Reloaded(ReloadReason),
    /// The fetched copy was unusable; a full reload was started instead.
    ReloadRequested(ReloadReason),
    /// Fresh rows are waiting behind the fade.
    RefreshStaged,
    /// The hub confirmed a status change.
    Cycled(RouteStatus),
}

#[derive(Debug, Clone)]
struct StagedRefresh {
    rows: Vec<RowNode>,
    csrf_token: Option<String>,
    swap_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub route_id: String,
    pub message: String,
    pub at_ms: i64,
}

/// Where the `lastUserAction` marker lives between sessions.
#[derive(Debug, Clone, Default)]
pub struct ActivityStore {
    path: Option<PathBuf>,
}

impl ActivityStore {
    pub fn in_dir(state_dir: &Path) -> Self {
        Self {
            path: Some(state_dir.join(LAST_USER_ACTION_FILE)),
        }
    }

    /// Keeps the marker in memory only.
    pub fn ephemeral() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// A missing or unreadable file reads as "no recent action".
    pub fn load(&self) -> ActivityGuard {
        let Some(path) = &self.path else {
            return ActivityGuard::default();
        };
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return ActivityGuard::default(),
            Err(err) => {
                warn!(event = "activity_load_failed", path = %path.display(), error = %err);
                return ActivityGuard::default();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(event = "activity_parse_failed", path = %path.display(), error = %err);
            ActivityGuard::default()
        })
    }

    pub fn save(&self, activity: &ActivityGuard) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_vec(activity).map_err(io::Error::other)?;
        std::fs::write(path, raw)
    }
}

pub struct PageContext {
    page: String,
    domain: Option<SyncDomain>,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn SyncTransport>,
    document: BoardDocument,
    changes: ChangeGuard,
    activity: ActivityGuard,
    activity_store: ActivityStore,
    patcher: ViewPatcher,
    indicator: ConnectionIndicator,
    poller: Option<Poller>,
    csrf_token: Option<String>,
    notifications: Vec<Notification>,
    events_tx: mpsc::Sender<PageEvent>,
    events_rx: mpsc::Receiver<PageEvent>,
    page_fetch: Option<PageFetch>,
    refresh_queued: bool,
    staged: Option<StagedRefresh>,
    reloads: u64,
}

impl PageContext {
    /// `interval_ms` overrides the domain's default poll spacing. Pages
    /// outside the live domains get no poller at all.
    pub fn new(
        page: &str,
        interval_ms: Option<u64>,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn SyncTransport>,
        activity_store: ActivityStore,
    ) -> Self {
        let domain = SyncDomain::for_page(page);
        let poller = domain.map(|domain| {
            let interval = interval_ms.unwrap_or_else(|| domain.default_interval_ms());
            Poller::new(domain, interval, transport.clone())
        });
        let activity = activity_store.load();
        let (events_tx, events_rx) = mpsc::channel(16);
        Self {
            page: page.to_string(),
            domain,
            clock,
            transport,
            document: BoardDocument::default(),
            changes: ChangeGuard::default(),
            activity,
            activity_store,
            patcher: ViewPatcher::new(),
            indicator: ConnectionIndicator::default(),
            poller,
            csrf_token: None,
            notifications: Vec::new(),
            events_tx,
            events_rx,
            page_fetch: None,
            refresh_queued: false,
            staged: None,
            reloads: 0,
        }
    }

    pub fn page(&self) -> &str {
        &self.page
    }

    pub fn domain(&self) -> Option<SyncDomain> {
        self.domain
    }

    pub fn is_live(&self) -> bool {
        self.poller.is_some()
    }

    pub fn document(&self) -> &BoardDocument {
        &self.document
    }

    pub fn indicator(&self) -> &ConnectionIndicator {
        &self.indicator
    }

    pub fn poller(&self) -> Option<&Poller> {
        self.poller.as_ref()
    }

    pub fn change_guard(&self) -> &ChangeGuard {
        &self.changes
    }

    pub fn activity(&self) -> &ActivityGuard {
        &self.activity
    }

    pub fn patcher(&self) -> &ViewPatcher {
        &self.patcher
    }

    pub fn csrf_token(&self) -> Option<&str> {
        self.csrf_token.as_deref()
    }

    pub fn reloads(&self) -> u64 {
        self.reloads
    }

    /// The page fetch currently running in the background, if any.
    pub fn page_fetch(&self) -> Option<PageFetch> {
        self.page_fetch
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    pub fn start(&mut self) -> bool {
        let now = self.clock.now_ms();
        self.poller
            .as_mut()
            .map(|poller| poller.start(now))
            .unwrap_or(false)
    }

    pub fn stop(&mut self) -> bool {
        self.poller
            .as_mut()
            .map(|poller| poller.stop())
            .unwrap_or(false)
    }

    /// Drives timers: dispatches a due fetch, finishes a fade whose delay is
    /// over, hides a stale "Connected" and drops expired guard entries.
    /// Returns true when something visible changed.
    pub fn tick(&mut self) -> bool {
        let now = self.clock.now_ms();
        let hidden = self.indicator.tick(now);
        let swapped = self.finish_content_refresh(now);
        self.changes.sweep(now);
        let dispatched = self
            .poller
            .as_mut()
            .map(|poller| poller.tick(now))
            .unwrap_or(false);
        hidden || swapped || dispatched
    }

    /// Waits for the next settled poll or finished background task. Never
    /// resolves on a page with nothing running.
    pub async fn next_signal(&mut self) -> PageSignal {
        let poller = self.poller.as_mut();
        let events = &mut self.events_rx;
        let poll = async move {
            match poller {
                Some(poller) => poller.next_result().await,
                None => None,
            }
        };
        tokio::select! {
            Some(result) = poll => PageSignal::Poll(result),
            Some(event) = events.recv() => PageSignal::Page(event),
            else => std::future::pending().await,
        }
    }

    /// Fetches the page and rebuilds the document from it. Used for the
    /// first load, before anything is drawn.
    pub async fn load_page(&mut self) -> Result<(), ContextError> {
        let Some(domain) = self.domain else {
            return Err(ContextError::NotLive(self.page.clone()));
        };
        let html = self.transport.fetch_page(domain).await?;
        self.apply_page(domain, &html);
        Ok(())
    }

    /// First load of the page, then polling. A failed load leaves a reload
    /// pending so the page recovers once the hub answers again.
    pub async fn open(&mut self) -> Result<(), ContextError> {
        let loaded = self.load_page().await;
        if loaded.is_err() {
            self.document.request_reload(ReloadReason::TableMissing);
        }
        self.start();
        loaded
    }

    /// Marks the page for reload and fetches a fresh copy in the background.
    /// The reload stays pending until a copy arrives; a failed fetch is
    /// retried after the next successful poll.
    pub fn full_reload(&mut self, reason: ReloadReason) -> bool {
        self.document.request_reload(reason);
        info!(event = "full_reload", page = %self.page, reason = reason.as_str());
        self.dispatch_page_fetch(PageFetch::Reload(reason))
    }

    /// Fetches a fresh copy of the page whose rows are swapped in behind a
    /// short fade. A refresh asked for while another fetch runs is queued.
    pub fn content_refresh(&mut self) -> bool {
        if self.dispatch_page_fetch(PageFetch::Refresh) {
            return true;
        }
        if self.domain.is_some() {
            self.refresh_queued = true;
        }
        false
    }

    /// Swaps staged rows in once the fade delay has passed.
    pub fn finish_content_refresh(&mut self, now_ms: i64) -> bool {
        if !matches!(&self.staged, Some(staged) if now_ms >= staged.swap_at_ms) {
            return false;
        }
        let Some(staged) = self.staged.take() else {
            return false;
        };
        self.document.swap_rows(&staged.rows);
        let attached = self.document.attach_row_listeners();
        self.document.end_fade();
        if let Some(token) = staged.csrf_token {
            self.csrf_token = Some(token);
        }
        debug!(event = "content_refresh", page = %self.page, rows = attached);
        true
    }

    /// Feeds one settled fetch through validation, the indicator and the
    /// patcher. Returns what the patcher decided, or `None` when the result
    /// carried no usable payload.
    pub fn handle_poll_result(&mut self, result: FetchResult) -> Option<PatchOutcome> {
        let now = self.clock.now_ms();
        let poller = self.poller.as_mut()?;
        let payload = match poller.on_result(result, now) {
            PollOutcome::Payload(payload) => payload,
            PollOutcome::Disconnected(_) => {
                self.indicator.on_failure();
                return None;
            }
            PollOutcome::Malformed(_) | PollOutcome::Discarded => return None,
        };
        self.indicator.on_success(now);

        if let Some(reason) = self.document.pending_reload() {
            if self.page_fetch.is_none() && self.dispatch_page_fetch(PageFetch::Reload(reason)) {
                info!(event = "full_reload_retry", page = %self.page, reason = reason.as_str());
                return Some(PatchOutcome::FullReload(reason));
            }
        }

        let outcome = self
            .patcher
            .apply(&mut self.document, &payload, &self.changes, now);
        match &outcome {
            PatchOutcome::FullReload(reason) => {
                self.full_reload(*reason);
            }
            PatchOutcome::ContentRefresh => {
                self.content_refresh();
            }
            PatchOutcome::Patched(report) => {
                if !report.guarded.is_empty() {
                    debug!(event = "deltas_guarded", count = report.guarded.len());
                }
                self.notify_ready(&report.became_ready, now);
            }
            PatchOutcome::NoOp => {}
        }
        Some(outcome)
    }

    /// Applies the result of a background page fetch or status write.
    pub fn handle_event(&mut self, event: PageEvent) -> Result<EventOutcome, ContextError> {
        match event {
            PageEvent::PageFetched { fetch, result } => {
                self.page_fetch = None;
                let outcome = self.finish_page_fetch(fetch, result);
                if outcome.is_ok() {
                    self.resume_page_work();
                }
                outcome
            }
            PageEvent::CycleSettled { pending, result } => self.finish_cycle(pending, result),
        }
    }

    /// Advances a route one step. The row changes and the route is guarded
    /// against stale polls right away; the write to the hub runs in the
    /// background and settles through `handle_event`.
    pub fn cycle_route(&mut self, route_id: &str) -> Result<RouteStatus, ContextError> {
        let now = self.clock.now_ms();
        let token = self.csrf_token.clone().ok_or(ContextError::MissingCsrf)?;
        let previous = self
            .document
            .body()
            .and_then(|body| body.row(route_id))
            .map(|row| row.status().unwrap_or_default())
            .ok_or_else(|| ContextError::UnknownRow(route_id.to_string()))?;
        let optimistic = previous.next();
        self.show_status(route_id, optimistic);
        self.changes.mark_changed(route_id, now);
        self.activity.touch(now);
        if let Err(err) = self.activity_store.save(&self.activity) {
            warn!(event = "activity_persist_failed", error = %err);
        }

        let pending = PendingCycle {
            route_id: route_id.to_string(),
            previous,
            optimistic,
        };
        let transport = self.transport.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = transport.cycle_status(&pending.route_id, &token).await;
            let _ = tx.send(PageEvent::CycleSettled { pending, result }).await;
        });
        Ok(optimistic)
    }

    fn finish_cycle(
        &mut self,
        pending: PendingCycle,
        result: Result<CycleStatusResponse, SyncError>,
    ) -> Result<EventOutcome, ContextError> {
        let route_id = pending.route_id.as_str();
        match result {
            Ok(CycleStatusResponse {
                success: true,
                status,
                ..
            }) => {
                let confirmed = status.unwrap_or(pending.optimistic);
                if confirmed != pending.optimistic {
                    self.show_status(route_id, confirmed);
                }
                info!(event = "route_cycled", route_id, status = %confirmed);
                Ok(EventOutcome::Cycled(confirmed))
            }
            Ok(response) => {
                self.show_status(route_id, pending.previous);
                let message = response
                    .message
                    .unwrap_or_else(|| "Status change failed".to_string());
                warn!(event = "cycle_rejected", route_id, message = %message);
                Err(ContextError::Rejected(message))
            }
            Err(err) => {
                self.show_status(route_id, pending.previous);
                warn!(event = "cycle_failed", route_id, error = %err);
                Err(err.into())
            }
        }
    }

    fn dispatch_page_fetch(&mut self, fetch: PageFetch) -> bool {
        let Some(domain) = self.domain else {
            return false;
        };
        if self.page_fetch.is_some() {
            return false;
        }
        self.page_fetch = Some(fetch);
        let transport = self.transport.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = transport.fetch_page(domain).await;
            let _ = tx.send(PageEvent::PageFetched { fetch, result }).await;
        });
        true
    }

    fn finish_page_fetch(
        &mut self,
        fetch: PageFetch,
        result: Result<String, SyncError>,
    ) -> Result<EventOutcome, ContextError> {
        let Some(domain) = self.domain else {
            return Err(ContextError::NotLive(self.page.clone()));
        };
        match (fetch, result) {
            (PageFetch::Reload(reason), Ok(html)) => {
                self.apply_page(domain, &html);
                self.reloads += 1;
                Ok(EventOutcome::Reloaded(reason))
            }
            (PageFetch::Reload(reason), Err(err)) => {
                self.document.request_reload(reason);
                warn!(event = "full_reload_failed", page = %self.page, error = %err);
                Err(err.into())
            }
            (PageFetch::Refresh, Ok(html)) => {
                let Some(fresh) = extract_table_body(&html, domain.table_body_id()) else {
                    self.full_reload(ReloadReason::RefreshBodyMissing);
                    return Ok(EventOutcome::ReloadRequested(ReloadReason::RefreshBodyMissing));
                };
                if self.document.body().is_none() {
                    self.full_reload(ReloadReason::TableMissing);
                    return Ok(EventOutcome::ReloadRequested(ReloadReason::TableMissing));
                }
                self.document.begin_fade();
                self.staged = Some(StagedRefresh {
                    rows: fresh.rows,
                    csrf_token: extract_csrf_token(&html),
                    swap_at_ms: self.clock.now_ms() + FADE_DELAY_MS,
                });
                Ok(EventOutcome::RefreshStaged)
            }
            (PageFetch::Refresh, Err(err)) => {
                // The poll that asked for this already moved the cursor past
                // the change, so only a reload can bring the rows back.
                self.document.request_reload(ReloadReason::RefreshFailed);
                warn!(event = "content_refresh_failed", page = %self.page, error = %err);
                Err(err.into())
            }
        }
    }

    /// Starts whatever page work piled up while a fetch was running.
    fn resume_page_work(&mut self) {
        if let Some(reason) = self.document.pending_reload() {
            self.refresh_queued = false;
            self.dispatch_page_fetch(PageFetch::Reload(reason));
        } else if self.refresh_queued {
            self.refresh_queued = false;
            self.dispatch_page_fetch(PageFetch::Refresh);
        }
    }

    /// Rebuilds the document from a rendered page and rewinds the cursor to
    /// the stamp the page was rendered at.
    fn apply_page(&mut self, domain: SyncDomain, html: &str) {
        self.csrf_token = extract_csrf_token(html);
        self.document = match extract_table_body(html, domain.table_body_id()) {
            Some(body) => BoardDocument::new(body),
            None => {
                warn!(event = "table_body_missing", page = %self.page, id = domain.table_body_id());
                BoardDocument::default()
            }
        };
        self.staged = None;
        self.refresh_queued = false;
        let attached = self.document.attach_row_listeners();
        let stamp = extract_sync_stamp(html).unwrap_or(0);
        if let Some(poller) = self.poller.as_mut() {
            poller.reset_cursor(stamp);
        }
        info!(event = "page_loaded", page = %self.page, rows = attached, stamp);
    }

    fn show_status(&mut self, route_id: &str, status: RouteStatus) {
        if let Some(row) = self
            .document
            .body_mut()
            .and_then(|body| body.row_mut(route_id))
        {
            apply_view(row, &render_row(status));
        }
    }

    fn notify_ready(&mut self, route_ids: &[String], now: i64) {
        if route_ids.is_empty() {
            return;
        }
        if self.activity.suppresses_notifications(now) {
            debug!(event = "notifications_suppressed", count = route_ids.len());
            return;
        }
        for route_id in route_ids {
            let name = self
                .document
                .body()
                .and_then(|body| body.row(route_id))
                .and_then(|row| row.cells.first().cloned())
                .unwrap_or_else(|| route_id.clone());
            self.notifications.push(Notification {
                route_id: route_id.clone(),
                message: format!("Route {name} is ready"),
                at_ms: now,
            });
        }
    }
}

/// Reads `<meta name="csrf-token" content="...">` from a rendered page.
pub fn extract_csrf_token(html: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#"<meta\s+name="csrf-token"\s+content="([^"]*)""#).expect("valid regex")
    });
    re.captures(html)
        .and_then(|captures| captures.get(1))
        .map(|token| token.as_str().to_string())
        .filter(|token| !token.is_empty())
}

/// Reads `<meta name="sync-stamp" content="...">`, the store stamp a page
/// was rendered at.
pub fn extract_sync_stamp(html: &str) -> Option<i64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#"<meta\s+name="sync-stamp"\s+content="(\d+)""#).expect("valid regex")
    });
    re.captures(html)
        .and_then(|captures| captures.get(1))
        .and_then(|stamp| stamp.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tms_core::guard::GUARD_WINDOW_MS;

    #[test]
    fn csrf_token_is_read_from_meta_tag() {
        let html = r#"<head><meta name="csrf-token" content="abc123"></head>"#;
        assert_eq!(extract_csrf_token(html).as_deref(), Some("abc123"));
        assert_eq!(extract_csrf_token("<head></head>"), None);
        assert_eq!(
            extract_csrf_token(r#"<meta name="csrf-token" content="">"#),
            None
        );
    }

    #[test]
    fn sync_stamp_is_read_from_meta_tag() {
        let html = r#"<head><meta name="sync-stamp" content="1712000000123"></head>"#;
        assert_eq!(extract_sync_stamp(html), Some(1_712_000_000_123));
        assert_eq!(extract_sync_stamp(r#"<meta name="sync-stamp" content="soon">"#), None);
        assert_eq!(extract_sync_stamp("<head></head>"), None);
    }

    #[test]
    fn activity_marker_round_trips_through_state_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ActivityStore::in_dir(&dir.path().join("nested"));
        assert_eq!(store.load().last_user_action(), None);

        let mut activity = ActivityGuard::default();
        activity.touch(42_000);
        store.save(&activity).expect("save");

        let raw = std::fs::read_to_string(store.path().expect("path")).expect("read");
        assert_eq!(raw, r#"{"lastUserAction":42000}"#);
        let loaded = store.load();
        assert_eq!(loaded.last_user_action(), Some(42_000));
        assert!(loaded.suppresses_notifications(42_000 + GUARD_WINDOW_MS - 1));
    }

    #[test]
    fn corrupt_activity_file_reads_as_idle() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(LAST_USER_ACTION_FILE), "{not json").expect("write");
        let store = ActivityStore::in_dir(dir.path());
        assert_eq!(store.load().last_user_action(), None);
    }

    #[test]
    fn ephemeral_store_never_touches_disk() {
        let store = ActivityStore::ephemeral();
        assert!(store.path().is_none());
        assert!(store.save(&ActivityGuard::default()).is_ok());
    }
}
