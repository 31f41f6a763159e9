use crate::transport::SyncTransport;
use std::sync::Arc;
use tms_core::cursor::SyncCursor;
use tms_core::schedule::PollSchedule;
use tms_core::sync_contracts::{parse_sync_body, SyncDomain, SyncError, SyncPayload};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type FetchResult = Result<String, SyncError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Valid payload; the cursor has already moved to its timestamp.
    Payload(SyncPayload),
    /// Network failure or an explicit `success: false`.
    Disconnected(SyncError),
    /// Unusable body. Nothing changes, not even the connection state.
    Malformed(SyncError),
    /// Arrived after `stop()`.
    Discarded,
}

/// Drives one page's sync loop.
///
/// Fetches run on spawned tasks and report back over a channel; the owner
/// feeds each result into `on_result`, which is the only place the cursor
/// advances.
pub struct Poller {
    domain: SyncDomain,
    schedule: PollSchedule,
    cursor: SyncCursor,
    transport: Arc<dyn SyncTransport>,
    results_tx: mpsc::Sender<FetchResult>,
    results_rx: mpsc::Receiver<FetchResult>,
    fetches_started: u64,
}

impl Poller {
    pub fn new(domain: SyncDomain, interval_ms: u64, transport: Arc<dyn SyncTransport>) -> Self {
        let (results_tx, results_rx) = mpsc::channel(4);
        Self {
            domain,
            schedule: PollSchedule::new(interval_ms),
            cursor: SyncCursor::new(),
            transport,
            results_tx,
            results_rx,
            fetches_started: 0,
        }
    }

    pub fn domain(&self) -> SyncDomain {
        self.domain
    }

    pub fn last_update(&self) -> i64 {
        self.cursor.last_update()
    }

    pub fn is_running(&self) -> bool {
        self.schedule.is_running()
    }

    pub fn in_flight(&self) -> bool {
        self.schedule.in_flight()
    }

    pub fn next_due(&self) -> Option<i64> {
        self.schedule.next_due()
    }

    pub fn fetches_started(&self) -> u64 {
        self.fetches_started
    }

    /// Idempotent; a second call while running changes nothing.
    pub fn start(&mut self, now_ms: i64) -> bool {
        let started = self.schedule.start(now_ms);
        if started {
            debug!(event = "poll_start", domain = %self.domain, interval_ms = self.schedule.interval_ms());
        }
        started
    }

    pub fn stop(&mut self) -> bool {
        let stopped = self.schedule.stop();
        if stopped {
            debug!(event = "poll_stop", domain = %self.domain);
        }
        stopped
    }

    /// Rewinds to the stamp of a freshly loaded page, or 0 when the page
    /// carried none.
    pub fn reset_cursor(&mut self, stamp: i64) {
        self.cursor.reset_to(stamp);
    }

    /// Dispatches a fetch when one is due. Returns true when a fetch started.
    pub fn tick(&mut self, now_ms: i64) -> bool {
        if !self.schedule.begin_fetch(now_ms) {
            return false;
        }
        self.fetches_started += 1;
        let transport = self.transport.clone();
        let tx = self.results_tx.clone();
        let domain = self.domain;
        let last_update = self.cursor.last_update();
        tokio::spawn(async move {
            let result = transport.fetch_sync(domain, last_update).await;
            let _ = tx.send(result).await;
        });
        true
    }

    pub async fn next_result(&mut self) -> Option<FetchResult> {
        self.results_rx.recv().await
    }

    pub fn on_result(&mut self, result: FetchResult, now_ms: i64) -> PollOutcome {
        let settled = self.schedule.settle(now_ms);
        if !settled.apply {
            debug!(event = "poll_discarded", domain = %self.domain);
            return PollOutcome::Discarded;
        }
        let body = match result {
            Ok(body) => body,
            Err(err) => {
                warn!(event = "poll_failed", domain = %self.domain, error = %err);
                return PollOutcome::Disconnected(err);
            }
        };
        match parse_sync_body(self.domain, &body) {
            Ok(payload) => {
                self.cursor.advance_to(payload.timestamp());
                PollOutcome::Payload(payload)
            }
            Err(err) if err.marks_disconnected() => {
                warn!(event = "poll_rejected", domain = %self.domain, error = %err);
                PollOutcome::Disconnected(err)
            }
            Err(err) => {
                warn!(event = "poll_malformed", domain = %self.domain, error = %err);
                PollOutcome::Malformed(err)
            }
        }
    }
}
