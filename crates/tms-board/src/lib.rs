//! Board client for the route-status hub: the HTTP transport, the poll loop
//! and the per-page context that ties them to a rendered board.

pub mod context;
pub mod poller;
pub mod transport;

pub use context::{
    ActivityStore, ContextError, EventOutcome, Notification, PageContext, PageEvent, PageFetch,
    PageSignal, PendingCycle,
};
pub use poller::{FetchResult, PollOutcome, Poller};
pub use transport::{HttpTransport, SyncTransport};
