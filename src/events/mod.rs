//! Fan-in of webhook and exec completions, routed to whichever
//! classification waiters are currently tracking them.

mod bus;

pub use bus::{BusSnapshot, CommitWait, Correlation, EventBus, UuidWait};

use serde::Serialize;

/// A GitHub event accepted by a webhook listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookResult {
    pub event: String,
    pub commit_ids: Vec<String>,
    /// Correlation id handed to the exec task the listener started.
    pub correlation_id: String,
}
