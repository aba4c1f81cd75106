use std::sync::Arc;
use std::time::Instant;

use crate::certsign::SigningQueue;
use crate::classify::ClassificationOrchestrator;
use crate::config::{Config, ExecListener};
use crate::error::ApiError;
use crate::events::EventBus;
use crate::exec::ExecDispatcher;
use crate::logbuf::LogBuffer;
use crate::notifications::Notifier;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub signer: Arc<SigningQueue>,
    pub exec: Arc<ExecDispatcher>,
    pub classifier: Option<Arc<ClassificationOrchestrator>>,
    pub bus: EventBus,
    pub notifier: Notifier,
    pub log: LogBuffer,
    /// Resolved webhook listeners, standard r10k one included.
    pub listeners: Arc<Vec<ExecListener>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn classifier(&self) -> Result<&ClassificationOrchestrator, ApiError> {
        self.classifier
            .as_deref()
            .ok_or_else(|| ApiError::ServiceUnavailable("node classification is not configured".into()))
    }
}
