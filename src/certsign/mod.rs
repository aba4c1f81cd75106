//! Serialized certificate signing and revocation against the puppet CA,
//! with signing deferred until the node's CSR shows up.

mod error;
mod queue;
mod watcher;

pub use error::SignError;
pub use queue::{SignerConfig, SigningAction, SigningQueue, SigningResult};
pub use watcher::CsrEvents;
