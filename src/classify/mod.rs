//! Node classification: surgical edits to `<nodes_dir>/<node>.yaml`,
//! committed and pushed to the nodes repository, then followed through the
//! webhook and deploy the push sets off.

mod error;
mod git;
mod listing;
mod node_config;
mod orchestrator;

pub use error::ClassifyError;
pub use git::{Author, GitCli, NodesRepository};
pub use listing::{EnvironmentsMsg, ListingStatus, RolesMsg};
pub use node_config::NodeConfig;
pub use orchestrator::{ClassificationOrchestrator, ClassifierSettings, ClassifyRequest, NodeConfigResult};
