pub mod agent;
pub mod capability;
pub mod event;
pub mod render;
pub mod report;
pub mod task;

pub use agent::*;
pub use capability::*;
pub use event::*;
pub use render::*;
pub use report::*;
pub use task::*;

/// Identifier of an agent record. Freshly minted ids are UUID v4 strings.
pub type AgentId = String;

/// Identifier of a task record.
pub type TaskId = String;

/// Identifier scoping one coordination session; every entity belongs to
/// exactly one workspace and is discarded with it.
pub type WorkspaceId = String;

/// Mint a fresh entity id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
