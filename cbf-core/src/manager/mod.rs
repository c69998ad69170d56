//! Links to subordinate resources and batched remote dispatch.

pub mod component_manager;
pub mod health;
pub mod proxy;

pub use component_manager::{
    BatchCall, BatchOutcome, ComponentManager, FaultCallback, StatusCallback,
};
pub use health::LinkHealth;
pub use proxy::{ProxyCommand, RemoteReply, ResourceProxy};
