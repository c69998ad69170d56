//! Resource pool and scan assignment.

pub mod builder;
pub mod modes;
pub mod pool;
pub mod request;

pub use builder::{
    Assignment, AssignmentBuilder, FspConfiguration, PreparedAssignment,
    UnitAssignment,
};
pub use modes::{ModePayload, SearchBeam, TimingBeam, VlbiBeam};
pub use pool::{FspRecord, PoolChange, PoolSnapshot, ResourcePool};
pub use request::ScanRequest;
