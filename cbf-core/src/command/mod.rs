//! Per-device command bookkeeping.

pub mod tracker;

pub use tracker::{
    CommandEvent, CommandId, CommandRecord, CommandResult, CommandTracker,
    Submission,
};
