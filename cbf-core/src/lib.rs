//! Control core for the correlator/beamformer.
//!
//! Splits a requested frequency window across frequency slice processors,
//! builds per-processor configuration payloads, and drives every allocated
//! resource through the observation life cycle while tracking the remote
//! commands issued on its behalf.
#![allow(missing_docs)]

pub mod assignment;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod gain;
pub mod interface;
pub mod manager;
pub mod observation;
pub mod resources;
pub mod spectrum;

pub use assignment::{
    Assignment, AssignmentBuilder, PoolChange, PoolSnapshot, ResourcePool,
    ScanRequest, UnitAssignment,
};
pub use command::{
    CommandEvent, CommandId, CommandRecord, CommandTracker, Submission,
};
pub use config::ControllerConfig;
pub use device::{ObservingDevice, ResourceState};
pub use error::{CbfError, Result};
pub use gain::RippleCorrection;
pub use interface::{InterfaceValidator, validate_interface};
pub use manager::{
    BatchCall, BatchOutcome, ComponentManager, LinkHealth, ProxyCommand,
    RemoteReply, ResourceProxy,
};
pub use observation::{ObsStateMachine, ObsTrigger};
pub use resources::{LocalChannelizer, LocalProcessingUnit};
pub use spectrum::{
    CoarseChannelTable, FrequencySlice, PartitionRequest, SpectrumPartitioner,
    get_coarse_channels, partition_spectrum,
};
