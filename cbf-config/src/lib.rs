//! Configuration loading for the correlator/beamformer control core.
//!
//! Resolves a [`ControllerConfig`] from a file, an inline JSON variable, or
//! the built-in defaults, then runs the guard rails in [`validation`]. The
//! `cbf-plan` binary uses the same loader so offline plans see the exact
//! settings a running controller would.
#![allow(missing_docs)]

pub mod loader;
pub mod plan;
pub mod validation;

pub use cbf_core::ControllerConfig;
pub use loader::{ConfigSource, ControllerSettings};
pub use plan::{PartitionPlan, PlannedUnit, ValidationVerdict};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
