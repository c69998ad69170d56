//! Core data model definitions shared across the CBF control crates.
#![allow(missing_docs)]

pub mod command;
pub mod error;
pub mod ids;
pub mod mode;
pub mod state;

// Intentionally curated re-exports for downstream consumers.
pub use command::{CommandStatus, ResultCode};
pub use error::{ModelError, Result as ModelResult};
pub use ids::{FspId, ReceptorId, ScanId, SubarrayId, VccId};
pub use mode::{FrequencyBand, ProcessingMode};
pub use state::{CommunicationStatus, HealthState, ObsState};
