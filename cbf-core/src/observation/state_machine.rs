//! Observation life-cycle state machine.

use std::fmt;

use cbf_model::ObsState;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CbfError, Result};

/// Events that move a device through its observation life cycle.
///
/// Long-running commands come in pairs: the command itself enters the
/// transitional state, its completion leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObsTrigger {
    AssignResources,
    ResourcesAssigned,
    ReleaseResources,
    /// `remaining` is true when the device still holds receptors.
    ResourcesReleased { remaining: bool },
    ConfigureScan,
    ScanConfigured,
    Scan,
    EndScan,
    GoToIdle,
    Abort,
    AbortCompleted,
    ObsReset,
    ObsResetCompleted,
    Restart,
    RestartCompleted,
    /// An unhandled remote failure.
    Fault,
}

impl ObsTrigger {
    pub fn name(&self) -> &'static str {
        match self {
            ObsTrigger::AssignResources => "AssignResources",
            ObsTrigger::ResourcesAssigned => "AssignResourcesCompleted",
            ObsTrigger::ReleaseResources => "ReleaseResources",
            ObsTrigger::ResourcesReleased { .. } => "ReleaseResourcesCompleted",
            ObsTrigger::ConfigureScan => "ConfigureScan",
            ObsTrigger::ScanConfigured => "ConfigureScanCompleted",
            ObsTrigger::Scan => "Scan",
            ObsTrigger::EndScan => "EndScan",
            ObsTrigger::GoToIdle => "GoToIdle",
            ObsTrigger::Abort => "Abort",
            ObsTrigger::AbortCompleted => "AbortCompleted",
            ObsTrigger::ObsReset => "ObsReset",
            ObsTrigger::ObsResetCompleted => "ObsResetCompleted",
            ObsTrigger::Restart => "Restart",
            ObsTrigger::RestartCompleted => "RestartCompleted",
            ObsTrigger::Fault => "Fault",
        }
    }
}

impl fmt::Display for ObsTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Observation state plus the "resources assigned" flag tracked alongside
/// IDLE.
#[derive(Debug, Clone)]
pub struct ObsStateMachine {
    device: String,
    state: ObsState,
    resourced: bool,
}

impl ObsStateMachine {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            state: ObsState::Idle,
            resourced: false,
        }
    }

    pub fn state(&self) -> ObsState {
        self.state
    }

    /// True once AssignResources has completed and until the last receptor
    /// is released or the device restarts.
    pub fn is_resourced(&self) -> bool {
        self.resourced
    }

    /// Record that receptors are held although AssignResources never
    /// completed, so ObsReset lands in resourced IDLE.
    pub fn adopt_resources(&mut self) {
        self.resourced = true;
    }

    fn next(&self, trigger: ObsTrigger) -> Option<(ObsState, bool)> {
        use ObsState::*;

        let resourced = self.resourced;
        match (self.state, trigger) {
            (_, ObsTrigger::Fault) => Some((Fault, resourced)),

            (Idle, ObsTrigger::AssignResources) => Some((Resourcing, resourced)),
            (Idle, ObsTrigger::ReleaseResources) if resourced => {
                Some((Resourcing, resourced))
            }
            (Resourcing, ObsTrigger::ResourcesAssigned) => Some((Idle, true)),
            (Resourcing, ObsTrigger::ResourcesReleased { remaining }) => {
                Some((Idle, remaining))
            }

            (Idle, ObsTrigger::ConfigureScan) if resourced => {
                Some((Configuring, resourced))
            }
            (Configuring, ObsTrigger::ScanConfigured) => Some((Ready, resourced)),

            (Ready, ObsTrigger::Scan) => Some((Scanning, resourced)),
            (Scanning, ObsTrigger::EndScan) => Some((Ready, resourced)),
            (Ready, ObsTrigger::GoToIdle) => Some((Idle, resourced)),

            (
                Resourcing | Configuring | Ready | Scanning,
                ObsTrigger::Abort,
            ) => Some((Aborting, resourced)),
            (Aborting, ObsTrigger::AbortCompleted) => Some((Aborted, resourced)),

            (Aborted | Fault, ObsTrigger::ObsReset | ObsTrigger::Restart) => {
                Some((Resetting, resourced))
            }
            (Resetting, ObsTrigger::ObsResetCompleted) => Some((Idle, resourced)),
            (Resetting, ObsTrigger::RestartCompleted) => Some((Idle, false)),

            _ => None,
        }
    }

    /// Whether `trigger` is legal in the current state.
    pub fn allows(&self, trigger: ObsTrigger) -> bool {
        self.next(trigger).is_some()
    }

    /// Same as [`allows`](Self::allows) but with the error a caller reports.
    pub fn check(&self, trigger: ObsTrigger) -> Result<()> {
        if self.allows(trigger) {
            Ok(())
        } else {
            Err(CbfError::invalid_state(trigger.name(), self.state))
        }
    }

    /// Apply `trigger`. Illegal triggers leave the state untouched.
    pub fn transition(&mut self, trigger: ObsTrigger) -> Result<ObsState> {
        let (state, resourced) = self
            .next(trigger)
            .ok_or_else(|| CbfError::invalid_state(trigger.name(), self.state))?;

        let from = self.state;
        self.state = state;
        self.resourced = resourced;
        info!(
            device = %self.device,
            trigger = %trigger,
            from = %from,
            to = %state,
            resourced,
            "obsState transition"
        );
        Ok(state)
    }
}
