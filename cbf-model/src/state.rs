use std::fmt;

/// Observation life-cycle stage of a resourced device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "SCREAMING_SNAKE_CASE")
)]
pub enum ObsState {
    #[default]
    Idle,
    Resourcing,
    Configuring,
    Ready,
    Scanning,
    Aborting,
    Aborted,
    Resetting,
    Fault,
}

impl ObsState {
    /// States that only `ObsReset` (or `Restart`) can leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ObsState::Aborted | ObsState::Fault)
    }

    /// Intermediate states entered while a long-running command executes.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            ObsState::Resourcing
                | ObsState::Configuring
                | ObsState::Aborting
                | ObsState::Resetting
        )
    }
}

impl fmt::Display for ObsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ObsState::Idle => "IDLE",
            ObsState::Resourcing => "RESOURCING",
            ObsState::Configuring => "CONFIGURING",
            ObsState::Ready => "READY",
            ObsState::Scanning => "SCANNING",
            ObsState::Aborting => "ABORTING",
            ObsState::Aborted => "ABORTED",
            ObsState::Resetting => "RESETTING",
            ObsState::Fault => "FAULT",
        };
        f.write_str(label)
    }
}

/// Whether a component manager has a working link to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "SCREAMING_SNAKE_CASE")
)]
pub enum CommunicationStatus {
    #[default]
    NotEstablished,
    Established,
    Disabled,
}

impl fmt::Display for CommunicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommunicationStatus::NotEstablished => f.write_str("NOT_ESTABLISHED"),
            CommunicationStatus::Established => f.write_str("ESTABLISHED"),
            CommunicationStatus::Disabled => f.write_str("DISABLED"),
        }
    }
}

/// Aggregated health of a device and the links it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "SCREAMING_SNAKE_CASE")
)]
pub enum HealthState {
    #[default]
    Unknown,
    Ok,
    Degraded,
    Failed,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthState::Unknown => "UNKNOWN",
            HealthState::Ok => "OK",
            HealthState::Degraded => "DEGRADED",
            HealthState::Failed => "FAILED",
        };
        f.write_str(label)
    }
}
