//! In-process resource units.
//!
//! These implement [`ResourceProxy`](crate::manager::ResourceProxy) without
//! a transport, for single-process deployments and tests.

pub mod channelizer;
pub mod processing_unit;

pub use channelizer::LocalChannelizer;
pub use processing_unit::{LocalProcessingUnit, ProcessingUnitHandle};

use cbf_model::ObsState;

use crate::manager::ProxyCommand;

/// Observation step a unit takes for `command`, or `None` when the command
/// is not allowed in `state`. Membership commands never change it.
pub(crate) fn unit_transition(state: ObsState, command: &ProxyCommand) -> Option<ObsState> {
    use ObsState::*;

    match (state, command) {
        (Idle | Ready, ProxyCommand::ConfigureScan(_)) => Some(Ready),
        (Ready, ProxyCommand::Scan(_)) => Some(Scanning),
        (Scanning, ProxyCommand::EndScan) => Some(Ready),
        (Ready | Idle, ProxyCommand::GoToIdle) => Some(Idle),
        (
            Idle | Configuring | Ready | Scanning | Resourcing,
            ProxyCommand::Abort,
        ) => Some(Aborted),
        (Aborted | Fault, ProxyCommand::ObsReset) => Some(Idle),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbf_model::ScanId;

    #[test]
    fn unit_steps() {
        let scan = ProxyCommand::Scan(ScanId(1));
        assert_eq!(unit_transition(ObsState::Ready, &scan), Some(ObsState::Scanning));
        assert_eq!(unit_transition(ObsState::Idle, &scan), None);
        assert_eq!(
            unit_transition(ObsState::Scanning, &ProxyCommand::Abort),
            Some(ObsState::Aborted)
        );
        assert_eq!(
            unit_transition(ObsState::Aborted, &ProxyCommand::ObsReset),
            Some(ObsState::Idle)
        );
        assert_eq!(unit_transition(ObsState::Aborted, &ProxyCommand::Abort), None);
    }
}
