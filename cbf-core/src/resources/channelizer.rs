use std::fmt;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use cbf_model::{FrequencyBand, ObsState, ResultCode, SubarrayId, VccId};
use tracing::debug;

use crate::error::{CbfError, Result};
use crate::manager::{ProxyCommand, RemoteReply, ResourceProxy};
use crate::resources::unit_transition;

#[derive(Default)]
struct ChannelizerState {
    owner: Option<SubarrayId>,
    band: Option<FrequencyBand>,
    obs_state: ObsState,
}

/// A channelizer (VCC). Belongs to at most one subarray at a time.
pub struct LocalChannelizer {
    id: VccId,
    resource_id: String,
    state: Mutex<ChannelizerState>,
}

impl fmt::Debug for LocalChannelizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalChannelizer")
            .field("id", &self.id)
            .field("owner", &self.owner())
            .finish()
    }
}

pub fn channelizer_resource_id(id: VccId) -> String {
    format!("vcc{:03}", id.get())
}

impl LocalChannelizer {
    pub fn new(id: VccId) -> Self {
        Self {
            id,
            resource_id: channelizer_resource_id(id),
            state: Mutex::new(ChannelizerState::default()),
        }
    }

    pub fn id(&self) -> VccId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, ChannelizerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn owner(&self) -> Option<SubarrayId> {
        self.lock().owner
    }

    pub fn band(&self) -> Option<FrequencyBand> {
        self.lock().band
    }

    pub fn obs_state(&self) -> ObsState {
        self.lock().obs_state
    }

    fn apply(&self, command: &ProxyCommand) -> RemoteReply {
        let mut state = self.lock();
        match command {
            ProxyCommand::AddMembership(subarray) => match state.owner {
                Some(owner) if owner != *subarray => RemoteReply::done(
                    ResultCode::Rejected,
                    format!("{} belongs to subarray {owner}", self.resource_id),
                ),
                _ => {
                    state.owner = Some(*subarray);
                    RemoteReply::ok()
                }
            },
            ProxyCommand::RemoveMembership(subarray) => match state.owner {
                Some(owner) if owner != *subarray => RemoteReply::done(
                    ResultCode::Rejected,
                    format!("{} belongs to subarray {owner}", self.resource_id),
                ),
                _ => {
                    state.owner = None;
                    state.band = None;
                    state.obs_state = ObsState::Idle;
                    RemoteReply::ok()
                }
            },
            other => {
                if state.owner.is_none() {
                    return RemoteReply::done(
                        ResultCode::NotAllowed,
                        format!("{} has no subarray", self.resource_id),
                    );
                }
                let band = match other {
                    ProxyCommand::ConfigureScan(payload) => {
                        match payload
                            .get("frequency_band")
                            .cloned()
                            .map(serde_json::from_value::<FrequencyBand>)
                        {
                            Some(Ok(band)) => Some(band),
                            _ => {
                                return RemoteReply::done(
                                    ResultCode::Rejected,
                                    "configuration lacks a valid frequency_band",
                                );
                            }
                        }
                    }
                    _ => None,
                };
                let Some(next) = unit_transition(state.obs_state, other) else {
                    return RemoteReply::done(
                        ResultCode::NotAllowed,
                        format!("{other} not allowed in {}", state.obs_state),
                    );
                };
                state.obs_state = next;
                if band.is_some() {
                    state.band = band;
                }
                debug!(
                    resource = %self.resource_id,
                    command = %other,
                    obs_state = %next,
                    "channelizer command applied"
                );
                RemoteReply::ok()
            }
        }
    }
}

#[async_trait]
impl ResourceProxy for LocalChannelizer {
    fn resource_id(&self) -> &str {
        &self.resource_id
    }

    async fn state(&self) -> Result<ObsState> {
        Ok(self.obs_state())
    }

    async fn execute(&self, command: &ProxyCommand) -> Result<RemoteReply> {
        Ok(self.apply(command))
    }

    async fn wait_for_result(&self, command_id: &str) -> Result<RemoteReply> {
        Err(CbfError::NotFound(format!(
            "{} completes every command immediately; no result for {command_id}",
            self.resource_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbf_model::ScanId;
    use serde_json::json;

    fn sub(id: u8) -> SubarrayId {
        SubarrayId::new(id).unwrap()
    }

    #[tokio::test]
    async fn single_owner() {
        let vcc = LocalChannelizer::new(VccId::new(7).unwrap());
        assert_eq!(vcc.resource_id(), "vcc007");

        let reply = vcc.execute(&ProxyCommand::AddMembership(sub(1))).await.unwrap();
        assert_eq!(reply, RemoteReply::ok());
        let reply = vcc.execute(&ProxyCommand::AddMembership(sub(2))).await.unwrap();
        assert!(matches!(reply, RemoteReply::Done { code: ResultCode::Rejected, .. }));
        assert_eq!(vcc.owner(), Some(sub(1)));

        vcc.execute(&ProxyCommand::RemoveMembership(sub(1))).await.unwrap();
        assert_eq!(vcc.owner(), None);
    }

    #[tokio::test]
    async fn configure_scan_and_abort() {
        let vcc = LocalChannelizer::new(VccId::new(1).unwrap());
        vcc.execute(&ProxyCommand::AddMembership(sub(1))).await.unwrap();

        let reply = vcc
            .execute(&ProxyCommand::ConfigureScan(json!({"frequency_band": "5b"})))
            .await
            .unwrap();
        assert_eq!(reply, RemoteReply::ok());
        assert_eq!(vcc.band(), Some(FrequencyBand::Band5b));

        vcc.execute(&ProxyCommand::Scan(ScanId(3))).await.unwrap();
        assert_eq!(vcc.obs_state(), ObsState::Scanning);
        vcc.execute(&ProxyCommand::Abort).await.unwrap();
        assert_eq!(vcc.obs_state(), ObsState::Aborted);
        vcc.execute(&ProxyCommand::ObsReset).await.unwrap();
        assert_eq!(vcc.obs_state(), ObsState::Idle);
    }
}
