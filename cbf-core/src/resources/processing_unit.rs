use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use cbf_model::{FspId, ObsState, ProcessingMode, ResultCode, SubarrayId};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CbfError, Result};
use crate::manager::{ProxyCommand, RemoteReply, ResourceProxy};
use crate::resources::unit_transition;

#[derive(Default)]
struct SubarrayContext {
    obs_state: ObsState,
    configuration: Option<Value>,
}

#[derive(Default)]
struct UnitState {
    membership: Vec<SubarrayId>,
    function_mode: Option<ProcessingMode>,
    contexts: BTreeMap<SubarrayId, SubarrayContext>,
    completions: BTreeMap<String, RemoteReply>,
}

/// A frequency slice processor shared by up to one context per member
/// subarray.
///
/// Subarrays talk to it through a [`ProcessingUnitHandle`], which scopes
/// observation commands to that subarray.
pub struct LocalProcessingUnit {
    id: FspId,
    resource_id: String,
    capabilities: BTreeSet<ProcessingMode>,
    state: Mutex<UnitState>,
}

impl fmt::Debug for LocalProcessingUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalProcessingUnit")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities)
            .field("membership", &self.membership())
            .finish()
    }
}

pub fn unit_resource_id(id: FspId) -> String {
    format!("fsp{:02}", id.get())
}

impl LocalProcessingUnit {
    /// `capabilities` empty means every mode.
    pub fn new(id: FspId, capabilities: &[ProcessingMode]) -> Arc<Self> {
        let capabilities = if capabilities.is_empty() {
            ProcessingMode::all().iter().copied().collect()
        } else {
            capabilities.iter().copied().collect()
        };
        Arc::new(Self {
            id,
            resource_id: unit_resource_id(id),
            capabilities,
            state: Mutex::new(UnitState::default()),
        })
    }

    pub fn id(&self) -> FspId {
        self.id
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn for_subarray(self: &Arc<Self>, subarray: SubarrayId) -> ProcessingUnitHandle {
        ProcessingUnitHandle {
            unit: Arc::clone(self),
            subarray,
        }
    }

    fn lock(&self) -> MutexGuard<'_, UnitState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Member subarrays in the order they joined.
    pub fn membership(&self) -> Vec<SubarrayId> {
        self.lock().membership.clone()
    }

    pub fn function_mode(&self) -> Option<ProcessingMode> {
        self.lock().function_mode
    }

    pub fn obs_state(&self, subarray: SubarrayId) -> ObsState {
        self.lock()
            .contexts
            .get(&subarray)
            .map(|ctx| ctx.obs_state)
            .unwrap_or_default()
    }

    pub fn configuration(&self, subarray: SubarrayId) -> Option<Value> {
        self.lock()
            .contexts
            .get(&subarray)
            .and_then(|ctx| ctx.configuration.clone())
    }

    fn add_member(state: &mut UnitState, member: SubarrayId) -> RemoteReply {
        if !state.membership.contains(&member) {
            state.membership.push(member);
        }
        state.contexts.entry(member).or_default();
        RemoteReply::ok()
    }

    fn remove_member(state: &mut UnitState, member: SubarrayId) -> RemoteReply {
        state.membership.retain(|m| *m != member);
        state.contexts.remove(&member);
        if state.membership.is_empty() {
            state.function_mode = None;
        }
        RemoteReply::ok()
    }

    fn configure(
        &self,
        state: &mut UnitState,
        subarray: SubarrayId,
        payload: &Value,
    ) -> RemoteReply {
        if !state.membership.contains(&subarray) {
            return RemoteReply::done(
                ResultCode::NotAllowed,
                format!("subarray {subarray} is not a member of {}", self.resource_id),
            );
        }
        let mode = match payload
            .get("function_mode")
            .and_then(Value::as_str)
            .map(str::parse::<ProcessingMode>)
        {
            Some(Ok(mode)) => mode,
            _ => {
                return RemoteReply::done(
                    ResultCode::Rejected,
                    "configuration lacks a valid function_mode",
                );
            }
        };
        if !self.capabilities.contains(&mode) {
            return RemoteReply::done(
                ResultCode::Rejected,
                format!("{} cannot run {mode}", self.resource_id),
            );
        }
        let busy_elsewhere = state.contexts.iter().any(|(member, ctx)| {
            *member != subarray && ctx.configuration.is_some()
        });
        if let Some(current) = state.function_mode
            && current != mode
            && busy_elsewhere
        {
            return RemoteReply::done(
                ResultCode::Rejected,
                format!("{} is running {current} for another subarray", self.resource_id),
            );
        }

        let ctx = state.contexts.entry(subarray).or_default();
        match unit_transition(ctx.obs_state, &ProxyCommand::ConfigureScan(Value::Null)) {
            Some(next) => {
                ctx.obs_state = next;
                ctx.configuration = Some(payload.clone());
                state.function_mode = Some(mode);
                RemoteReply::ok()
            }
            None => RemoteReply::done(
                ResultCode::NotAllowed,
                format!("ConfigureScan not allowed in {}", ctx.obs_state),
            ),
        }
    }

    fn apply(&self, subarray: SubarrayId, command: &ProxyCommand) -> RemoteReply {
        let mut state = self.lock();
        let reply = match command {
            ProxyCommand::AddMembership(member) => Self::add_member(&mut state, *member),
            ProxyCommand::RemoveMembership(member) => {
                Self::remove_member(&mut state, *member)
            }
            ProxyCommand::ConfigureScan(payload) => {
                let reply = self.configure(&mut state, subarray, payload);
                // configuration completes asynchronously
                if matches!(reply, RemoteReply::Done { code: ResultCode::Ok, .. }) {
                    let command_id = format!("{}_{}", Uuid::now_v7(), command.name());
                    state.completions.insert(command_id.clone(), reply);
                    RemoteReply::Queued { command_id }
                } else {
                    reply
                }
            }
            other => {
                let Some(ctx) = state.contexts.get_mut(&subarray) else {
                    return RemoteReply::done(
                        ResultCode::NotAllowed,
                        format!("subarray {subarray} is not a member of {}", self.resource_id),
                    );
                };
                match unit_transition(ctx.obs_state, other) {
                    Some(next) => {
                        ctx.obs_state = next;
                        if next == ObsState::Idle {
                            ctx.configuration = None;
                        }
                        RemoteReply::ok()
                    }
                    None => RemoteReply::done(
                        ResultCode::NotAllowed,
                        format!("{other} not allowed in {}", ctx.obs_state),
                    ),
                }
            }
        };
        debug!(
            resource = %self.resource_id,
            subarray = %subarray,
            command = %command,
            reply = ?reply,
            "unit command applied"
        );
        reply
    }
}

/// A subarray's view of a [`LocalProcessingUnit`].
#[derive(Clone)]
pub struct ProcessingUnitHandle {
    unit: Arc<LocalProcessingUnit>,
    subarray: SubarrayId,
}

impl fmt::Debug for ProcessingUnitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingUnitHandle")
            .field("unit", &self.unit.resource_id)
            .field("subarray", &self.subarray)
            .finish()
    }
}

impl ProcessingUnitHandle {
    pub fn unit(&self) -> &Arc<LocalProcessingUnit> {
        &self.unit
    }
}

#[async_trait]
impl ResourceProxy for ProcessingUnitHandle {
    fn resource_id(&self) -> &str {
        &self.unit.resource_id
    }

    async fn state(&self) -> Result<ObsState> {
        Ok(self.unit.obs_state(self.subarray))
    }

    async fn execute(&self, command: &ProxyCommand) -> Result<RemoteReply> {
        Ok(self.unit.apply(self.subarray, command))
    }

    async fn wait_for_result(&self, command_id: &str) -> Result<RemoteReply> {
        self.unit
            .lock()
            .completions
            .remove(command_id)
            .ok_or_else(|| CbfError::NotFound(format!("remote command {command_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sub(id: u8) -> SubarrayId {
        SubarrayId::new(id).unwrap()
    }

    #[tokio::test]
    async fn membership_follows_add_and_remove_order() {
        let unit = LocalProcessingUnit::new(FspId::new(1).unwrap(), &[]);
        let handle = unit.for_subarray(sub(3));

        handle.execute(&ProxyCommand::AddMembership(sub(3))).await.unwrap();
        handle.execute(&ProxyCommand::AddMembership(sub(4))).await.unwrap();
        assert_eq!(unit.membership(), vec![sub(3), sub(4)]);

        handle.execute(&ProxyCommand::RemoveMembership(sub(3))).await.unwrap();
        assert_eq!(unit.membership(), vec![sub(4)]);

        handle.execute(&ProxyCommand::RemoveMembership(sub(4))).await.unwrap();
        assert!(unit.membership().is_empty());
        assert_eq!(unit.function_mode(), None);
    }

    #[tokio::test]
    async fn configure_is_queued_then_completed() {
        let unit = LocalProcessingUnit::new(FspId::new(2).unwrap(), &[]);
        let handle = unit.for_subarray(sub(1));
        handle.execute(&ProxyCommand::AddMembership(sub(1))).await.unwrap();

        let payload = json!({"function_mode": "CORR", "subarray_id": 1});
        let reply = handle
            .execute(&ProxyCommand::ConfigureScan(payload.clone()))
            .await
            .unwrap();
        let RemoteReply::Queued { command_id } = reply else {
            panic!("expected queued reply, got {reply:?}");
        };
        assert_eq!(
            handle.wait_for_result(&command_id).await.unwrap(),
            RemoteReply::ok()
        );
        assert_eq!(unit.obs_state(sub(1)), ObsState::Ready);
        assert_eq!(unit.configuration(sub(1)), Some(payload));
        assert_eq!(unit.function_mode(), Some(ProcessingMode::Corr));
    }

    #[tokio::test]
    async fn non_members_and_wrong_modes_are_refused() {
        let unit = LocalProcessingUnit::new(FspId::new(3).unwrap(), &[ProcessingMode::Pst]);
        let handle = unit.for_subarray(sub(1));

        let reply = handle
            .execute(&ProxyCommand::ConfigureScan(json!({"function_mode": "PST-BF"})))
            .await
            .unwrap();
        assert!(matches!(reply, RemoteReply::Done { code: ResultCode::NotAllowed, .. }));

        handle.execute(&ProxyCommand::AddMembership(sub(1))).await.unwrap();
        let reply = handle
            .execute(&ProxyCommand::ConfigureScan(json!({"function_mode": "CORR"})))
            .await
            .unwrap();
        assert!(matches!(reply, RemoteReply::Done { code: ResultCode::Rejected, .. }));

        let reply = handle.execute(&ProxyCommand::EndScan).await.unwrap();
        assert!(matches!(reply, RemoteReply::Done { code: ResultCode::NotAllowed, .. }));
    }
}
