use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use cbf_model::{
    CommandStatus, FspId, ObsState, ReceptorId, ResultCode, ScanId, SubarrayId,
    VccId,
};
use serde_json::{Value, json};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assignment::{Assignment, PoolChange, ResourcePool};
use crate::command::{CommandId, CommandResult, CommandTracker};
use crate::config::ControllerConfig;
use crate::error::{CbfError, Result};
use crate::manager::{BatchCall, BatchOutcome, ComponentManager, ProxyCommand};
use crate::observation::{ObsStateMachine, ObsTrigger};
use crate::resources::channelizer::channelizer_resource_id;
use crate::resources::processing_unit::unit_resource_id;

/// Work handed to the device worker. Everything here has already passed
/// validation and, where it claims resources, has already been registered
/// in the pool.
#[derive(Debug)]
pub(crate) enum Job {
    Assign {
        id: CommandId,
        receptors: Vec<ReceptorId>,
        claimed: Vec<VccId>,
    },
    Release {
        id: CommandId,
        receptors: Vec<ReceptorId>,
    },
    Configure {
        id: CommandId,
        assignment: Assignment,
    },
    Scan {
        id: CommandId,
        scan_id: ScanId,
    },
    EndScan {
        id: CommandId,
    },
    GoToIdle {
        id: CommandId,
    },
    ObsReset {
        id: CommandId,
    },
    Restart {
        id: CommandId,
    },
}

impl Job {
    pub(crate) fn id(&self) -> &CommandId {
        match self {
            Job::Assign { id, .. }
            | Job::Release { id, .. }
            | Job::Configure { id, .. }
            | Job::Scan { id, .. }
            | Job::EndScan { id }
            | Job::GoToIdle { id }
            | Job::ObsReset { id }
            | Job::Restart { id } => id,
        }
    }
}

/// How a job ended.
enum Verdict {
    Done(String),
    Aborted(String),
    /// The device moved on before the job ran.
    NotAllowed(CbfError),
    Failed(CbfError),
}

#[derive(Debug)]
pub(crate) struct DeviceState {
    pub(crate) machine: ObsStateMachine,
    pub(crate) receptors: BTreeSet<ReceptorId>,
    pub(crate) assignment: Option<Assignment>,
}

/// State shared between the device's public surface and its worker.
pub(crate) struct DeviceCore {
    pub(crate) subarray: SubarrayId,
    pub(crate) name: String,
    pub(crate) config: ControllerConfig,
    pub(crate) pool: Arc<ResourcePool>,
    pub(crate) state: Mutex<DeviceState>,
    pub(crate) tracker: CommandTracker,
    pub(crate) manager: ComponentManager,
    pub(crate) obs_tx: watch::Sender<ObsState>,
}

impl fmt::Debug for DeviceCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCore")
            .field("name", &self.name)
            .field("obs_state", &*self.obs_tx.borrow())
            .field("tracker", &self.tracker)
            .finish()
    }
}

impl DeviceCore {
    pub(crate) async fn transition(&self, trigger: ObsTrigger) -> Result<ObsState> {
        let mut state = self.state.lock().await;
        let next = state.machine.transition(trigger)?;
        self.obs_tx.send_replace(next);
        Ok(next)
    }

    async fn check(&self, trigger: ObsTrigger) -> Result<()> {
        self.state.lock().await.machine.check(trigger)
    }

    pub(crate) async fn fault(&self, error: &CbfError) {
        warn!(subarray = %self.subarray, error = %error, "device faulted");
        if let Err(err) = self.transition(ObsTrigger::Fault).await {
            warn!(subarray = %self.subarray, error = %err, "fault transition refused");
        }
    }

    fn aborting(&self) -> bool {
        matches!(
            *self.obs_tx.borrow(),
            ObsState::Aborting | ObsState::Aborted
        )
    }

    async fn dispatch(
        &self,
        calls: Vec<BatchCall>,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Verdict> {
        match self.manager.issue_batch(calls, cancel).await {
            BatchOutcome::Completed { .. } => Ok(()),
            BatchOutcome::Aborted { skipped, .. } => Err(Verdict::Aborted(format!(
                "abort requested; {} remote call(s) not issued",
                skipped.len()
            ))),
            BatchOutcome::Failed { error, .. } => {
                self.fault(&error).await;
                Err(Verdict::Failed(error))
            }
        }
    }

    /// Apply the completion trigger of a job whose remote work succeeded.
    async fn finish(&self, trigger: ObsTrigger) -> Verdict {
        match self.transition(trigger).await {
            Ok(state) => Verdict::Done(format!("{trigger} completed, obsState {state}")),
            Err(_) if self.aborting() => {
                Verdict::Aborted("superseded by Abort".to_string())
            }
            Err(err) => Verdict::Failed(err),
        }
    }

    fn settle(&self, id: &CommandId, verdict: Verdict) {
        let (status, result) = match verdict {
            Verdict::Done(message) => (
                CommandStatus::Completed,
                CommandResult::new(ResultCode::Ok, message),
            ),
            Verdict::Aborted(message) => (
                CommandStatus::Aborted,
                CommandResult::new(ResultCode::Aborted, message),
            ),
            Verdict::NotAllowed(err) => (
                CommandStatus::Failed,
                CommandResult::new(ResultCode::NotAllowed, err.to_string()),
            ),
            Verdict::Failed(err) => (
                CommandStatus::Failed,
                CommandResult::new(ResultCode::Failed, err.to_string()),
            ),
        };
        info!(
            subarray = %self.subarray,
            command_id = %id,
            status = %status,
            message = %result.message,
            "command finished"
        );
        if let Err(err) = self.tracker.advance(id, status, None, Some(result)) {
            warn!(command_id = %id, error = %err, "could not record command result");
        }
    }

    /// Execute one queued command.
    pub(crate) async fn run_job(&self, job: Job) {
        let id = job.id().clone();
        if self.tracker.get(&id).is_none() {
            // aborted while queued; undo claims that never got used
            self.discard(job).await;
            return;
        }
        if let Err(err) = self.tracker.advance(&id, CommandStatus::InProgress, Some(0), None)
        {
            warn!(command_id = %id, error = %err, "could not start command");
            self.discard(job).await;
            return;
        }
        debug!(subarray = %self.subarray, command_id = %id, "command started");

        let cancel = self.manager.cancellation();
        let verdict = match job {
            Job::Assign {
                receptors, claimed, ..
            } => self.assign(receptors, claimed, &cancel).await,
            Job::Release { receptors, .. } => self.release(receptors, &cancel).await,
            Job::Configure { assignment, .. } => self.configure(assignment, &cancel).await,
            Job::Scan { scan_id, .. } => self.scan(scan_id, &cancel).await,
            Job::EndScan { .. } => self.end_scan(&cancel).await,
            Job::GoToIdle { .. } => self.go_to_idle(&cancel).await,
            Job::ObsReset { .. } => self.reset(false, &cancel).await,
            Job::Restart { .. } => self.reset(true, &cancel).await,
        };
        self.settle(&id, verdict);
    }

    async fn discard(&self, job: Job) {
        let change = match &job {
            Job::Assign { claimed, .. } => PoolChange::release_vccs(claimed.iter().copied()),
            Job::Configure { assignment, .. } => {
                PoolChange::release_fsps(assignment.fsp_ids())
            }
            _ => return,
        };
        self.release_claims(change).await;
    }

    async fn release_claims(&self, change: PoolChange) {
        let attempts = self.config.retry.max_attempts;
        let subarray = self.subarray;
        let result = self
            .pool
            .commit_with(subarray, attempts, |snapshot| PoolChange {
                release_fsps: change
                    .release_fsps
                    .iter()
                    .copied()
                    .filter(|fsp| {
                        snapshot.fsp(*fsp).and_then(|record| record.owner) == Some(subarray)
                    })
                    .collect(),
                release_vccs: change
                    .release_vccs
                    .iter()
                    .copied()
                    .filter(|vcc| snapshot.vcc_owner(*vcc) == Some(subarray))
                    .collect(),
                ..PoolChange::default()
            })
            .await;
        if let Err(err) = result {
            warn!(subarray = %subarray, error = %err, "could not return resources to the pool");
        }
    }

    async fn assign(
        &self,
        receptors: Vec<ReceptorId>,
        claimed: Vec<VccId>,
        cancel: &CancellationToken,
    ) -> Verdict {
        if let Err(err) = self.transition(ObsTrigger::AssignResources).await {
            self.release_claims(PoolChange::release_vccs(claimed)).await;
            return Verdict::NotAllowed(err);
        }
        let calls = claimed
            .iter()
            .map(|vcc| {
                BatchCall::new(
                    channelizer_resource_id(*vcc),
                    ProxyCommand::AddMembership(self.subarray),
                )
            })
            .collect();
        if let Err(verdict) = self.dispatch(calls, cancel).await {
            // claims stay with the subarray until ReleaseResources or Restart
            let mut state = self.state.lock().await;
            state.receptors.extend(receptors);
            state.machine.adopt_resources();
            return verdict;
        }
        self.state.lock().await.receptors.extend(receptors);
        self.finish(ObsTrigger::ResourcesAssigned).await
    }

    async fn release(&self, receptors: Vec<ReceptorId>, cancel: &CancellationToken) -> Verdict {
        if let Err(err) = self.transition(ObsTrigger::ReleaseResources).await {
            return Verdict::NotAllowed(err);
        }
        let snapshot = self.pool.snapshot().await;
        let vccs: Vec<VccId> = receptors
            .iter()
            .filter_map(|receptor| snapshot.vcc_for(receptor))
            .filter(|vcc| snapshot.vcc_owner(*vcc) == Some(self.subarray))
            .collect();
        let calls = vccs
            .iter()
            .map(|vcc| {
                BatchCall::new(
                    channelizer_resource_id(*vcc),
                    ProxyCommand::RemoveMembership(self.subarray),
                )
            })
            .collect();
        if let Err(verdict) = self.dispatch(calls, cancel).await {
            return verdict;
        }
        self.release_claims(PoolChange::release_vccs(vccs)).await;

        let remaining = {
            let mut state = self.state.lock().await;
            for receptor in &receptors {
                state.receptors.remove(receptor);
            }
            !state.receptors.is_empty()
        };
        self.finish(ObsTrigger::ResourcesReleased { remaining }).await
    }

    async fn configure(&self, assignment: Assignment, cancel: &CancellationToken) -> Verdict {
        let calls = match configure_calls(self.subarray, &assignment) {
            Ok(calls) => calls,
            Err(err) => {
                self.release_claims(PoolChange::release_fsps(assignment.fsp_ids()))
                    .await;
                return Verdict::Failed(err);
            }
        };
        if let Err(err) = self.transition(ObsTrigger::ConfigureScan).await {
            self.release_claims(PoolChange::release_fsps(assignment.fsp_ids()))
                .await;
            return Verdict::NotAllowed(err);
        }

        // kept even if the batch fails so that ObsReset can return it
        {
            let mut state = self.state.lock().await;
            if let Some(previous) = state.assignment.replace(assignment.clone()) {
                let stale: Vec<FspId> = previous
                    .fsp_ids()
                    .into_iter()
                    .filter(|fsp| !assignment.units.contains_key(fsp))
                    .collect();
                drop(state);
                self.release_claims(PoolChange::release_fsps(stale)).await;
            }
        }

        if let Err(verdict) = self.dispatch(calls, cancel).await {
            return verdict;
        }
        self.finish(ObsTrigger::ScanConfigured).await
    }

    /// Resource ids this subarray currently holds, channelizers first.
    async fn involved(&self) -> (Vec<String>, Vec<String>) {
        let snapshot = self.pool.snapshot().await;
        let vccs = snapshot
            .vccs_owned_by(self.subarray)
            .into_iter()
            .map(channelizer_resource_id)
            .collect();
        let fsps = snapshot
            .fsps_owned_by(self.subarray)
            .into_iter()
            .map(unit_resource_id)
            .collect();
        (vccs, fsps)
    }

    async fn broadcast(
        &self,
        trigger: ObsTrigger,
        command: ProxyCommand,
        cancel: &CancellationToken,
    ) -> Verdict {
        if let Err(err) = self.check(trigger).await {
            return Verdict::NotAllowed(err);
        }
        let (vccs, fsps) = self.involved().await;
        let calls = vccs
            .into_iter()
            .chain(fsps)
            .map(|resource| BatchCall::new(resource, command.clone()))
            .collect();
        if let Err(verdict) = self.dispatch(calls, cancel).await {
            return verdict;
        }
        self.finish(trigger).await
    }

    async fn scan(&self, scan_id: ScanId, cancel: &CancellationToken) -> Verdict {
        self.broadcast(ObsTrigger::Scan, ProxyCommand::Scan(scan_id), cancel)
            .await
    }

    async fn end_scan(&self, cancel: &CancellationToken) -> Verdict {
        self.broadcast(ObsTrigger::EndScan, ProxyCommand::EndScan, cancel)
            .await
    }

    async fn go_to_idle(&self, cancel: &CancellationToken) -> Verdict {
        if let Err(err) = self.check(ObsTrigger::GoToIdle).await {
            return Verdict::NotAllowed(err);
        }
        let (vccs, fsps) = self.involved().await;
        let mut calls: Vec<BatchCall> = vccs
            .into_iter()
            .chain(fsps.iter().cloned())
            .map(|resource| BatchCall::new(resource, ProxyCommand::GoToIdle))
            .collect();
        calls.extend(fsps.into_iter().map(|resource| {
            BatchCall::new(resource, ProxyCommand::RemoveMembership(self.subarray))
        }));
        if let Err(verdict) = self.dispatch(calls, cancel).await {
            return verdict;
        }
        self.drop_assignment().await;
        self.finish(ObsTrigger::GoToIdle).await
    }

    async fn drop_assignment(&self) {
        let previous = self.state.lock().await.assignment.take();
        let snapshot = self.pool.snapshot().await;
        let mut fsps: BTreeSet<FspId> =
            snapshot.fsps_owned_by(self.subarray).into_iter().collect();
        if let Some(assignment) = previous {
            fsps.extend(assignment.fsp_ids());
        }
        self.release_claims(PoolChange::release_fsps(fsps)).await;
    }

    /// Commands that bring one resource back to IDLE from wherever it is.
    async fn recovery_calls(&self, resource: String) -> Vec<BatchCall> {
        let state = match self.manager.resource_state(&resource).await {
            Ok(state) => state,
            Err(err) => {
                warn!(resource = %resource, error = %err, "state unknown; resetting anyway");
                ObsState::Fault
            }
        };
        let commands = match state {
            ObsState::Aborted | ObsState::Fault => vec![ProxyCommand::ObsReset],
            ObsState::Configuring | ObsState::Ready | ObsState::Scanning => {
                vec![ProxyCommand::Abort, ProxyCommand::ObsReset]
            }
            _ => Vec::new(),
        };
        commands
            .into_iter()
            .map(|command| BatchCall::new(resource.clone(), command))
            .collect()
    }

    /// ObsReset, or Restart when `restart` is set.
    async fn reset(&self, restart: bool, cancel: &CancellationToken) -> Verdict {
        let (trigger, completed) = if restart {
            (ObsTrigger::Restart, ObsTrigger::RestartCompleted)
        } else {
            (ObsTrigger::ObsReset, ObsTrigger::ObsResetCompleted)
        };
        if let Err(err) = self.transition(trigger).await {
            return Verdict::NotAllowed(err);
        }

        let (vccs, fsps) = self.involved().await;
        let mut calls = Vec::new();
        for resource in vccs.iter().chain(&fsps) {
            calls.extend(self.recovery_calls(resource.clone()).await);
        }
        calls.extend(fsps.into_iter().map(|resource| {
            BatchCall::new(resource, ProxyCommand::RemoveMembership(self.subarray))
        }));
        if restart {
            calls.extend(vccs.into_iter().map(|resource| {
                BatchCall::new(resource, ProxyCommand::RemoveMembership(self.subarray))
            }));
        }
        if let Err(verdict) = self.dispatch(calls, cancel).await {
            return verdict;
        }

        self.drop_assignment().await;
        if restart {
            let vccs = self.pool.snapshot().await.vccs_owned_by(self.subarray);
            self.release_claims(PoolChange::release_vccs(vccs)).await;
            self.state.lock().await.receptors.clear();
        }
        self.manager.clear_fault();
        self.finish(completed).await
    }

    /// Second half of Abort, run once the in-flight command has stopped.
    pub(crate) async fn run_abort(&self, id: CommandId) {
        self.manager.reset_cancellation();
        let cancel = self.manager.cancellation();
        if let Err(err) = self.tracker.advance(&id, CommandStatus::InProgress, Some(0), None)
        {
            warn!(command_id = %id, error = %err, "could not start Abort");
            return;
        }

        let (vccs, fsps) = self.involved().await;
        let mut calls = Vec::new();
        for resource in vccs.into_iter().chain(fsps) {
            match self.manager.resource_state(&resource).await {
                Ok(
                    ObsState::Resourcing
                    | ObsState::Configuring
                    | ObsState::Ready
                    | ObsState::Scanning,
                ) => calls.push(BatchCall::new(resource, ProxyCommand::Abort)),
                Ok(_) => {}
                Err(err) => {
                    warn!(resource = %resource, error = %err, "state unknown; aborting anyway");
                    calls.push(BatchCall::new(resource, ProxyCommand::Abort));
                }
            }
        }
        let verdict = match self.dispatch(calls, &cancel).await {
            Ok(()) => self.finish(ObsTrigger::AbortCompleted).await,
            Err(verdict) => verdict,
        };
        self.settle(&id, verdict);
    }
}

/// Channelizers are configured first, then each processing unit joins the
/// subarray and receives its slice.
fn configure_calls(subarray: SubarrayId, assignment: &Assignment) -> Result<Vec<BatchCall>> {
    let first = assignment.units.values().next().ok_or_else(|| {
        CbfError::Internal("assignment has no processing units".to_string())
    })?;
    let band_payload: Value = json!({
        "config_id": assignment.config_id,
        "subarray_id": subarray,
        "frequency_band": first.configuration.frequency_band,
        "band_5_tuning": first.configuration.band_5_tuning,
    });

    let mut calls: Vec<BatchCall> = assignment
        .vcc_ids()
        .into_iter()
        .map(|vcc| {
            BatchCall::new(
                channelizer_resource_id(vcc),
                ProxyCommand::ConfigureScan(band_payload.clone()),
            )
        })
        .collect();
    for (fsp, unit) in &assignment.units {
        let resource = unit_resource_id(*fsp);
        calls.push(BatchCall::new(
            resource.clone(),
            ProxyCommand::AddMembership(subarray),
        ));
        calls.push(BatchCall::new(
            resource,
            ProxyCommand::ConfigureScan(unit.payload()?),
        ));
    }
    Ok(calls)
}
