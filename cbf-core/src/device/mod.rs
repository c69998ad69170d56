//! The observing device: one subarray's state machine, command queue and
//! component manager, driven by a single sequential worker.
//!
//! Commands are validated and, where they claim resources, registered in the
//! pool before they are queued, so validation and conflict errors reach the
//! caller directly. Everything after that is reported through the command
//! tracker.

mod runner;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cbf_model::{
    CommandStatus, CommunicationStatus, FspId, HealthState, ObsState,
    ProcessingMode, ReceptorId, ResultCode, ScanId, SubarrayId, VccId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use self::runner::{DeviceCore, DeviceState, Job};
use crate::assignment::{Assignment, AssignmentBuilder, PoolChange, ResourcePool};
use crate::command::{
    CommandEvent, CommandId, CommandResult, CommandTracker, Submission,
};
use crate::config::ControllerConfig;
use crate::error::{CbfError, Result};
use crate::interface::InterfaceValidator;
use crate::manager::ComponentManager;
use crate::observation::{ObsStateMachine, ObsTrigger};
use crate::spectrum::SpectrumPartitioner;

/// Snapshot of a device's externally visible state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    pub obs_state: ObsState,
    pub communication_status: CommunicationStatus,
    pub health: HealthState,
    pub faulted: bool,
}

#[derive(Debug, Deserialize)]
struct ResourcesDocument {
    #[serde(default)]
    subarray_id: Option<i64>,
    #[serde(default)]
    receptor_ids: Option<Vec<ReceptorId>>,
}

#[derive(Debug, Deserialize)]
struct ScanDocument {
    scan_id: u64,
}

/// A subarray device.
///
/// Cloning is cheap; clones share the same worker. Call
/// [`shutdown`](Self::shutdown) to stop the worker.
#[derive(Clone)]
pub struct ObservingDevice {
    core: Arc<DeviceCore>,
    validator: Arc<InterfaceValidator>,
    partitioner: SpectrumPartitioner,
    jobs: mpsc::Sender<Job>,
    aborts: mpsc::Sender<CommandId>,
    shutdown: CancellationToken,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for ObservingDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservingDevice")
            .field("core", &self.core)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl ObservingDevice {
    /// Build the device and start its worker. `manager` should already hold
    /// links to every channelizer and processing unit the subarray may use.
    pub fn spawn(
        subarray: SubarrayId,
        config: ControllerConfig,
        pool: Arc<ResourcePool>,
        manager: ComponentManager,
    ) -> Self {
        let name = format!("subarray{:02}", subarray.get());
        let (obs_tx, _) = watch::channel(ObsState::Idle);
        let validator = Arc::new(InterfaceValidator::from_config(&config.interfaces));
        let partitioner = SpectrumPartitioner::new(config.spectrum.k_offset_step_hz);
        let capacity = config.commands.queue_capacity.max(1);

        let core = Arc::new(DeviceCore {
            subarray,
            name: name.clone(),
            pool,
            state: Mutex::new(DeviceState {
                machine: ObsStateMachine::new(name.clone()),
                receptors: BTreeSet::new(),
                assignment: None,
            }),
            tracker: CommandTracker::new(&config.commands),
            manager,
            obs_tx,
            config,
        });

        let (jobs, job_rx) = mpsc::channel(capacity + 1);
        let (aborts, abort_rx) = mpsc::channel(capacity + 1);
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(
            run_worker(Arc::clone(&core), job_rx, abort_rx, shutdown.clone())
                .instrument(info_span!("device", subarray = %subarray)),
        );
        info!(device = %name, "device started");

        Self {
            core,
            validator,
            partitioner,
            jobs,
            aborts,
            shutdown,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    pub fn subarray(&self) -> SubarrayId {
        self.core.subarray
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn manager(&self) -> &ComponentManager {
        &self.core.manager
    }

    /// Stop the worker after the command it is running, if any.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(worker) = self.worker.lock().await.take()
            && let Err(err) = worker.await
        {
            warn!(device = %self.core.name, error = %err, "device worker ended abnormally");
        }
    }

    pub async fn start_communicating(&self) -> CommunicationStatus {
        self.core.manager.start_communicating().await
    }

    pub async fn stop_communicating(&self) {
        self.core.manager.stop_communicating().await
    }

    fn check_interface(&self, document: &str, command: &str) -> Result<Value> {
        let (ok, reason) = self.validator.validate(document, command);
        if !ok {
            return Err(CbfError::Validation(reason));
        }
        Ok(serde_json::from_str(document)?)
    }

    async fn check_state(&self, trigger: ObsTrigger) -> Result<()> {
        self.core.state.lock().await.machine.check(trigger)
    }

    /// Queue `job`. On rejection `undo` returns whatever the job had claimed.
    async fn enqueue(
        &self,
        name: &str,
        job: impl FnOnce(CommandId) -> Job,
        undo: PoolChange,
    ) -> Result<(CommandStatus, CommandId)> {
        let submission = self.core.tracker.submit(name)?;
        let id = match submission {
            Submission::Queued(id) => id,
            Submission::Rejected(id) => {
                self.undo(undo).await;
                return Ok((CommandStatus::Rejected, id));
            }
        };
        if let Err(err) = self.jobs.try_send(job(id.clone())) {
            warn!(command_id = %id, error = %err, "worker mailbox unavailable");
            self.core.tracker.advance(
                &id,
                CommandStatus::Rejected,
                None,
                Some(CommandResult::new(
                    ResultCode::Rejected,
                    "device worker is not running",
                )),
            )?;
            self.undo(undo).await;
            return Ok((CommandStatus::Rejected, id));
        }
        debug!(device = %self.core.name, command_id = %id, "command queued");
        Ok((CommandStatus::Queued, id))
    }

    async fn undo(&self, change: PoolChange) {
        if change.is_empty() {
            return;
        }
        let attempts = self.core.config.retry.max_attempts;
        if let Err(err) = self
            .core
            .pool
            .commit_with(self.core.subarray, attempts, |_| change.clone())
            .await
        {
            warn!(device = %self.core.name, error = %err, "could not undo pool claim");
        }
    }

    /// Claim the receptors' channelizers and add them to the subarray.
    pub async fn assign_resources(&self, document: &str) -> Result<(CommandStatus, CommandId)> {
        let value = self.check_interface(document, "assignresources")?;
        let request: ResourcesDocument = serde_json::from_value(value)
            .map_err(|err| CbfError::Validation(format!("assignresources: {err}")))?;
        self.check_subarray(request.subarray_id)?;
        let receptors: BTreeSet<ReceptorId> = request
            .receptor_ids
            .ok_or_else(|| CbfError::Validation("receptor_ids is required".to_string()))?
            .into_iter()
            .collect();
        if receptors.is_empty() {
            return Err(CbfError::Validation("receptor_ids is empty".to_string()));
        }
        self.check_state(ObsTrigger::AssignResources).await?;

        let snapshot = self.core.pool.snapshot().await;
        let mut claimed: Vec<VccId> = Vec::new();
        for receptor in &receptors {
            let vcc = snapshot.vcc_for(receptor).ok_or_else(|| {
                CbfError::Validation(format!("receptor {receptor} is not in the inventory"))
            })?;
            match snapshot.vcc_owner(vcc) {
                Some(owner) if owner == self.core.subarray => {}
                Some(owner) => {
                    return Err(CbfError::ResourceConflict(format!(
                        "receptor {receptor} belongs to subarray {owner}"
                    )));
                }
                None => claimed.push(vcc),
            }
        }
        self.core
            .pool
            .commit(
                snapshot.version,
                self.core.subarray,
                &PoolChange::claim_vccs(claimed.iter().copied()),
            )
            .await?;

        let receptors: Vec<ReceptorId> = receptors.into_iter().collect();
        let undo = PoolChange::release_vccs(claimed.iter().copied());
        self.enqueue(
            "AssignResources",
            |id| Job::Assign {
                id,
                receptors,
                claimed,
            },
            undo,
        )
        .await
    }

    /// Release the listed receptors, or all of them when `receptor_ids` is
    /// absent.
    pub async fn release_resources(&self, document: &str) -> Result<(CommandStatus, CommandId)> {
        let value = self.check_interface(document, "releaseresources")?;
        let request: ResourcesDocument = serde_json::from_value(value)
            .map_err(|err| CbfError::Validation(format!("releaseresources: {err}")))?;
        self.check_subarray(request.subarray_id)?;

        let receptors = {
            let state = self.core.state.lock().await;
            state.machine.check(ObsTrigger::ReleaseResources)?;
            match request.receptor_ids {
                Some(wanted) => {
                    if let Some(stray) = wanted.iter().find(|r| !state.receptors.contains(r)) {
                        return Err(CbfError::Validation(format!(
                            "receptor {stray} is not assigned to {}",
                            self.core.name
                        )));
                    }
                    wanted
                }
                None => state.receptors.iter().cloned().collect(),
            }
        };
        self.enqueue(
            "ReleaseResources",
            |id| Job::Release { id, receptors },
            PoolChange::default(),
        )
        .await
    }

    pub async fn release_all_resources(&self) -> Result<(CommandStatus, CommandId)> {
        let document = serde_json::json!({
            "interface": self
                .validator
                .accepted_versions("releaseresources")
                .last()
                .cloned()
                .unwrap_or_default(),
        });
        self.release_resources(&document.to_string()).await
    }

    fn check_subarray(&self, subarray_id: Option<i64>) -> Result<()> {
        match subarray_id {
            Some(id) if id != i64::from(self.core.subarray) => Err(CbfError::Validation(
                format!("document addresses subarray {id}, this is {}", self.core.subarray),
            )),
            _ => Ok(()),
        }
    }

    /// Build and register the FSP assignment, then configure every resource.
    pub async fn configure_scan(&self, document: &str) -> Result<(CommandStatus, CommandId)> {
        let mut value = self.check_interface(document, "configurescan")?;
        let mode: ProcessingMode = value
            .get("function_mode")
            .and_then(Value::as_str)
            .ok_or_else(|| CbfError::Validation("function_mode is required".to_string()))?
            .parse()
            .map_err(CbfError::from)?;

        let receptors = {
            let state = self.core.state.lock().await;
            state.machine.check(ObsTrigger::ConfigureScan)?;
            state.receptors.clone()
        };
        match value.get("receptor_ids") {
            None => {
                value["receptor_ids"] = serde_json::to_value(&receptors)?;
            }
            Some(listed) => {
                let listed: Vec<ReceptorId> = serde_json::from_value(listed.clone())
                    .map_err(|err| CbfError::Validation(format!("receptor_ids: {err}")))?;
                if let Some(stray) = listed.iter().find(|r| !receptors.contains(r)) {
                    return Err(CbfError::Validation(format!(
                        "receptor {stray} is not assigned to {}",
                        self.core.name
                    )));
                }
            }
        }

        let mut builder = AssignmentBuilder::new(
            Arc::clone(&self.core.pool),
            self.partitioner,
            self.core.subarray,
        );
        builder.set_mode(mode).set_config(value);
        let assignment = builder.build().await?;
        info!(
            device = %self.core.name,
            config_id = %assignment.config_id,
            fsps = ?assignment.fsp_ids(),
            "scan assignment registered"
        );

        let undo = PoolChange::release_fsps(assignment.fsp_ids());
        self.enqueue(
            "ConfigureScan",
            |id| Job::Configure { id, assignment },
            undo,
        )
        .await
    }

    pub async fn scan(&self, document: &str) -> Result<(CommandStatus, CommandId)> {
        let value = self.check_interface(document, "scan")?;
        let request: ScanDocument = serde_json::from_value(value)
            .map_err(|err| CbfError::Validation(format!("scan: {err}")))?;
        self.check_state(ObsTrigger::Scan).await?;
        let scan_id = ScanId(request.scan_id);
        self.enqueue("Scan", |id| Job::Scan { id, scan_id }, PoolChange::default())
            .await
    }

    pub async fn end_scan(&self) -> Result<(CommandStatus, CommandId)> {
        self.check_state(ObsTrigger::EndScan).await?;
        self.enqueue("EndScan", |id| Job::EndScan { id }, PoolChange::default())
            .await
    }

    pub async fn go_to_idle(&self) -> Result<(CommandStatus, CommandId)> {
        self.check_state(ObsTrigger::GoToIdle).await?;
        self.enqueue("GoToIdle", |id| Job::GoToIdle { id }, PoolChange::default())
            .await
    }

    pub async fn obs_reset(&self) -> Result<(CommandStatus, CommandId)> {
        self.check_state(ObsTrigger::ObsReset).await?;
        self.enqueue("ObsReset", |id| Job::ObsReset { id }, PoolChange::default())
            .await
    }

    pub async fn restart(&self) -> Result<(CommandStatus, CommandId)> {
        self.check_state(ObsTrigger::Restart).await?;
        self.enqueue("Restart", |id| Job::Restart { id }, PoolChange::default())
            .await
    }

    /// Enter ABORTING now. Queued commands are aborted, the running one
    /// stops at its next remote-call checkpoint, and the worker then aborts
    /// the subarray's resources before anything else it has queued.
    ///
    /// The Abort command takes the tracker's reserved slot, so a full queue
    /// never strands the device in ABORTING.
    pub async fn abort(&self) -> Result<(CommandStatus, CommandId)> {
        self.core.transition(ObsTrigger::Abort).await?;
        self.core.manager.on_abort_requested();
        match self.core.tracker.abort_queued("aborted by Abort") {
            Ok(aborted) if !aborted.is_empty() => info!(
                device = %self.core.name,
                count = aborted.len(),
                "queued commands aborted"
            ),
            Ok(_) => {}
            Err(err) => {
                warn!(device = %self.core.name, error = %err, "could not abort queued commands")
            }
        }

        let id = match self.core.tracker.submit_reserved("Abort") {
            Ok(Submission::Queued(id)) => id,
            Ok(Submission::Rejected(id)) => {
                let err = CbfError::Internal(format!("no queue slot left for {id}"));
                self.core.fault(&err).await;
                return Ok((CommandStatus::Rejected, id));
            }
            Err(err) => {
                self.core.fault(&err).await;
                return Err(err);
            }
        };
        if let Err(err) = self.aborts.try_send(id.clone()) {
            let err = CbfError::Internal(format!("device worker is not running: {err}"));
            let result = CommandResult::new(ResultCode::Failed, err.to_string());
            if let Err(advance) =
                self.core
                    .tracker
                    .advance(&id, CommandStatus::Failed, None, Some(result))
            {
                warn!(command_id = %id, error = %advance, "could not record Abort failure");
            }
            self.core.fault(&err).await;
            return Err(err);
        }
        Ok((CommandStatus::Queued, id))
    }

    pub fn obs_state(&self) -> ObsState {
        *self.core.obs_tx.borrow()
    }

    pub fn subscribe_obs_state(&self) -> watch::Receiver<ObsState> {
        self.core.obs_tx.subscribe()
    }

    /// Wait until the device reports `wanted`, for at most `limit`.
    pub async fn wait_for_obs_state(&self, wanted: ObsState, limit: Duration) -> Result<()> {
        let mut rx = self.subscribe_obs_state();
        match tokio::time::timeout(limit, rx.wait_for(|state| *state == wanted)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(CbfError::Internal("device dropped".to_string())),
            Err(_) => Err(CbfError::Internal(format!(
                "{} did not reach {wanted} within {} ms (currently {})",
                self.core.name,
                limit.as_millis(),
                self.obs_state()
            ))),
        }
    }

    pub fn subscribe_commands(&self) -> broadcast::Receiver<CommandEvent> {
        self.core.tracker.subscribe()
    }

    pub fn commands_in_queue(&self) -> Vec<String> {
        self.core.tracker.command_names()
    }

    pub fn command_ids(&self) -> Vec<String> {
        self.core.tracker.command_ids()
    }

    pub fn command_status(&self) -> Vec<(String, CommandStatus)> {
        self.core.tracker.command_statuses()
    }

    pub fn command_progress(&self) -> Vec<(String, u8)> {
        self.core.tracker.command_progress()
    }

    /// Result of the most recently finished command.
    pub fn command_result(&self) -> Option<(CommandId, CommandResult)> {
        self.core.tracker.last_result()
    }

    pub async fn receptors(&self) -> BTreeSet<ReceptorId> {
        self.core.state.lock().await.receptors.clone()
    }

    pub async fn assignment(&self) -> Option<Assignment> {
        self.core.state.lock().await.assignment.clone()
    }

    pub async fn frequency_slice_id(&self, fsp: FspId) -> Option<u32> {
        self.core
            .state
            .lock()
            .await
            .assignment
            .as_ref()
            .and_then(|assignment| assignment.frequency_slice_id(fsp))
    }

    pub async fn output_link_map(&self, fsp: FspId) -> Option<Vec<(u32, u32)>> {
        self.core
            .state
            .lock()
            .await
            .assignment
            .as_ref()
            .and_then(|assignment| assignment.output_link_map(fsp))
            .map(<[(u32, u32)]>::to_vec)
    }

    pub async fn resource_state(&self) -> ResourceState {
        ResourceState {
            obs_state: self.obs_state(),
            communication_status: self.core.manager.communication_status().await,
            health: self.core.manager.health_state().await,
            faulted: self.core.manager.is_faulted(),
        }
    }
}

async fn run_worker(
    core: Arc<DeviceCore>,
    mut jobs: mpsc::Receiver<Job>,
    mut aborts: mpsc::Receiver<CommandId>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(id) = aborts.recv() => core.run_abort(id).await,
            Some(job) = jobs.recv() => core.run_job(job).await,
        }
    }
    debug!(device = %core.name, "device worker stopped");
}
