use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cbf_model::{
    CommandStatus, CommunicationStatus, HealthState, ObsState, ResultCode,
};
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, warn};

use crate::command::{CommandId, CommandResult, CommandTracker, Submission};
use crate::config::{ControllerConfig, RemoteCallConfig, RetryConfig};
use crate::error::{CbfError, Result};
use crate::manager::health::{self, LinkHealth};
use crate::manager::proxy::{ProxyCommand, RemoteReply, ResourceProxy};

/// Called whenever a link's communication status changes.
pub type StatusCallback = Arc<dyn Fn(&str, CommunicationStatus) + Send + Sync>;

/// Called when a remote failure faults the manager.
pub type FaultCallback = Arc<dyn Fn(&str, &CbfError) + Send + Sync>;

struct Link {
    proxy: Arc<dyn ResourceProxy>,
    status: CommunicationStatus,
    health: HealthState,
}

/// One step of a batch: a command for one resource.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchCall {
    pub resource: String,
    pub command: ProxyCommand,
}

impl BatchCall {
    pub fn new(resource: impl Into<String>, command: ProxyCommand) -> Self {
        Self {
            resource: resource.into(),
            command,
        }
    }
}

/// How far a batch got. Acknowledged calls stay committed in every case.
#[derive(Debug)]
pub enum BatchOutcome {
    Completed {
        acknowledged: Vec<String>,
    },
    Failed {
        acknowledged: Vec<String>,
        resource: String,
        error: CbfError,
    },
    Aborted {
        acknowledged: Vec<String>,
        skipped: Vec<String>,
    },
}

impl BatchOutcome {
    pub fn acknowledged(&self) -> &[String] {
        match self {
            BatchOutcome::Completed { acknowledged }
            | BatchOutcome::Failed { acknowledged, .. }
            | BatchOutcome::Aborted { acknowledged, .. } => acknowledged,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, BatchOutcome::Completed { .. })
    }

    pub fn into_result(self) -> Result<Vec<String>> {
        match self {
            BatchOutcome::Completed { acknowledged } => Ok(acknowledged),
            BatchOutcome::Failed { error, .. } => Err(error),
            BatchOutcome::Aborted { skipped, .. } => {
                Err(CbfError::AbortRequested(format!(
                    "{} call(s) not dispatched",
                    skipped.len()
                )))
            }
        }
    }
}

/// Owns the links to subordinate resources and issues commands over them.
///
/// Remote calls go through the manager's own [`CommandTracker`], so the
/// outgoing queue can be inspected like any device queue.
pub struct ComponentManager {
    name: String,
    remote: RemoteCallConfig,
    retry: RetryConfig,
    max_bit_error_rate: f64,
    links: RwLock<BTreeMap<String, Link>>,
    tracker: CommandTracker,
    abort_token: Mutex<CancellationToken>,
    faulted: AtomicBool,
    on_status: Option<StatusCallback>,
    on_fault: Option<FaultCallback>,
}

impl fmt::Debug for ComponentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link_count = self
            .links
            .try_read()
            .map(|links| links.len())
            .unwrap_or_default();
        f.debug_struct("ComponentManager")
            .field("name", &self.name)
            .field("remote", &self.remote)
            .field("retry", &self.retry)
            .field("link_count", &link_count)
            .field("tracker", &self.tracker)
            .field("faulted", &self.faulted.load(Ordering::Relaxed))
            .finish()
    }
}

impl ComponentManager {
    pub fn new(name: impl Into<String>, config: &ControllerConfig) -> Self {
        Self {
            name: name.into(),
            remote: config.remote,
            retry: config.retry,
            max_bit_error_rate: config.links.max_bit_error_rate,
            links: RwLock::new(BTreeMap::new()),
            tracker: CommandTracker::new(&config.commands),
            abort_token: Mutex::new(CancellationToken::new()),
            faulted: AtomicBool::new(false),
            on_status: None,
            on_fault: None,
        }
    }

    pub fn with_status_callback(mut self, callback: StatusCallback) -> Self {
        self.on_status = Some(callback);
        self
    }

    pub fn with_fault_callback(mut self, callback: FaultCallback) -> Self {
        self.on_fault = Some(callback);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Outgoing remote calls.
    pub fn tracker(&self) -> &CommandTracker {
        &self.tracker
    }

    pub async fn add_link(&self, proxy: Arc<dyn ResourceProxy>) {
        let id = proxy.resource_id().to_string();
        self.links.write().await.insert(
            id,
            Link {
                proxy,
                status: CommunicationStatus::NotEstablished,
                health: HealthState::Unknown,
            },
        );
    }

    pub async fn resource_ids(&self) -> Vec<String> {
        self.links.read().await.keys().cloned().collect()
    }

    pub async fn link_status(&self, resource: &str) -> Option<CommunicationStatus> {
        self.links.read().await.get(resource).map(|link| link.status)
    }

    async fn set_link_status(&self, resource: &str, status: CommunicationStatus) {
        let changed = {
            let mut links = self.links.write().await;
            match links.get_mut(resource) {
                Some(link) if link.status != status => {
                    link.status = status;
                    true
                }
                _ => false,
            }
        };
        if changed {
            info!(
                manager = %self.name,
                resource,
                status = %status,
                "communication status changed"
            );
            if let Some(callback) = &self.on_status {
                callback(resource, status);
            }
        }
    }

    /// Handshake with every link. Failures disable the link and are only
    /// reported through the status callback.
    pub async fn start_communicating(&self) -> CommunicationStatus {
        let proxies: Vec<(String, Arc<dyn ResourceProxy>)> = self
            .links
            .read()
            .await
            .iter()
            .map(|(id, link)| (id.clone(), Arc::clone(&link.proxy)))
            .collect();

        let handshake_timeout = self.remote.handshake_timeout();
        let handshakes = proxies.into_iter().map(|(id, proxy)| async move {
            let status =
                match tokio::time::timeout(handshake_timeout, proxy.state()).await {
                    Ok(Ok(state)) => {
                        debug!(resource = %id, obs_state = %state, "handshake ok");
                        CommunicationStatus::Established
                    }
                    Ok(Err(err)) => {
                        warn!(resource = %id, error = %err, "handshake failed");
                        CommunicationStatus::Disabled
                    }
                    Err(_) => {
                        warn!(
                            resource = %id,
                            timeout_ms = handshake_timeout.as_millis() as u64,
                            "handshake timed out"
                        );
                        CommunicationStatus::Disabled
                    }
                };
            (id, status)
        });

        for (id, status) in join_all(handshakes).await {
            self.set_link_status(&id, status).await;
        }
        self.communication_status().await
    }

    /// Disconnect every link. Cleanup failures are logged and never stop
    /// the shutdown.
    pub async fn stop_communicating(&self) {
        let proxies: Vec<(String, Arc<dyn ResourceProxy>)> = self
            .links
            .read()
            .await
            .iter()
            .map(|(id, link)| (id.clone(), Arc::clone(&link.proxy)))
            .collect();

        for (id, proxy) in proxies {
            if let Err(err) = proxy.disconnect().await {
                warn!(
                    manager = %self.name,
                    resource = %id,
                    error = %err,
                    "cleanup failed during disconnect"
                );
            }
            self.set_link_status(&id, CommunicationStatus::Disabled).await;
        }
    }

    /// ESTABLISHED only when every link is; DISABLED when every link is.
    pub async fn communication_status(&self) -> CommunicationStatus {
        let links = self.links.read().await;
        if links.is_empty() {
            return CommunicationStatus::NotEstablished;
        }
        let all = |wanted: CommunicationStatus| links.values().all(|link| link.status == wanted);
        if all(CommunicationStatus::Established) {
            CommunicationStatus::Established
        } else if all(CommunicationStatus::Disabled) {
            CommunicationStatus::Disabled
        } else {
            CommunicationStatus::NotEstablished
        }
    }

    /// Observation state reported by one resource.
    pub async fn resource_state(&self, resource: &str) -> Result<ObsState> {
        let proxy = {
            let links = self.links.read().await;
            let link = links.get(resource).ok_or_else(|| {
                CbfError::NotFound(format!("no link to {resource}"))
            })?;
            Arc::clone(&link.proxy)
        };
        let call_timeout = self.remote.call_timeout();
        match tokio::time::timeout(call_timeout, proxy.state()).await {
            Ok(state) => state,
            Err(_) => Err(CbfError::RemoteCommand {
                resource: resource.to_string(),
                command: "State".to_string(),
                reason: format!("timed out after {} ms", call_timeout.as_millis()),
                transient: true,
            }),
        }
    }

    pub async fn report_link_health(
        &self,
        resource: &str,
        report: LinkHealth,
    ) -> Result<HealthState> {
        let health = report.classify(self.max_bit_error_rate);
        {
            let mut links = self.links.write().await;
            let link = links.get_mut(resource).ok_or_else(|| {
                CbfError::NotFound(format!("no link to {resource}"))
            })?;
            link.health = health;
        }
        if health != HealthState::Ok {
            warn!(
                manager = %self.name,
                resource,
                health = %health,
                bit_error_rate = report.bit_error_rate,
                "link health degraded"
            );
        }
        Ok(self.health_state().await)
    }

    pub async fn health_state(&self) -> HealthState {
        if self.is_faulted() {
            return HealthState::Failed;
        }
        let links = self.links.read().await;
        health::worst(links.values().map(|link| link.health))
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    pub fn clear_fault(&self) {
        self.faulted.store(false, Ordering::SeqCst);
    }

    /// Token observed by batches started from now on.
    pub fn cancellation(&self) -> CancellationToken {
        self.abort_token
            .lock()
            .map(|token| token.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Ask in-flight batches to stop at their next checkpoint.
    pub fn on_abort_requested(&self) {
        let token = self.cancellation();
        info!(manager = %self.name, "abort requested");
        token.cancel();
    }

    /// Install a fresh token after an abort has been handled.
    pub fn reset_cancellation(&self) {
        let mut guard = self
            .abort_token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_cancelled() {
            *guard = CancellationToken::new();
        }
    }

    fn track(
        &self,
        id: &CommandId,
        status: CommandStatus,
        result: Option<CommandResult>,
    ) {
        if let Err(err) = self.tracker.advance(id, status, None, result) {
            warn!(command_id = %id, error = %err, "tracker update failed");
        }
    }

    fn skip_all(
        &self,
        pending: impl IntoIterator<Item = (CommandId, BatchCall)>,
        reason: &str,
    ) -> Vec<String> {
        pending
            .into_iter()
            .map(|(id, call)| {
                self.track(
                    &id,
                    CommandStatus::Aborted,
                    Some(CommandResult::new(ResultCode::Aborted, reason)),
                );
                call.resource
            })
            .collect()
    }

    /// Dispatch `calls` in order, stopping at the first failure or at the
    /// first checkpoint after `cancel` fires.
    pub async fn issue_batch(
        &self,
        calls: Vec<BatchCall>,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let mut pending = Vec::with_capacity(calls.len());
        for call in calls {
            match self.tracker.submit(call.command.name()) {
                Ok(Submission::Queued(id)) => pending.push((id, call)),
                Ok(Submission::Rejected(_)) | Err(_) => {
                    self.skip_all(pending, "batch rejected");
                    return BatchOutcome::Failed {
                        acknowledged: Vec::new(),
                        resource: call.resource,
                        error: CbfError::QueueFull {
                            capacity: self.tracker.capacity(),
                        },
                    };
                }
            }
        }

        let mut acknowledged = Vec::new();
        let mut remaining = pending.into_iter();
        while let Some((id, call)) = remaining.next() {
            if cancel.is_cancelled() {
                let skipped = self.skip_all(
                    std::iter::once((id, call)).chain(remaining),
                    "abort requested",
                );
                info!(
                    manager = %self.name,
                    acknowledged = acknowledged.len(),
                    skipped = skipped.len(),
                    "batch stopped at checkpoint"
                );
                return BatchOutcome::Aborted {
                    acknowledged,
                    skipped,
                };
            }

            self.track(&id, CommandStatus::InProgress, None);
            match self.dispatch(&call, cancel).await {
                Ok(message) => {
                    self.track(
                        &id,
                        CommandStatus::Completed,
                        Some(CommandResult::new(ResultCode::Ok, message)),
                    );
                    acknowledged.push(call.resource);
                }
                Err(error @ CbfError::AbortRequested(_)) => {
                    self.track(
                        &id,
                        CommandStatus::Aborted,
                        Some(CommandResult::new(
                            ResultCode::Aborted,
                            error.to_string(),
                        )),
                    );
                    let mut skipped = vec![call.resource];
                    skipped.extend(self.skip_all(remaining, "abort requested"));
                    return BatchOutcome::Aborted {
                        acknowledged,
                        skipped,
                    };
                }
                Err(error) => {
                    self.track(
                        &id,
                        CommandStatus::Failed,
                        Some(CommandResult::new(
                            ResultCode::Failed,
                            error.to_string(),
                        )),
                    );
                    let reason = format!("skipped after {} failed", call.resource);
                    self.skip_all(remaining, &reason);
                    self.record_failure(&call.resource, &error).await;
                    return BatchOutcome::Failed {
                        acknowledged,
                        resource: call.resource,
                        error,
                    };
                }
            }
        }

        BatchOutcome::Completed { acknowledged }
    }

    async fn record_failure(&self, resource: &str, error: &CbfError) {
        if error.is_retryable() {
            // retry budget exhausted
            self.set_link_status(resource, CommunicationStatus::NotEstablished)
                .await;
        }
        self.faulted.store(true, Ordering::SeqCst);
        warn!(
            manager = %self.name,
            resource,
            error = %error,
            "remote failure; manager faulted"
        );
        if let Some(callback) = &self.on_fault {
            callback(resource, error);
        }
    }

    async fn proxy_for(&self, call: &BatchCall) -> Result<Arc<dyn ResourceProxy>> {
        let links = self.links.read().await;
        let link = links.get(&call.resource).ok_or_else(|| {
            CbfError::NotFound(format!("no link to {}", call.resource))
        })?;
        if link.status != CommunicationStatus::Established {
            return Err(CbfError::RemoteCommand {
                resource: call.resource.clone(),
                command: call.command.name().to_string(),
                reason: format!("link is {}", link.status),
                transient: false,
            });
        }
        Ok(Arc::clone(&link.proxy))
    }

    async fn dispatch(
        &self,
        call: &BatchCall,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let proxy = self.proxy_for(call).await?;
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let span = debug_span!(
                "dispatch",
                resource = %call.resource,
                command = %call.command,
                attempt
            );
            match self
                .call_once(proxy.as_ref(), call)
                .instrument(span)
                .await
            {
                Ok(message) => return Ok(message),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        resource = %call.resource,
                        command = %call.command,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "remote call failed; retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(CbfError::AbortRequested(format!(
                                "{} on {} abandoned before retry",
                                call.command, call.resource
                            )));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call_once(
        &self,
        proxy: &dyn ResourceProxy,
        call: &BatchCall,
    ) -> Result<String> {
        let failure = |reason: String, transient: bool| CbfError::RemoteCommand {
            resource: call.resource.clone(),
            command: call.command.name().to_string(),
            reason,
            transient,
        };

        let call_timeout = self.remote.call_timeout();
        let exchange = async {
            match proxy.execute(&call.command).await? {
                RemoteReply::Queued { command_id } => {
                    debug!(remote_command_id = %command_id, "awaiting completion");
                    proxy.wait_for_result(&command_id).await
                }
                done => Ok(done),
            }
        };
        let reply = match tokio::time::timeout(call_timeout, exchange).await {
            Ok(reply) => reply?,
            Err(_) => {
                return Err(failure(
                    format!("timed out after {} ms", call_timeout.as_millis()),
                    true,
                ));
            }
        };

        match reply {
            RemoteReply::Done { code, message } if code.is_success() => {
                debug!("remote call completed");
                Ok(message)
            }
            RemoteReply::Done { code, message } => {
                Err(failure(format!("{code:?}: {message}"), false))
            }
            RemoteReply::Queued { command_id } => Err(failure(
                format!("completion of {command_id} reported as queued"),
                false,
            )),
        }
    }
}
