use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use cbf_model::{CommandStatus, ResultCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CommandQueueConfig;
use crate::error::{CbfError, Result};

/// Identifier of a submitted command: a time-ordered UUID plus the command
/// name, rendered as `<uuid>_<name>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId {
    id: Uuid,
    name: String,
}

impl CommandId {
    fn generate(name: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.to_string(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.id, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub code: ResultCode,
    pub message: String,
}

impl CommandResult {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: CommandId,
    pub status: CommandStatus,
    pub progress: u8,
    pub result: Option<CommandResult>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One status change, as published on the tracker's event channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEvent {
    pub id: CommandId,
    pub status: CommandStatus,
    pub progress: u8,
    pub result: Option<CommandResult>,
    pub at: DateTime<Utc>,
}

/// Outcome of [`CommandTracker::submit`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Submission {
    Queued(CommandId),
    Rejected(CommandId),
}

impl Submission {
    pub fn id(&self) -> &CommandId {
        match self {
            Submission::Queued(id) | Submission::Rejected(id) => id,
        }
    }

    pub fn status(&self) -> CommandStatus {
        match self {
            Submission::Queued(_) => CommandStatus::Queued,
            Submission::Rejected(_) => CommandStatus::Rejected,
        }
    }
}

struct TrackerState {
    queue: VecDeque<CommandRecord>,
    last_result: Option<(CommandId, CommandResult)>,
}

/// Bounded FIFO of unfinished commands for one device.
///
/// Entries leave the queue when they reach a terminal status. Every change
/// is published as a [`CommandEvent`].
pub struct CommandTracker {
    capacity: usize,
    state: Mutex<TrackerState>,
    events: broadcast::Sender<CommandEvent>,
}

impl fmt::Debug for CommandTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let depth = self
            .state
            .lock()
            .ok()
            .map(|state| state.queue.len())
            .unwrap_or(0);
        f.debug_struct("CommandTracker")
            .field("capacity", &self.capacity)
            .field("depth", &depth)
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

fn transition_allowed(from: CommandStatus, to: CommandStatus) -> bool {
    use CommandStatus::*;
    match from {
        Queued => to != Queued,
        InProgress => matches!(to, InProgress | Completed | Failed | Aborted),
        Completed | Failed | Aborted | Rejected => false,
    }
}

impl CommandTracker {
    pub fn new(config: &CommandQueueConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            capacity: config.queue_capacity,
            state: Mutex::new(TrackerState {
                queue: VecDeque::with_capacity(config.queue_capacity),
                last_result: None,
            }),
            events,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(&CommandQueueConfig {
            queue_capacity: capacity,
            ..CommandQueueConfig::default()
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CommandEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, TrackerState>> {
        self.state
            .lock()
            .map_err(|_| CbfError::Internal("command tracker lock poisoned".into()))
    }

    fn publish(&self, event: CommandEvent) {
        let _ = self.events.send(event);
    }

    /// Enqueue `name` as QUEUED, or reject it when the queue is full.
    pub fn submit(&self, name: &str) -> Result<Submission> {
        self.admit(name, self.capacity)
    }

    /// Like [`submit`](Self::submit), with one slot beyond the capacity that
    /// ordinary commands never use. Abort goes through here.
    pub fn submit_reserved(&self, name: &str) -> Result<Submission> {
        self.admit(name, self.capacity.saturating_add(1))
    }

    fn admit(&self, name: &str, limit: usize) -> Result<Submission> {
        let id = CommandId::generate(name);
        let now = Utc::now();
        let mut state = self.lock()?;

        if state.queue.len() >= limit {
            let result = CommandResult::new(
                ResultCode::Rejected,
                format!("command queue full ({} commands)", state.queue.len()),
            );
            state.last_result = Some((id.clone(), result.clone()));
            drop(state);
            warn!(command_id = %id, capacity = limit, "command rejected: queue full");
            self.publish(CommandEvent {
                id: id.clone(),
                status: CommandStatus::Rejected,
                progress: 0,
                result: Some(result),
                at: now,
            });
            return Ok(Submission::Rejected(id));
        }

        state.queue.push_back(CommandRecord {
            id: id.clone(),
            status: CommandStatus::Queued,
            progress: 0,
            result: None,
            submitted_at: now,
            updated_at: now,
        });
        drop(state);
        debug!(command_id = %id, "command queued");
        self.publish(CommandEvent {
            id: id.clone(),
            status: CommandStatus::Queued,
            progress: 0,
            result: None,
            at: now,
        });
        Ok(Submission::Queued(id))
    }

    /// Move a command to `status`. Terminal statuses remove it from the
    /// queue and record its result as the device's last result.
    pub fn advance(
        &self,
        id: &CommandId,
        status: CommandStatus,
        progress: Option<u8>,
        result: Option<CommandResult>,
    ) -> Result<CommandRecord> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let index = state
            .queue
            .iter()
            .position(|record| &record.id == id)
            .ok_or_else(|| CbfError::NotFound(format!("command {id}")))?;

        let record = &mut state.queue[index];
        if !transition_allowed(record.status, status) {
            return Err(CbfError::StatusTransition {
                from: record.status,
                to: status,
            });
        }
        record.status = status;
        record.updated_at = now;
        if status == CommandStatus::Completed {
            record.progress = 100;
        } else if let Some(progress) = progress {
            record.progress = progress.min(100);
        }
        if result.is_some() {
            record.result = result;
        }
        let snapshot = record.clone();

        if status.is_terminal() {
            state.queue.remove(index);
            if let Some(result) = &snapshot.result {
                state.last_result = Some((snapshot.id.clone(), result.clone()));
            }
        }
        drop(state);

        debug!(
            command_id = %snapshot.id,
            status = %snapshot.status,
            progress = snapshot.progress,
            "command advanced"
        );
        self.publish(CommandEvent {
            id: snapshot.id.clone(),
            status: snapshot.status,
            progress: snapshot.progress,
            result: snapshot.result.clone(),
            at: now,
        });
        Ok(snapshot)
    }

    /// Abort every command that has not started yet. Returns their ids,
    /// oldest first.
    pub fn abort_queued(&self, reason: &str) -> Result<Vec<CommandId>> {
        let pending: Vec<CommandId> = self
            .lock()?
            .queue
            .iter()
            .filter(|record| record.status == CommandStatus::Queued)
            .map(|record| record.id.clone())
            .collect();
        for id in &pending {
            self.advance(
                id,
                CommandStatus::Aborted,
                None,
                Some(CommandResult::new(ResultCode::Aborted, reason)),
            )?;
        }
        Ok(pending)
    }

    pub fn get(&self, id: &CommandId) -> Option<CommandRecord> {
        self.state
            .lock()
            .ok()?
            .queue
            .iter()
            .find(|record| &record.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.queue.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn view<T>(&self, f: impl Fn(&CommandRecord) -> T) -> Vec<T> {
        self.state
            .lock()
            .map(|state| state.queue.iter().map(&f).collect())
            .unwrap_or_default()
    }

    /// Names of unfinished commands, oldest first.
    pub fn command_names(&self) -> Vec<String> {
        self.view(|record| record.id.name().to_string())
    }

    pub fn command_ids(&self) -> Vec<String> {
        self.view(|record| record.id.to_string())
    }

    pub fn command_statuses(&self) -> Vec<(String, CommandStatus)> {
        self.view(|record| (record.id.to_string(), record.status))
    }

    pub fn command_progress(&self) -> Vec<(String, u8)> {
        self.view(|record| (record.id.to_string(), record.progress))
    }

    pub fn last_result(&self) -> Option<(CommandId, CommandResult)> {
        self.state.lock().ok()?.last_result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(submission: Submission) -> CommandId {
        match submission {
            Submission::Queued(id) => id,
            Submission::Rejected(id) => panic!("{id} unexpectedly rejected"),
        }
    }

    #[test]
    fn full_queue_rejects_and_keeps_fifo_order() {
        let tracker = CommandTracker::with_capacity(3);
        for name in ["Scan", "EndScan", "GoToIdle"] {
            queued(tracker.submit(name).unwrap());
        }

        let overflow = tracker.submit("Abort").unwrap();
        assert!(matches!(overflow, Submission::Rejected(_)));
        assert_eq!(overflow.status(), CommandStatus::Rejected);
        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.command_names(), vec!["Scan", "EndScan", "GoToIdle"]);

        let (last_id, last) = tracker.last_result().unwrap();
        assert_eq!(&last_id, overflow.id());
        assert_eq!(last.code, ResultCode::Rejected);
    }

    #[test]
    fn terminal_status_dequeues() {
        let tracker = CommandTracker::with_capacity(4);
        let first = queued(tracker.submit("ConfigureScan").unwrap());
        let second = queued(tracker.submit("Scan").unwrap());

        tracker
            .advance(&first, CommandStatus::InProgress, Some(40), None)
            .unwrap();
        assert_eq!(
            tracker.command_progress(),
            vec![(first.to_string(), 40), (second.to_string(), 0)]
        );

        let done = tracker
            .advance(
                &first,
                CommandStatus::Completed,
                None,
                Some(CommandResult::new(ResultCode::Ok, "configured")),
            )
            .unwrap();
        assert_eq!(done.progress, 100);
        assert_eq!(tracker.command_ids(), vec![second.to_string()]);
        assert_eq!(tracker.last_result().unwrap().0, first);

        let err = tracker
            .advance(&first, CommandStatus::InProgress, None, None)
            .unwrap_err();
        assert!(matches!(err, CbfError::NotFound(_)));
    }

    #[test]
    fn illegal_transitions_are_refused() {
        let tracker = CommandTracker::with_capacity(2);
        let id = queued(tracker.submit("Scan").unwrap());
        tracker
            .advance(&id, CommandStatus::InProgress, None, None)
            .unwrap();

        let err = tracker
            .advance(&id, CommandStatus::Queued, None, None)
            .unwrap_err();
        assert!(matches!(err, CbfError::StatusTransition { .. }));
        assert_eq!(
            tracker.command_statuses(),
            vec![(id.to_string(), CommandStatus::InProgress)]
        );
    }

    #[test]
    fn abort_queued_leaves_running_command() {
        let tracker = CommandTracker::with_capacity(4);
        let running = queued(tracker.submit("ConfigureScan").unwrap());
        let waiting = queued(tracker.submit("Scan").unwrap());
        tracker
            .advance(&running, CommandStatus::InProgress, None, None)
            .unwrap();

        let aborted = tracker.abort_queued("abort requested").unwrap();
        assert_eq!(aborted, vec![waiting]);
        assert_eq!(tracker.command_ids(), vec![running.to_string()]);
    }

    #[test]
    fn reserved_slot_admits_one_more_command() {
        let tracker = CommandTracker::with_capacity(1);
        let running = queued(tracker.submit("AssignResources").unwrap());
        tracker
            .advance(&running, CommandStatus::InProgress, None, None)
            .unwrap();
        assert!(matches!(
            tracker.submit("Abort").unwrap(),
            Submission::Rejected(_)
        ));

        let abort = queued(tracker.submit_reserved("Abort").unwrap());
        assert_eq!(
            tracker.command_ids(),
            vec![running.to_string(), abort.to_string()]
        );
        assert!(matches!(
            tracker.submit_reserved("Abort").unwrap(),
            Submission::Rejected(_)
        ));
    }

    #[test]
    fn ids_are_unique_and_carry_the_name() {
        let tracker = CommandTracker::with_capacity(8);
        let a = queued(tracker.submit("Scan").unwrap());
        let b = queued(tracker.submit("Scan").unwrap());
        assert_ne!(a, b);
        assert!(a.to_string().ends_with("_Scan"));
        assert!(a.uuid() < b.uuid());
    }

    #[tokio::test]
    async fn events_follow_each_transition() {
        let tracker = CommandTracker::with_capacity(2);
        let mut events = tracker.subscribe();
        let id = queued(tracker.submit("EndScan").unwrap());
        tracker
            .advance(&id, CommandStatus::InProgress, None, None)
            .unwrap();
        tracker
            .advance(&id, CommandStatus::Failed, None, None)
            .unwrap();

        let statuses: Vec<CommandStatus> = [
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|event| event.status)
        .collect();
        assert_eq!(
            statuses,
            vec![
                CommandStatus::Queued,
                CommandStatus::InProgress,
                CommandStatus::Failed
            ]
        );
    }
}
