use std::fmt;

/// Life cycle of a tracked long-running command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "SCREAMING_SNAKE_CASE")
)]
pub enum CommandStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Aborted,
    Rejected,
}

impl CommandStatus {
    /// Terminal statuses remove the command from its queue.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed
                | CommandStatus::Failed
                | CommandStatus::Aborted
                | CommandStatus::Rejected
        )
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CommandStatus::Queued => "QUEUED",
            CommandStatus::InProgress => "IN_PROGRESS",
            CommandStatus::Completed => "COMPLETED",
            CommandStatus::Failed => "FAILED",
            CommandStatus::Aborted => "ABORTED",
            CommandStatus::Rejected => "REJECTED",
        };
        f.write_str(label)
    }
}

/// Immediate result code returned by a resource proxy call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "SCREAMING_SNAKE_CASE")
)]
pub enum ResultCode {
    Ok,
    Started,
    Queued,
    Failed,
    Rejected,
    Aborted,
    NotAllowed,
}

impl ResultCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Ok)
    }
}
