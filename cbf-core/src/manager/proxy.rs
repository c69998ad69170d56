use std::fmt;

use async_trait::async_trait;
use cbf_model::{ObsState, ResultCode, ScanId, SubarrayId};
use serde_json::Value;

use crate::error::Result;

/// Commands every subordinate resource accepts.
#[derive(Clone, Debug, PartialEq)]
pub enum ProxyCommand {
    ConfigureScan(Value),
    Scan(ScanId),
    EndScan,
    GoToIdle,
    Abort,
    ObsReset,
    AddMembership(SubarrayId),
    RemoveMembership(SubarrayId),
}

impl ProxyCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ProxyCommand::ConfigureScan(_) => "ConfigureScan",
            ProxyCommand::Scan(_) => "Scan",
            ProxyCommand::EndScan => "EndScan",
            ProxyCommand::GoToIdle => "GoToIdle",
            ProxyCommand::Abort => "Abort",
            ProxyCommand::ObsReset => "ObsReset",
            ProxyCommand::AddMembership(_) => "AddMembership",
            ProxyCommand::RemoveMembership(_) => "RemoveMembership",
        }
    }
}

impl fmt::Display for ProxyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyCommand::Scan(id) => write!(f, "Scan({id})"),
            ProxyCommand::AddMembership(id) => write!(f, "AddMembership({id})"),
            ProxyCommand::RemoveMembership(id) => {
                write!(f, "RemoveMembership({id})")
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Immediate answer to a proxy call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteReply {
    /// The call finished with `code`.
    Done { code: ResultCode, message: String },
    /// Long-running call accepted; completion arrives through
    /// [`ResourceProxy::wait_for_result`].
    Queued { command_id: String },
}

impl RemoteReply {
    pub fn ok() -> Self {
        RemoteReply::Done {
            code: ResultCode::Ok,
            message: String::new(),
        }
    }

    pub fn done(code: ResultCode, message: impl Into<String>) -> Self {
        RemoteReply::Done {
            code,
            message: message.into(),
        }
    }
}

/// Client side of one subordinate resource.
///
/// Implementations map transport failures to
/// [`CbfError::RemoteCommand`](crate::CbfError::RemoteCommand) with
/// `transient: true` so the caller may retry them.
#[async_trait]
pub trait ResourceProxy: Send + Sync {
    fn resource_id(&self) -> &str;

    async fn state(&self) -> Result<ObsState>;

    async fn execute(&self, command: &ProxyCommand) -> Result<RemoteReply>;

    /// Completion of a call previously answered with
    /// [`RemoteReply::Queued`]. Must return [`RemoteReply::Done`].
    async fn wait_for_result(&self, command_id: &str) -> Result<RemoteReply>;

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}
