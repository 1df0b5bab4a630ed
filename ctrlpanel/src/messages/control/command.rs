use crate::error::CommandError;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Identity of whoever issued a command line. Verb permissions are a
    /// mask of the identities allowed to run them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CallerId: u32 {
        const CONSOLE = 1;
        const HTTP = 1 << 1;
        const USB = 1 << 2;
    }
}

impl CallerId {
    /// Internal callers, such as the scheduler replaying a deferred command.
    pub const NONE: CallerId = CallerId::empty();
}

/// Outcome class of an executed command.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    /// Success with an owned response the caller takes over.
    Ok,
    /// Success with a static or no response.
    OkNoRelease,
    Failed,
}

/// Successful command output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Owned(String),
    Static(&'static str),
    Empty,
}

impl Reply {
    pub fn status(&self) -> ExecStatus {
        match self {
            Reply::Owned(_) => ExecStatus::Ok,
            Reply::Static(_) | Reply::Empty => ExecStatus::OkNoRelease,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Reply::Owned(text) => Some(text),
            Reply::Static(text) => Some(text),
            Reply::Empty => None,
        }
    }
}

pub type CommandResult = Result<Reply, CommandError>;

pub fn status_of(result: &CommandResult) -> ExecStatus {
    match result {
        Ok(reply) => reply.status(),
        Err(_) => ExecStatus::Failed,
    }
}

/// A command line sent to the network gateway, one JSON object per line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub line: String,
}

/// Gateway answer to a [`CommandMessage`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub status: ExecStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl From<&CommandResult> for CommandResponse {
    fn from(result: &CommandResult) -> Self {
        let response = match result {
            Ok(reply) => reply.text().map(str::to_owned),
            Err(err) => Some(err.to_string()),
        };
        Self {
            status: status_of(result),
            response,
        }
    }
}
