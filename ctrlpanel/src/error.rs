use std::collections::TryReserveError;
use thiserror::Error;

/// Failures reported back to whoever issued a command line. Every variant
/// renders as a short line that is stable enough to be matched by the web
/// pages and scripts driving the panel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The verb is not in the registry.
    #[error("Command not found")]
    NotFound,
    /// The caller identity is not in the verb's permission mask.
    #[error("Permission denied")]
    PermissionDenied,
    /// `!!` was issued before any command was looked up.
    #[error("No previous command")]
    NoHistory,
    /// Argument count or shape mismatch, carries the usage line of the verb.
    #[error("{0}")]
    Syntax(&'static str),
    /// The storage guard is held by another collaborator.
    #[error("Resource unavailable, try later")]
    ResourceBusy,
    /// Every deferred command slot is taken.
    #[error("No scheduling slot left")]
    NoSlot,
    /// The requested schedule is in the past or too close to now.
    #[error("Invalid schedule date")]
    InvalidTime,
    #[error("Memory allocation failed")]
    AllocationFailed,
    /// Handler specific failure with a fixed message.
    #[error("{0}")]
    Failed(&'static str),
}

impl From<TryReserveError> for CommandError {
    fn from(_: TryReserveError) -> Self {
        CommandError::AllocationFailed
    }
}

/// Registration failures of the deferred command scheduler.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("no scheduling slot left")]
    NoSlot,
    #[error("schedule time is invalid or below the minimum lead time")]
    InvalidTime,
}

impl From<ScheduleError> for CommandError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::NoSlot => CommandError::NoSlot,
            ScheduleError::InvalidTime => CommandError::InvalidTime,
        }
    }
}

/// Errors raised while building or starting the control panel component.
#[derive(Error, Debug)]
pub enum PanelError {
    #[error("could not locate the config file {0}")]
    MissingConfig(String),
    #[error("failed to read config: {0}")]
    Config(#[from] config::ConfigError),
    #[error("invalid initial time {0:?}, expected MM/DD/YY HH:MM:SS")]
    InvalidInitialTime(String),
    #[error("log store i/o error: {0}")]
    Io(#[from] std::io::Error),
}
