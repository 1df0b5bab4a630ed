/**
Control panel firmware services for a sensor and actuator board: a command
shell shared by the console, the web gateway and the USB link, a deferred
command scheduler driven by a logical one second clock, and a data logger
that batches sensor readings into rotating log files.

The services are kept apart so each can be driven and tested on its own,
then composed into a single [`components::control_panel::panel::ControlPanel`].
*/

/// Components group devices and services into a logical unit that performs
/// some function for the panel.
pub mod components;
/// Devices are the atomic units components are composed from.
pub mod devices;
/// Error types returned by commands and by component setup.
pub mod error;
/// Message structures exchanged with the panel: command lines, replies and
/// log records.
pub mod messages;
/// Development utilities.
pub mod utils;

/// Helpful prelude when working with the control panel.
pub mod prelude {
    pub use crate::components::control_panel::panel::*;
    pub use crate::messages::control::command::{CallerId, CommandResponse, Reply};
}
