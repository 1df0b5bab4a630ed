/// Components making up the control panel.
pub mod control_panel {
    /// Log queue, background writer and periodic sampler.
    pub mod datalog;
    /// The composed panel, its configuration and its runtime.
    pub mod panel;
    /// Deferred command table.
    pub mod scheduler;
    /// Command parser, dispatcher and permission checks.
    pub mod shell;
    /// System and log file verbs.
    pub mod syscmds;
}
