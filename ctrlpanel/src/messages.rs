/// Standardise how commands and log data move into and out of the panel.
pub mod control {
    /// Caller identities, command results and the gateway line protocol.
    pub mod command;
    /// Log sources, payloads and the preallocated record pool.
    pub mod record;
}
