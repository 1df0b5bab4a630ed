use crate::{
    devices::software::clock::LogicalClock,
    error::ScheduleError,
    messages::control::record::SourceId,
    utils::slots::{Keyed, SortedSlots},
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// A deferred actuator set, fired once the logical clock reaches `deadline`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledCommand {
    pub deadline: i64,
    /// Actuator whose set operation replays `args`.
    pub action: SourceId,
    /// Owned copy of the set fields captured at registration.
    pub args: Vec<String>,
}

impl Keyed for ScheduledCommand {
    type Key = i64;

    fn key(&self) -> i64 {
        self.deadline
    }
}

/// Fixed capacity table of pending deferred commands, sorted by deadline.
/// Every operation holds the table lock for its whole duration, so no caller
/// ever sees a partially shifted table.
#[derive(Debug)]
pub struct DeferredScheduler {
    table: Mutex<SortedSlots<ScheduledCommand>>,
    clock: Arc<LogicalClock>,
    min_lead: i64,
}

impl DeferredScheduler {
    pub const DEFAULT_CAPACITY: usize = 10;
    pub const MIN_LEAD_SECONDS: i64 = 3;

    pub fn new(clock: Arc<LogicalClock>, capacity: usize, min_lead: i64) -> Self {
        Self {
            table: Mutex::new(SortedSlots::new(capacity)),
            clock,
            min_lead,
        }
    }

    fn table(&self) -> MutexGuard<'_, SortedSlots<ScheduledCommand>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule `action` with `args` to fire `offset` seconds from now.
    /// `offset` is the decimal text taken from a `time=N` pair. Returns the
    /// deadline of the new entry.
    pub fn register(
        &self,
        offset: &str,
        action: SourceId,
        args: &[String],
    ) -> Result<i64, ScheduleError> {
        let mut table = self.table();
        if table.is_full() {
            return Err(ScheduleError::NoSlot);
        }
        let now = self.clock.now();
        let offset: i64 = offset.trim().parse().map_err(|_| ScheduleError::InvalidTime)?;
        let deadline = now.checked_add(offset).ok_or(ScheduleError::InvalidTime)?;
        if deadline < now + self.min_lead {
            return Err(ScheduleError::InvalidTime);
        }
        let command = ScheduledCommand {
            deadline,
            action,
            args: args.to_vec(),
        };
        if table.insert_sorted(command).is_err() {
            return Err(ScheduleError::NoSlot);
        }
        debug!(%action, deadline, pending = table.len(), "deferred command registered");
        Ok(deadline)
    }

    /// Fire at most one due entry. The entry leaves the table before `fire`
    /// runs, and `fire` runs without the table lock held, so it may register
    /// new entries. Returns whether an entry fired.
    pub fn tick<F>(&self, now: i64, fire: F) -> bool
    where
        F: FnOnce(ScheduledCommand),
    {
        let due = {
            let mut table = self.table();
            match table.first() {
                Some(first) if first.deadline <= now => table.remove_front(),
                _ => None,
            }
        };
        match due {
            Some(command) => {
                debug!(action = %command.action, deadline = command.deadline, "deferred command fired");
                fire(command);
                true
            }
            None => false,
        }
    }

    /// Cancel every entry that is no longer in the future once the clock is
    /// stepped to `new_now`. Scanning from the newest entry, the first one
    /// due at `new_now` is the cut: it and every older entry are dropped
    /// without firing. Survivors keep their deadlines. Returns how many
    /// entries were cancelled.
    pub fn on_clock_changed(&self, new_now: i64) -> usize {
        let mut table = self.table();
        let cancelled = match table.rposition(|command| command.deadline <= new_now) {
            Some(cut) => table.remove_through(cut).count(),
            None => 0,
        };
        if cancelled > 0 {
            info!(cancelled, new_now, "clock step cancelled deferred commands");
        }
        cancelled
    }

    /// Deadlines of the pending entries, earliest first.
    pub fn deadlines(&self) -> Vec<i64> {
        self.table().iter().map(|command| command.deadline).collect()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}
