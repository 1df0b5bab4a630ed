use crate::{
    components::control_panel::{
        datalog::DataLog,
        scheduler::DeferredScheduler,
        shell::{Invocation, NavContext, SHELL_HELP},
    },
    devices::{
        hardware::{actuator::ACTUATOR_HELP, sensor::SENSOR_HELP},
        software::{
            clock::{format_log_date, parse_log_date, LogicalClock},
            storage::{lock_store, LogStore, Medium, SharedLogStore},
        },
    },
    error::CommandError,
    messages::control::command::{CommandResult, Reply},
};
use std::{path::PathBuf, str::FromStr, sync::Arc};
use tracing::{info, warn};

pub const GET_CONFIG_USAGE: &str = "Usage: get_sys_config sys={time,log}";
pub const SET_CONFIG_USAGE: &str = "Usage: set_sys_config sys=module field=value";
pub const LS_USAGE: &str = "Usage: ls";
pub const CAT_USAGE: &str = "Usage: cat file=filename";
pub const RM_USAGE: &str = "Usage: rm file=filename";
pub const HELP_USAGE: &str = "Usage: help";
pub const DRIVE_USAGE: &str = "Usage: a: or b:";
const UNKNOWN_FIELD: &str = "Unknown configuration field";
const INVALID_DATE: &str = "Invalid date";
const FILE_NOT_FOUND: &str = "File not found";
const FILE_SYSTEM_ERROR: &str = "File system error";
const NO_NAVIGATION: &str = "No drive navigation for this caller";
const DRIVE_NOT_PRESENT: &str = "Drive not present";

pub const VERSION: &str = concat!("ctrlpanel ", env!("CARGO_PKG_VERSION"), "\r\n");

pub const SYS_HELP: &str = "\
get_sys_config sys={time,log} : display the config of a system module\r\n\
set_sys_config sys=time curtime=\"mm/dd/yy hh:mm:ss\" : set the current time of the Control Panel\r\n\
set_sys_config sys=log drive={a,b} : select the storage medium of the data log\r\n\
version : display the Ctrl Panel sw version\r\n";

pub const FS_HELP: &str = "\
a: : mount the data flash drive\r\n\
b: : mount the SD card drive\r\n\
ls : list the log files of the current drive\r\n\
cat file=filename : list file contents\r\n\
rm file=filename : remove selected file\r\n";

/// `help`: every module's help text.
pub fn cmd_help(args: &[String]) -> CommandResult {
    if !args.is_empty() {
        return Err(CommandError::Syntax(HELP_USAGE));
    }
    let mut help = String::new();
    for text in [SHELL_HELP, SENSOR_HELP, ACTUATOR_HELP, SYS_HELP, FS_HELP] {
        help.try_reserve(text.len())?;
        help.push_str(text);
    }
    Ok(Reply::Owned(help))
}

/// `get_sys_config` and `set_sys_config` for the time and log modules.
pub struct SystemCommands {
    clock: Arc<LogicalClock>,
    scheduler: Arc<DeferredScheduler>,
    datalog: Arc<DataLog>,
}

impl SystemCommands {
    pub fn new(
        clock: Arc<LogicalClock>,
        scheduler: Arc<DeferredScheduler>,
        datalog: Arc<DataLog>,
    ) -> Self {
        Self {
            clock,
            scheduler,
            datalog,
        }
    }

    /// Step the logical clock. Deferred commands that are no longer in the
    /// future are cancelled before the clock moves.
    pub fn set_time(&self, now: i64) {
        let cancelled = self.scheduler.on_clock_changed(now);
        self.clock.set(now);
        info!(time = %format_log_date(now), cancelled, "clock set");
    }

    pub fn cmd_get_config(&self, args: &[String]) -> CommandResult {
        match args {
            [sys, module] if sys == "sys" && module == "time" => Ok(Reply::Owned(format!(
                "curtime={}\r\n",
                format_log_date(self.clock.now())
            ))),
            [sys, module] if sys == "sys" && module == "log" => {
                let file = self
                    .datalog
                    .current_file()
                    .and_then(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
                    .unwrap_or_else(|| "none".to_owned());
                Ok(Reply::Owned(format!(
                    "drive={}\r\nfile={}\r\n",
                    self.datalog.medium(),
                    file
                )))
            }
            _ => Err(CommandError::Syntax(GET_CONFIG_USAGE)),
        }
    }

    pub fn cmd_set_config(&self, args: &[String]) -> CommandResult {
        match args {
            [sys, module, field, value] if sys == "sys" && module == "time" => {
                if field != "curtime" {
                    return Err(CommandError::Failed(UNKNOWN_FIELD));
                }
                let now = parse_log_date(value).ok_or(CommandError::Failed(INVALID_DATE))?;
                self.set_time(now);
                Ok(Reply::Empty)
            }
            [sys, module, field, value] if sys == "sys" && module == "log" => {
                if field != "drive" {
                    return Err(CommandError::Failed(UNKNOWN_FIELD));
                }
                let medium = Medium::from_str(value).map_err(|_| CommandError::Syntax(SET_CONFIG_USAGE))?;
                self.datalog.set_medium(medium);
                Ok(Reply::Empty)
            }
            _ => Err(CommandError::Syntax(SET_CONFIG_USAGE)),
        }
    }
}

/// Log store verbs. The shell holds the storage guard while they run.
pub struct FileCommands {
    store: SharedLogStore,
    datalog: Arc<DataLog>,
}

impl FileCommands {
    pub fn new(store: SharedLogStore, datalog: Arc<DataLog>) -> Self {
        Self { store, datalog }
    }

    /// Drive of the caller's navigation context, else the data log's.
    fn drive(&self, nav: Option<&NavContext>) -> Medium {
        nav.map_or_else(|| self.datalog.medium(), NavContext::drive)
    }

    fn file_path(&self, inv: &Invocation<'_>, usage: &'static str) -> Result<PathBuf, CommandError> {
        let name = match inv.args {
            [file, name] if file == "file" => name,
            _ => return Err(CommandError::Syntax(usage)),
        };
        if name.is_empty() || name.contains(&['/', '\\'][..]) || name == "." || name == ".." {
            return Err(CommandError::Failed(FILE_NOT_FOUND));
        }
        let dir = lock_store(&self.store).log_dir(self.drive(inv.nav));
        Ok(dir.join(name))
    }

    /// `a:` and `b:`: move the caller's navigation to `medium`. Callers
    /// without a navigation context always follow the data log medium.
    pub fn cmd_change_drive(&self, inv: &Invocation<'_>, medium: Medium) -> CommandResult {
        if !inv.args.is_empty() {
            return Err(CommandError::Syntax(DRIVE_USAGE));
        }
        let nav = inv.nav.ok_or(CommandError::Failed(NO_NAVIGATION))?;
        let store = lock_store(&self.store);
        if !store.dir_present(&store.log_dir(medium)) {
            return Err(CommandError::Failed(DRIVE_NOT_PRESENT));
        }
        nav.set_drive(medium);
        info!(drive = %medium, "drive changed");
        Ok(Reply::Empty)
    }

    /// `ls`: name and size of every file in the log directory.
    pub fn cmd_ls(&self, inv: &Invocation<'_>) -> CommandResult {
        if !inv.args.is_empty() {
            return Err(CommandError::Syntax(LS_USAGE));
        }
        let store = lock_store(&self.store);
        let dir = store.log_dir(self.drive(inv.nav));
        let entries = store.list(&dir).map_err(|err| {
            warn!(%err, dir = %dir.display(), "ls failed");
            CommandError::Failed(FILE_SYSTEM_ERROR)
        })?;
        let mut listing = String::new();
        for (name, size) in entries {
            listing.push_str(&format!("{size:>8} {name}\r\n"));
        }
        Ok(Reply::Owned(listing))
    }

    /// `cat file=<name>`
    pub fn cmd_cat(&self, inv: &Invocation<'_>) -> CommandResult {
        let path = self.file_path(inv, CAT_USAGE)?;
        let text = lock_store(&self.store)
            .read_to_string(&path)
            .map_err(|_| CommandError::Failed(FILE_NOT_FOUND))?;
        Ok(Reply::Owned(text))
    }

    /// `rm file=<name>`
    pub fn cmd_rm(&self, inv: &Invocation<'_>) -> CommandResult {
        let path = self.file_path(inv, RM_USAGE)?;
        lock_store(&self.store)
            .remove(&path)
            .map_err(|_| CommandError::Failed(FILE_NOT_FOUND))?;
        info!(file = %path.display(), "log file removed");
        Ok(Reply::Empty)
    }
}
