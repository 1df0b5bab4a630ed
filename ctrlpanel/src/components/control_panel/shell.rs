use crate::{
    devices::software::storage::{Medium, StorageGuard},
    error::CommandError,
    messages::control::command::{CallerId, CommandResult},
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Reserved verb replaying the last looked up command.
pub const REPEAT_VERB: &str = "!!";

/// Most arguments a command line may carry after its verb.
pub const MAX_TOKENS: usize = 8;

pub const SHELL_HELP: &str = "!!: execute the previous command\r\n";

/// Separates the verb from its arguments.
const VERB_DELIMITERS: &[char] = &[' ', '\t'];

/// Separates arguments, and names from values in `name=value` pairs.
const ARG_DELIMITERS: &[char] = &[' ', '\t', '='];

/// Navigation state of a file command caller: the drive its file verbs
/// work on. The shell hands it through untouched, the `a:` and `b:` verbs
/// move it.
#[derive(Debug, Default)]
pub struct NavContext {
    drive: Mutex<Medium>,
}

impl NavContext {
    pub fn new(drive: Medium) -> Self {
        Self {
            drive: Mutex::new(drive),
        }
    }

    pub fn drive(&self) -> Medium {
        *self.drive.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_drive(&self, drive: Medium) {
        *self.drive.lock().unwrap_or_else(PoisonError::into_inner) = drive;
    }
}

/// What a handler sees of one command line.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub caller: CallerId,
    pub args: &'a [String],
    pub nav: Option<&'a NavContext>,
}

pub type Handler = Arc<dyn Fn(&Invocation<'_>) -> CommandResult + Send + Sync>;

pub struct CommandEntry {
    name: &'static str,
    permission: CallerId,
    /// Holds the storage guard for the duration of the call.
    needs_storage: bool,
    handler: Handler,
}

impl CommandEntry {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn permission(&self) -> CallerId {
        self.permission
    }

    pub fn needs_storage(&self) -> bool {
        self.needs_storage
    }
}

impl std::fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEntry")
            .field("name", &self.name)
            .field("permission", &self.permission)
            .field("needs_storage", &self.needs_storage)
            .finish()
    }
}

/// Immutable verb table, built once at startup.
#[derive(Debug)]
pub struct CommandRegistry {
    entries: Vec<CommandEntry>,
    repeat_permission: CallerId,
}

impl CommandRegistry {
    /// Empty registry where only `repeat_permission` callers may use `!!`.
    pub fn new(repeat_permission: CallerId) -> Self {
        Self {
            entries: Vec::new(),
            repeat_permission,
        }
    }

    pub fn command<F>(self, name: &'static str, permission: CallerId, handler: F) -> Self
    where
        F: Fn(&Invocation<'_>) -> CommandResult + Send + Sync + 'static,
    {
        self.push(name, permission, false, Arc::new(handler))
    }

    /// Register a verb that runs with the storage guard held.
    pub fn storage_command<F>(self, name: &'static str, permission: CallerId, handler: F) -> Self
    where
        F: Fn(&Invocation<'_>) -> CommandResult + Send + Sync + 'static,
    {
        self.push(name, permission, true, Arc::new(handler))
    }

    fn push(
        mut self,
        name: &'static str,
        permission: CallerId,
        needs_storage: bool,
        handler: Handler,
    ) -> Self {
        self.entries.push(CommandEntry {
            name,
            permission,
            needs_storage,
            handler,
        });
        self
    }

    fn lookup(&self, verb: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.name == verb)
    }

    pub fn entries(&self) -> &[CommandEntry] {
        &self.entries
    }
}

/// Split a line into its verb and the unparsed rest.
fn split_verb(line: &str) -> (&str, &str) {
    let line = line
        .trim_end_matches(&['\r', '\n'][..])
        .trim_start_matches(VERB_DELIMITERS);
    match line.find(VERB_DELIMITERS) {
        Some(end) => (&line[..end], &line[end + 1..]),
        None => (line, ""),
    }
}

/// Break the argument part of a line into tokens. Tokens are separated by
/// blanks or `=`. A token opening with `"` runs to the next `"` and may hold
/// blanks; `""` is a present, empty token.
pub fn tokenize(rest: &str) -> Result<Vec<String>, CommandError> {
    let mut args = Vec::new();
    let mut rest = rest;
    loop {
        rest = rest.trim_start_matches(ARG_DELIMITERS);
        if rest.is_empty() {
            break;
        }
        let token = if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            rest = quoted.get(end + 1..).unwrap_or("");
            &quoted[..end]
        } else {
            let end = rest.find(ARG_DELIMITERS).unwrap_or(rest.len());
            let token = &rest[..end];
            rest = rest.get(end + 1..).unwrap_or("");
            token
        };
        if args.len() == MAX_TOKENS {
            return Err(CommandError::Syntax("Too many arguments"));
        }
        args.push(token.to_owned());
    }
    Ok(args)
}

#[derive(Debug, Clone)]
struct History {
    index: usize,
    args: Vec<String>,
}

/// Parses command lines, checks caller permissions and runs handlers.
#[derive(Debug)]
pub struct CommandShell {
    registry: CommandRegistry,
    history: Mutex<Option<History>>,
    storage: StorageGuard,
    console: Option<UnboundedSender<String>>,
}

impl CommandShell {
    pub fn new(registry: CommandRegistry, storage: StorageGuard) -> Self {
        Self {
            registry,
            history: Mutex::new(None),
            storage,
            console: None,
        }
    }

    /// Send console bound output to `sink`.
    pub fn with_console(mut self, sink: UnboundedSender<String>) -> Self {
        self.console = Some(sink);
        self
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    fn history(&self) -> MutexGuard<'_, Option<History>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one command line on behalf of `caller`. The line is consumed.
    /// `nav` is passed through to the handlers untouched.
    pub fn execute(
        &self,
        line: String,
        caller: CallerId,
        nav: Option<&NavContext>,
    ) -> CommandResult {
        let (verb, rest) = split_verb(&line);

        if verb == REPEAT_VERB {
            if !caller.intersects(self.registry.repeat_permission) {
                return Err(CommandError::PermissionDenied);
            }
            let History { index, args } = self.history().clone().ok_or(CommandError::NoHistory)?;
            let entry = &self.registry.entries[index];
            let mut echo = entry.name.to_owned();
            for arg in &args {
                echo.push(' ');
                echo.push_str(arg);
            }
            echo.push_str("\r\n");
            self.route_to_requester(caller, &echo);
            return self.invoke(entry, caller, &args, nav, None);
        }

        let index = self.registry.lookup(verb).ok_or(CommandError::NotFound)?;
        let entry = &self.registry.entries[index];
        if !caller.intersects(entry.permission) {
            debug!(verb, ?caller, "permission denied");
            return Err(CommandError::PermissionDenied);
        }
        let args = tokenize(rest)?;
        self.invoke(entry, caller, &args, nav, Some(index))
    }

    /// Take the storage guard when the entry needs it, record history when
    /// `record` names the entry, then run the handler.
    fn invoke(
        &self,
        entry: &CommandEntry,
        caller: CallerId,
        args: &[String],
        nav: Option<&NavContext>,
        record: Option<usize>,
    ) -> CommandResult {
        let _token = if entry.needs_storage {
            match self.storage.try_acquire() {
                Some(token) => Some(token),
                None => {
                    debug!(verb = entry.name, "storage guard busy");
                    return Err(CommandError::ResourceBusy);
                }
            }
        } else {
            None
        };
        if let Some(index) = record {
            *self.history() = Some(History {
                index,
                args: args.to_vec(),
            });
        }
        debug!(verb = entry.name, ?caller, argc = args.len(), "executing command");
        (entry.handler)(&Invocation { caller, args, nav })
    }

    /// Stream `text` back to the channel `caller` is attached to. Only the
    /// console has a stream; anything else is traced and dropped.
    pub fn route_to_requester(&self, caller: CallerId, text: &str) {
        match &self.console {
            Some(sink) if caller.contains(CallerId::CONSOLE) => {
                if sink.send(text.to_owned()).is_err() {
                    debug!("console stream closed");
                }
            }
            _ => debug!(?caller, text, "no stream for requester"),
        }
    }
}
