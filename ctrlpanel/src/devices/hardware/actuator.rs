use crate::{
    components::control_panel::scheduler::{DeferredScheduler, ScheduledCommand},
    devices::software::clock::LogicalClock,
    error::CommandError,
    messages::control::{
        command::{CommandResult, Reply},
        record::{LogRecord, Payload, SourceId},
    },
};
use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc, Mutex, PoisonError,
};
use tracing::{info, warn};

pub const GET_VALUE_USAGE: &str = "Usage: get_actuator_value actuator=actuatorname";
pub const SET_VALUE_USAGE: &str = "Usage: set_actuator_value actuator=actuatorname fields...";
const UNREFERENCED_ACTUATOR: &str = "Unreferenced actuator name";

/// Trailing pair turning a set into a deferred one.
const TIME_FIELD: &str = "time";

pub const ACTUATOR_HELP: &str = "\
set_actuator_value actuator={ledb1,ledb2} green=value red=value [time=secs]\r\n\
set_actuator_value actuator={ledm1,ledm2} state={on,off} [time=secs]\r\n\
set_actuator_value actuator=lcd usrmsg=\"string\" [time=secs]\r\n\
get_actuator_value actuator={ledb1,ledb2,ledm1,ledm2,lcd} : display the current value of an actuator\r\n";

/// Capabilities shared by every actuator of the board.
pub trait Actuator: Send + Sync {
    fn source(&self) -> SourceId;

    fn value(&self) -> Result<Payload, CommandError>;

    /// Token count of an immediate set, `actuator=<name>` and any trailing
    /// time pair excluded.
    fn arity(&self) -> usize;

    /// Apply the set fields. `fields.len()` equals [`Actuator::arity`].
    fn apply(&self, fields: &[String]) -> Result<(), CommandError>;
}

fn level(value: &str) -> Result<u8, CommandError> {
    value
        .parse()
        .map_err(|_| CommandError::Syntax(SET_VALUE_USAGE))
}

/// A two color led, `green=<0..255> red=<0..255>`.
#[derive(Debug)]
pub struct BicolorLed {
    source: SourceId,
    green: AtomicU8,
    red: AtomicU8,
}

impl BicolorLed {
    pub fn new(source: SourceId) -> Self {
        Self {
            source,
            green: AtomicU8::new(0),
            red: AtomicU8::new(0),
        }
    }
}

impl Actuator for BicolorLed {
    fn source(&self) -> SourceId {
        self.source
    }

    fn value(&self) -> Result<Payload, CommandError> {
        let green = self.green.load(Ordering::Acquire);
        let red = self.red.load(Ordering::Acquire);
        Ok(Payload::format(format_args!("{green},{red}"))?)
    }

    fn arity(&self) -> usize {
        4
    }

    fn apply(&self, fields: &[String]) -> Result<(), CommandError> {
        match fields {
            [g, green, r, red] if g == "green" && r == "red" => {
                let (green, red) = (level(green)?, level(red)?);
                self.green.store(green, Ordering::Release);
                self.red.store(red, Ordering::Release);
                Ok(())
            }
            _ => Err(CommandError::Syntax(SET_VALUE_USAGE)),
        }
    }
}

/// A single color led, `state={on,off}`.
#[derive(Debug)]
pub struct MonoLed {
    source: SourceId,
    on: AtomicBool,
}

impl MonoLed {
    pub fn new(source: SourceId) -> Self {
        Self {
            source,
            on: AtomicBool::new(false),
        }
    }
}

impl Actuator for MonoLed {
    fn source(&self) -> SourceId {
        self.source
    }

    fn value(&self) -> Result<Payload, CommandError> {
        Ok(Payload::Static(if self.on.load(Ordering::Acquire) {
            "on"
        } else {
            "off"
        }))
    }

    fn arity(&self) -> usize {
        2
    }

    fn apply(&self, fields: &[String]) -> Result<(), CommandError> {
        let on = match fields {
            [state, value] if state == "state" && value == "on" => true,
            [state, value] if state == "state" && value == "off" => false,
            _ => return Err(CommandError::Syntax(SET_VALUE_USAGE)),
        };
        self.on.store(on, Ordering::Release);
        Ok(())
    }
}

/// The character display, `usrmsg="text"`.
#[derive(Debug, Default)]
pub struct Lcd {
    message: Mutex<String>,
}

impl Lcd {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Actuator for Lcd {
    fn source(&self) -> SourceId {
        SourceId::Lcd
    }

    fn value(&self) -> Result<Payload, CommandError> {
        let message = self.message.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Payload::owned(&message)?)
    }

    fn arity(&self) -> usize {
        2
    }

    fn apply(&self, fields: &[String]) -> Result<(), CommandError> {
        match fields {
            [field, text] if field == "usrmsg" => {
                let mut message = self.message.lock().unwrap_or_else(PoisonError::into_inner);
                message.clear();
                message.try_reserve(text.len())?;
                message.push_str(text);
                Ok(())
            }
            _ => Err(CommandError::Syntax(SET_VALUE_USAGE)),
        }
    }
}

/// Every actuator of the board, in log source order.
pub struct ActuatorRegistry {
    all: Vec<Arc<dyn Actuator>>,
}

impl ActuatorRegistry {
    pub fn board() -> Self {
        let all: Vec<Arc<dyn Actuator>> = vec![
            Arc::new(BicolorLed::new(SourceId::BicolorLed1)),
            Arc::new(BicolorLed::new(SourceId::BicolorLed2)),
            Arc::new(MonoLed::new(SourceId::MonoLed1)),
            Arc::new(MonoLed::new(SourceId::MonoLed2)),
            Arc::new(Lcd::new()),
        ];
        Self { all }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Actuator>> {
        self.all.iter()
    }

    pub fn get(&self, source: SourceId) -> Option<&Arc<dyn Actuator>> {
        self.all.iter().find(|actuator| actuator.source() == source)
    }

    /// Actuator named `nickname`.
    pub fn find(&self, nickname: &str) -> Option<&Arc<dyn Actuator>> {
        self.all
            .iter()
            .find(|actuator| actuator.source().nickname() == nickname)
    }

    /// `get_actuator_value actuator=<name>`: the current value as a log line.
    pub fn cmd_get_value(&self, clock: &LogicalClock, args: &[String]) -> CommandResult {
        if args.len() != 2 {
            return Err(CommandError::Syntax(GET_VALUE_USAGE));
        }
        let actuator = self
            .find(&args[1])
            .ok_or(CommandError::Failed(UNREFERENCED_ACTUATOR))?;
        let record = LogRecord::new(actuator.source(), clock.now(), actuator.value()?);
        let mut reply = String::new();
        reply.try_reserve(48)?;
        record.write_line(&mut reply);
        Ok(Reply::Owned(reply))
    }

    /// `set_actuator_value actuator=<name> fields... [time=N]`. With a time
    /// pair the set is handed to `scheduler` to run `N` seconds from now.
    pub fn cmd_set_value(&self, scheduler: &DeferredScheduler, args: &[String]) -> CommandResult {
        let Some((name, fields)) = args.get(1).zip(args.get(2..)) else {
            return Err(CommandError::Syntax(SET_VALUE_USAGE));
        };
        let actuator = self
            .find(name)
            .ok_or(CommandError::Failed(UNREFERENCED_ACTUATOR))?;
        let arity = actuator.arity();
        if fields.len() == arity {
            actuator.apply(fields)?;
            info!(actuator = %actuator.source(), "actuator set");
            Ok(Reply::Empty)
        } else if fields.len() == arity + 2 && fields[arity] == TIME_FIELD {
            let deadline = scheduler.register(&fields[arity + 1], actuator.source(), &fields[..arity])?;
            info!(actuator = %actuator.source(), deadline, "actuator set deferred");
            Ok(Reply::Empty)
        } else {
            Err(CommandError::Syntax(SET_VALUE_USAGE))
        }
    }

    /// Replay a deferred set. Runs on behalf of no caller, so failures can
    /// only be traced.
    pub fn fire(&self, command: ScheduledCommand) {
        let Some(actuator) = self.get(command.action) else {
            warn!(action = %command.action, "deferred command for unknown actuator");
            return;
        };
        match actuator.apply(&command.args) {
            Ok(()) => info!(actuator = %command.action, "deferred actuator set applied"),
            Err(err) => warn!(actuator = %command.action, %err, "deferred actuator set failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::software::clock::DEFAULT_EPOCH;
    use rstest::rstest;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn setup() -> (Arc<LogicalClock>, DeferredScheduler, ActuatorRegistry) {
        let clock = Arc::new(LogicalClock::default());
        let scheduler = DeferredScheduler::new(clock.clone(), 10, 3);
        (clock, scheduler, ActuatorRegistry::board())
    }

    fn value_line(registry: &ActuatorRegistry, clock: &LogicalClock, name: &str) -> String {
        match registry.cmd_get_value(clock, &args(&["actuator", name])) {
            Ok(Reply::Owned(line)) => line,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_immediate_sets() {
        let (clock, scheduler, registry) = setup();
        registry
            .cmd_set_value(&scheduler, &args(&["actuator", "ledb1", "green", "120", "red", "40"]))
            .unwrap();
        registry
            .cmd_set_value(&scheduler, &args(&["actuator", "ledm2", "state", "on"]))
            .unwrap();
        registry
            .cmd_set_value(&scheduler, &args(&["actuator", "lcd", "usrmsg", "hello world"]))
            .unwrap();
        assert_eq!(value_line(&registry, &clock, "ledb1"), "ledb1 | 04/03/07 00:00:00 | 120,40\r\n");
        assert_eq!(value_line(&registry, &clock, "ledm2"), "ledm2 | 04/03/07 00:00:00 | on\r\n");
        assert_eq!(value_line(&registry, &clock, "lcd"), "lcd | 04/03/07 00:00:00 | hello world\r\n");
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_deferred_set_fires_later() {
        let (clock, scheduler, registry) = setup();
        assert_eq!(
            registry.cmd_set_value(&scheduler, &args(&["actuator", "ledm1", "state", "on", "time", "5"])),
            Ok(Reply::Empty)
        );
        assert_eq!(scheduler.deadlines(), vec![DEFAULT_EPOCH + 5]);
        assert!(value_line(&registry, &clock, "ledm1").ends_with("| off\r\n"));

        assert!(scheduler.tick(DEFAULT_EPOCH + 5, |cmd| registry.fire(cmd)));
        assert!(value_line(&registry, &clock, "ledm1").ends_with("| on\r\n"));
    }

    #[rstest]
    #[case(vec!["actuator"], CommandError::Syntax(SET_VALUE_USAGE))]
    #[case(vec!["actuator", "ledb1", "green", "1"], CommandError::Syntax(SET_VALUE_USAGE))]
    #[case(vec!["actuator", "ledb1", "green", "1", "red", "300"], CommandError::Syntax(SET_VALUE_USAGE))]
    #[case(vec!["actuator", "ledm1", "state", "dim"], CommandError::Syntax(SET_VALUE_USAGE))]
    #[case(vec!["actuator", "ledm1", "state", "on", "when", "5"], CommandError::Syntax(SET_VALUE_USAGE))]
    #[case(vec!["actuator", "ledm1", "state", "on", "time", "1"], CommandError::InvalidTime)]
    #[case(vec!["actuator", "fan", "state", "on"], CommandError::Failed(UNREFERENCED_ACTUATOR))]
    fn test_set_errors(#[case] argv: Vec<&str>, #[case] expected: CommandError) {
        let (_clock, scheduler, registry) = setup();
        assert_eq!(registry.cmd_set_value(&scheduler, &args(&argv)), Err(expected));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_full_scheduler_reports_no_slot() {
        let clock = Arc::new(LogicalClock::default());
        let scheduler = DeferredScheduler::new(clock.clone(), 1, 3);
        let registry = ActuatorRegistry::board();
        let set = args(&["actuator", "lcd", "usrmsg", "later", "time", "10"]);
        registry.cmd_set_value(&scheduler, &set).unwrap();
        assert_eq!(registry.cmd_set_value(&scheduler, &set), Err(CommandError::NoSlot));
    }

    #[test]
    fn test_get_value_errors() {
        let (clock, _scheduler, registry) = setup();
        assert_eq!(
            registry.cmd_get_value(&clock, &args(&["actuator"])),
            Err(CommandError::Syntax(GET_VALUE_USAGE))
        );
        assert_eq!(
            registry.cmd_get_value(&clock, &args(&["actuator", "temp"])),
            Err(CommandError::Failed(UNREFERENCED_ACTUATOR))
        );
    }
}
