use crate::{
    components::control_panel::datalog::DataLog,
    devices::software::clock::LogicalClock,
    error::CommandError,
    messages::control::{
        command::{CommandResult, Reply},
        record::{LogRecord, Payload, SourceId},
    },
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering},
        Arc,
    },
};
use strum_macros::{Display, EnumString, IntoStaticStr};
use tracing::{info, warn};

pub const GET_VALUE_USAGE: &str = "Usage: get_sensor_value sensor=sensorname";
pub const GET_CONFIG_USAGE: &str = "Usage: get_sensor_config sensor=sensorname";
pub const SET_CONFIG_USAGE: &str = "Usage: set_sensor_config sensor=sensorname param=value";
const UNREFERENCED_SENSOR: &str = "Unreferenced sensor name";
const UNKNOWN_FIELD: &str = "Unknown config field";

pub const SENSOR_HELP: &str = "\
get_sensor_config sensor={temp,pot,light,pb1,pb2,pb3,js} : display the config of a sensor\r\n\
set_sensor_config sensor={temp,pot,light} lograte=secs : set the log rate of a sensor\r\n\
set_sensor_config sensor={temp,pot,light} min=val : set the min value that triggers an alarm\r\n\
set_sensor_config sensor={temp,pot,light} max=val : set the max value that triggers an alarm\r\n\
set_sensor_config sensor={pb1,pb2,pb3,js} alarm={on,off} : en/disable an alarm upon event\r\n\
get_sensor_value sensor={temp,pot,light,pb1,pb2,pb3,js,all} : display the current value of one sensor or of all sensors\r\n";

/// Capabilities shared by every sensor of the board.
pub trait Sensor: Send + Sync {
    fn source(&self) -> SourceId;

    /// Current reading as a log payload.
    fn value(&self) -> Result<Payload, CommandError>;

    /// `field=value` lines of the sensor configuration.
    fn config(&self) -> String;

    fn set_config(&self, field: &str, value: &str) -> Result<(), CommandError>;

    /// Seconds between periodic samples. Event driven sensors return 0.
    fn lograte(&self) -> u32 {
        0
    }
}

/// Per sensor startup configuration.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensorSettings {
    #[serde(default)]
    pub lograte: u32,
    #[serde(default)]
    pub min: Option<i32>,
    #[serde(default)]
    pub max: Option<i32>,
    #[serde(default)]
    pub alarm: bool,
}

fn parse_switch(value: &str) -> Result<bool, CommandError> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(CommandError::Syntax(SET_CONFIG_USAGE)),
    }
}

fn switch_name(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

/// An ADC backed sensor: temperature in degrees, potentiometer and light
/// in percent. The reading is fed by the acquisition side.
#[derive(Debug)]
pub struct AnalogSensor {
    source: SourceId,
    unit: &'static str,
    reading: AtomicI32,
    lograte: AtomicU32,
    min: AtomicI32,
    max: AtomicI32,
}

impl AnalogSensor {
    pub fn new(source: SourceId, unit: &'static str, settings: &SensorSettings) -> Self {
        Self {
            source,
            unit,
            reading: AtomicI32::new(0),
            lograte: AtomicU32::new(settings.lograte),
            min: AtomicI32::new(settings.min.unwrap_or(i32::MIN)),
            max: AtomicI32::new(settings.max.unwrap_or(i32::MAX)),
        }
    }

    pub fn set_reading(&self, reading: i32) {
        self.reading.store(reading, Ordering::Release);
    }

    pub fn reading(&self) -> i32 {
        self.reading.load(Ordering::Acquire)
    }
}

impl Sensor for AnalogSensor {
    fn source(&self) -> SourceId {
        self.source
    }

    fn value(&self) -> Result<Payload, CommandError> {
        let reading = self.reading();
        let (min, max) = (self.min.load(Ordering::Acquire), self.max.load(Ordering::Acquire));
        if reading < min || reading > max {
            warn!(source = %self.source, reading, min, max, "sensor alarm");
        }
        Ok(Payload::format(format_args!("{}{}", reading, self.unit))?)
    }

    fn config(&self) -> String {
        let mut config = format!("lograte={}\r\n", self.lograte());
        let min = self.min.load(Ordering::Acquire);
        if min != i32::MIN {
            config.push_str(&format!("min={min}\r\n"));
        }
        let max = self.max.load(Ordering::Acquire);
        if max != i32::MAX {
            config.push_str(&format!("max={max}\r\n"));
        }
        config
    }

    fn set_config(&self, field: &str, value: &str) -> Result<(), CommandError> {
        let bad_value = |_| CommandError::Syntax(SET_CONFIG_USAGE);
        match field {
            "lograte" => self.lograte.store(value.parse().map_err(bad_value)?, Ordering::Release),
            "min" => self.min.store(value.parse().map_err(bad_value)?, Ordering::Release),
            "max" => self.max.store(value.parse().map_err(bad_value)?, Ordering::Release),
            _ => return Err(CommandError::Failed(UNKNOWN_FIELD)),
        }
        info!(source = %self.source, field, value, "sensor config updated");
        Ok(())
    }

    fn lograte(&self) -> u32 {
        self.lograte.load(Ordering::Acquire)
    }
}

/// A push button. Edges are reported from interrupt context.
#[derive(Debug)]
pub struct PushButton {
    source: SourceId,
    pressed: AtomicBool,
    alarm: AtomicBool,
}

impl PushButton {
    pub fn new(source: SourceId, settings: &SensorSettings) -> Self {
        Self {
            source,
            pressed: AtomicBool::new(false),
            alarm: AtomicBool::new(settings.alarm),
        }
    }

    fn state_name(pressed: bool) -> &'static str {
        if pressed {
            "PRESS"
        } else {
            "RELEASE"
        }
    }

    /// Edge handler. Runs in interrupt context, so the event goes through
    /// the preallocated pool.
    pub fn on_edge(&self, pressed: bool, log: &DataLog) -> bool {
        self.pressed.store(pressed, Ordering::Release);
        if self.alarm.load(Ordering::Acquire) {
            info!(source = %self.source, pressed, "push button alarm");
        }
        log.log_event(self.source, Self::state_name(pressed))
    }
}

impl Sensor for PushButton {
    fn source(&self) -> SourceId {
        self.source
    }

    fn value(&self) -> Result<Payload, CommandError> {
        Ok(Payload::Static(Self::state_name(self.pressed.load(Ordering::Acquire))))
    }

    fn config(&self) -> String {
        format!("alarm={}\r\n", switch_name(self.alarm.load(Ordering::Acquire)))
    }

    fn set_config(&self, field: &str, value: &str) -> Result<(), CommandError> {
        if field != "alarm" {
            return Err(CommandError::Failed(UNKNOWN_FIELD));
        }
        self.alarm.store(parse_switch(value)?, Ordering::Release);
        Ok(())
    }
}

#[derive(EnumString, IntoStaticStr, Display, Copy, Clone, Debug, PartialEq, Eq)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum JoystickPosition {
    Center,
    Up,
    Down,
    Left,
    Right,
}

/// Joystick event payloads, indexed by position then by press state.
const JOYSTICK_EVENTS: [[&str; 2]; 5] = [
    ["CENTER", "CENTER,PRESS"],
    ["UP", "UP,PRESS"],
    ["DOWN", "DOWN,PRESS"],
    ["LEFT", "LEFT,PRESS"],
    ["RIGHT", "RIGHT,PRESS"],
];

#[derive(Debug)]
pub struct Joystick {
    position: AtomicU8,
    pressed: AtomicBool,
    alarm: AtomicBool,
}

impl Joystick {
    pub fn new(settings: &SensorSettings) -> Self {
        Self {
            position: AtomicU8::new(JoystickPosition::Center as u8),
            pressed: AtomicBool::new(false),
            alarm: AtomicBool::new(settings.alarm),
        }
    }

    fn event(&self) -> &'static str {
        let position = usize::from(self.position.load(Ordering::Acquire));
        let pressed = usize::from(self.pressed.load(Ordering::Acquire));
        JOYSTICK_EVENTS
            .get(position)
            .map_or(JOYSTICK_EVENTS[0][pressed], |events| events[pressed])
    }

    /// Movement handler, interrupt context.
    pub fn on_move(&self, position: JoystickPosition, pressed: bool, log: &DataLog) -> bool {
        self.position.store(position as u8, Ordering::Release);
        self.pressed.store(pressed, Ordering::Release);
        if self.alarm.load(Ordering::Acquire) {
            info!(%position, pressed, "joystick alarm");
        }
        log.log_event(SourceId::Joystick, self.event())
    }
}

impl Sensor for Joystick {
    fn source(&self) -> SourceId {
        SourceId::Joystick
    }

    fn value(&self) -> Result<Payload, CommandError> {
        Ok(Payload::Static(self.event()))
    }

    fn config(&self) -> String {
        format!("alarm={}\r\n", switch_name(self.alarm.load(Ordering::Acquire)))
    }

    fn set_config(&self, field: &str, value: &str) -> Result<(), CommandError> {
        if field != "alarm" {
            return Err(CommandError::Failed(UNKNOWN_FIELD));
        }
        self.alarm.store(parse_switch(value)?, Ordering::Release);
        Ok(())
    }
}

/// Every sensor of the board, in log source order.
pub struct SensorRegistry {
    analog: Vec<Arc<AnalogSensor>>,
    buttons: Vec<Arc<PushButton>>,
    joystick: Arc<Joystick>,
    all: Vec<Arc<dyn Sensor>>,
}

impl SensorRegistry {
    pub fn board(settings: &HashMap<SourceId, SensorSettings>) -> Self {
        let settings_of = |source: SourceId| settings.get(&source).copied().unwrap_or_default();
        let analog: Vec<_> = [
            (SourceId::Temperature, "C"),
            (SourceId::Potentiometer, "%"),
            (SourceId::Light, "%"),
        ]
        .into_iter()
        .map(|(source, unit)| Arc::new(AnalogSensor::new(source, unit, &settings_of(source))))
        .collect();
        let buttons: Vec<_> = [
            SourceId::PushButton1,
            SourceId::PushButton2,
            SourceId::PushButton3,
        ]
        .into_iter()
        .map(|source| Arc::new(PushButton::new(source, &settings_of(source))))
        .collect();
        let joystick = Arc::new(Joystick::new(&settings_of(SourceId::Joystick)));

        let mut all: Vec<Arc<dyn Sensor>> = Vec::new();
        all.extend(analog.iter().map(|s| s.clone() as Arc<dyn Sensor>));
        all.extend(buttons.iter().map(|s| s.clone() as Arc<dyn Sensor>));
        all.push(joystick.clone());
        Self {
            analog,
            buttons,
            joystick,
            all,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Sensor>> {
        self.all.iter()
    }

    pub fn get(&self, source: SourceId) -> Option<&Arc<dyn Sensor>> {
        self.all.iter().find(|sensor| sensor.source() == source)
    }

    /// Sensor named `nickname`.
    pub fn find(&self, nickname: &str) -> Option<&Arc<dyn Sensor>> {
        self.all
            .iter()
            .find(|sensor| sensor.source().nickname() == nickname)
    }

    pub fn analog(&self, source: SourceId) -> Option<&Arc<AnalogSensor>> {
        self.analog.iter().find(|sensor| sensor.source == source)
    }

    pub fn button(&self, source: SourceId) -> Option<&Arc<PushButton>> {
        self.buttons.iter().find(|button| button.source == source)
    }

    pub fn joystick(&self) -> &Arc<Joystick> {
        &self.joystick
    }

    /// `get_sensor_value sensor=<name|all>`: the reading as a log line.
    pub fn cmd_get_value(&self, clock: &LogicalClock, args: &[String]) -> CommandResult {
        if args.len() != 2 {
            return Err(CommandError::Syntax(GET_VALUE_USAGE));
        }
        let now = clock.now();
        let mut reply = String::new();
        if args[1] == "all" {
            reply.try_reserve(self.all.len() * 48)?;
            for sensor in &self.all {
                LogRecord::new(sensor.source(), now, sensor.value()?).write_line(&mut reply);
            }
        } else {
            let sensor = self
                .find(&args[1])
                .ok_or(CommandError::Failed(UNREFERENCED_SENSOR))?;
            reply.try_reserve(48)?;
            LogRecord::new(sensor.source(), now, sensor.value()?).write_line(&mut reply);
        }
        Ok(Reply::Owned(reply))
    }

    /// `get_sensor_config sensor=<name>`
    pub fn cmd_get_config(&self, args: &[String]) -> CommandResult {
        if args.len() != 2 {
            return Err(CommandError::Syntax(GET_CONFIG_USAGE));
        }
        let sensor = self
            .find(&args[1])
            .ok_or(CommandError::Failed(UNREFERENCED_SENSOR))?;
        Ok(Reply::Owned(sensor.config()))
    }

    /// `set_sensor_config sensor=<name> <field>=<value>`
    pub fn cmd_set_config(&self, args: &[String]) -> CommandResult {
        if args.len() != 4 {
            return Err(CommandError::Syntax(SET_CONFIG_USAGE));
        }
        let sensor = self
            .find(&args[1])
            .ok_or(CommandError::Failed(UNREFERENCED_SENSOR))?;
        sensor.set_config(&args[2], &args[3])?;
        Ok(Reply::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        components::control_panel::datalog::DataLogSettings,
        devices::software::clock::DEFAULT_EPOCH,
    };
    use rstest::rstest;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn registry() -> SensorRegistry {
        let mut settings = HashMap::new();
        settings.insert(
            SourceId::Temperature,
            SensorSettings {
                lograte: 5,
                min: Some(0),
                max: Some(40),
                alarm: false,
            },
        );
        SensorRegistry::board(&settings)
    }

    #[test]
    fn test_get_value_formats_log_line() {
        let sensors = registry();
        sensors.analog(SourceId::Temperature).unwrap().set_reading(23);
        let clock = LogicalClock::default();
        assert_eq!(
            sensors.cmd_get_value(&clock, &args(&["sensor", "temp"])),
            Ok(Reply::Owned("temp | 04/03/07 00:00:00 | 23C\r\n".into()))
        );
    }

    #[test]
    fn test_get_all_values() {
        let sensors = registry();
        let clock = LogicalClock::new(DEFAULT_EPOCH);
        let Ok(Reply::Owned(text)) = sensors.cmd_get_value(&clock, &args(&["sensor", "all"])) else {
            panic!("expected an owned reply");
        };
        let lines: Vec<_> = text.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 7);
        assert!(lines[3].starts_with("pb1 |"));
        assert!(lines[6].ends_with("| CENTER"));
    }

    #[rstest]
    #[case(vec!["sensor"], Err(CommandError::Syntax(GET_VALUE_USAGE)))]
    #[case(vec!["sensor", "temp", "x"], Err(CommandError::Syntax(GET_VALUE_USAGE)))]
    #[case(vec!["sensor", "ledb1"], Err(CommandError::Failed(UNREFERENCED_SENSOR)))]
    fn test_get_value_errors(#[case] argv: Vec<&str>, #[case] expected: CommandResult) {
        let clock = LogicalClock::default();
        assert_eq!(registry().cmd_get_value(&clock, &args(&argv)), expected);
    }

    #[test]
    fn test_config_round_trip() {
        let sensors = registry();
        assert_eq!(
            sensors.cmd_get_config(&args(&["sensor", "temp"])),
            Ok(Reply::Owned("lograte=5\r\nmin=0\r\nmax=40\r\n".into()))
        );
        sensors
            .cmd_set_config(&args(&["sensor", "temp", "max", "35"]))
            .unwrap();
        assert_eq!(sensors.get(SourceId::Temperature).unwrap().config(), "lograte=5\r\nmin=0\r\nmax=35\r\n");
        sensors
            .cmd_set_config(&args(&["sensor", "pb2", "alarm", "on"]))
            .unwrap();
        assert_eq!(
            sensors.cmd_get_config(&args(&["sensor", "pb2"])),
            Ok(Reply::Owned("alarm=on\r\n".into()))
        );
    }

    #[rstest]
    #[case(vec!["sensor", "temp", "max"], Err(CommandError::Syntax(SET_CONFIG_USAGE)))]
    #[case(vec!["sensor", "temp", "max", "hot"], Err(CommandError::Syntax(SET_CONFIG_USAGE)))]
    #[case(vec!["sensor", "temp", "alarm", "on"], Err(CommandError::Failed(UNKNOWN_FIELD)))]
    #[case(vec!["sensor", "js", "alarm", "maybe"], Err(CommandError::Syntax(SET_CONFIG_USAGE)))]
    #[case(vec!["sensor", "fan", "alarm", "on"], Err(CommandError::Failed(UNREFERENCED_SENSOR)))]
    fn test_set_config_errors(#[case] argv: Vec<&str>, #[case] expected: CommandResult) {
        assert_eq!(registry().cmd_set_config(&args(&argv)), expected);
    }

    #[test]
    fn test_edges_use_the_pool() {
        let sensors = registry();
        let log = DataLog::new(DataLogSettings::default(), Arc::new(LogicalClock::default()));
        let button = sensors.button(SourceId::PushButton3).unwrap();
        assert!(button.on_edge(true, &log));
        assert_eq!(button.value(), Ok(Payload::Static("PRESS")));
        assert!(sensors
            .joystick()
            .on_move(JoystickPosition::Left, true, &log));
        assert_eq!(
            sensors.joystick().value(),
            Ok(Payload::Static("LEFT,PRESS"))
        );
        assert_eq!(log.pool().in_use(), 2);
        assert_eq!(log.depth(), 2);
    }
}
