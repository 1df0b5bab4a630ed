use crate::devices::software::clock::format_log_date;
use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::{
    collections::TryReserveError,
    fmt::{self, Write},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

/// Bytes reserved up front for an owned payload.
const PAYLOAD_RESERVE: usize = 32;

/// Marks a free pool slot.
const FREE_SLOT: u8 = u8::MAX;

/// Every sensor and actuator of the board, named by its nickname in shell
/// commands and log lines.
#[derive(
    EnumString,
    IntoStaticStr,
    EnumIter,
    Display,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
)]
#[serde(try_from = "String", into = "&'static str")]
#[repr(u8)]
pub enum SourceId {
    #[strum(serialize = "temp")]
    Temperature,
    #[strum(serialize = "pot")]
    Potentiometer,
    #[strum(serialize = "light")]
    Light,
    #[strum(serialize = "pb1")]
    PushButton1,
    #[strum(serialize = "pb2")]
    PushButton2,
    #[strum(serialize = "pb3")]
    PushButton3,
    #[strum(serialize = "js")]
    Joystick,
    #[strum(serialize = "ledb1")]
    BicolorLed1,
    #[strum(serialize = "ledb2")]
    BicolorLed2,
    #[strum(serialize = "ledm1")]
    MonoLed1,
    #[strum(serialize = "ledm2")]
    MonoLed2,
    #[strum(serialize = "lcd")]
    Lcd,
}

impl TryFrom<String> for SourceId {
    type Error = strum::ParseError;

    fn try_from(nickname: String) -> Result<Self, Self::Error> {
        nickname.parse()
    }
}

impl SourceId {
    pub fn nickname(&self) -> &'static str {
        self.into()
    }

    pub fn is_actuator(&self) -> bool {
        matches!(
            self,
            SourceId::BicolorLed1
                | SourceId::BicolorLed2
                | SourceId::MonoLed1
                | SourceId::MonoLed2
                | SourceId::Lcd
        )
    }

    pub fn is_sensor(&self) -> bool {
        !self.is_actuator()
    }

    fn from_index(index: u8) -> Option<Self> {
        SourceId::iter().find(|source| *source as u8 == index)
    }
}

/// Text part of a log record. Interrupt producers may only use static text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Static(&'static str),
    Owned(String),
}

impl Payload {
    /// Format an owned payload. Fails instead of aborting when the text
    /// buffer cannot be reserved.
    pub fn format(args: fmt::Arguments<'_>) -> Result<Self, TryReserveError> {
        let mut text = String::new();
        text.try_reserve(PAYLOAD_RESERVE)?;
        // Writing into a String only fails on allocation failure, which aborts.
        let _ = text.write_fmt(args);
        Ok(Payload::Owned(text))
    }

    /// Copy `text` into an owned payload.
    pub fn owned(text: &str) -> Result<Self, TryReserveError> {
        let mut owned = String::new();
        owned.try_reserve(text.len())?;
        owned.push_str(text);
        Ok(Payload::Owned(owned))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Payload::Static(text) => text,
            Payload::Owned(text) => text,
        }
    }
}

/// A timestamped sample or event flowing from producers to the log writer.
/// Dropping (or [`LogRecord::release`]) frees whatever the record holds,
/// including its pool slot when it came from interrupt context.
#[derive(Debug)]
pub struct LogRecord {
    source: SourceId,
    timestamp: i64,
    payload: Payload,
    slot: Option<PoolSlot>,
}

impl LogRecord {
    /// Task context constructor.
    pub fn new(source: SourceId, timestamp: i64, payload: Payload) -> Self {
        Self {
            source,
            timestamp,
            payload,
            slot: None,
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn is_pooled(&self) -> bool {
        self.slot.is_some()
    }

    /// Append `<nickname> | MM/DD/YY HH:MM:SS | <payload>\r\n` to `out`.
    pub fn write_line(&self, out: &mut String) {
        let _ = write!(
            out,
            "{} | {} | {}\r\n",
            self.source.nickname(),
            format_log_date(self.timestamp),
            self.payload.as_str()
        );
    }

    pub fn to_line(&self) -> String {
        let mut line = String::new();
        self.write_line(&mut line);
        line
    }

    /// Free the record. Pool slots go back to their pool.
    pub fn release(self) {
        drop(self)
    }
}

#[derive(Debug)]
struct PoolInner {
    free: ArrayQueue<usize>,
    occupants: Box<[AtomicU8]>,
}

/// Fixed set of preallocated record slots for interrupt producers. Taking
/// and returning a slot never allocates and never blocks.
#[derive(Clone, Debug)]
pub struct LogPool {
    inner: Arc<PoolInner>,
}

impl LogPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let free = ArrayQueue::new(size);
        for index in 0..size {
            let _ = free.push(index);
        }
        let occupants = (0..size).map(|_| AtomicU8::new(FREE_SLOT)).collect();
        Self {
            inner: Arc::new(PoolInner { free, occupants }),
        }
    }

    /// Interrupt context constructor. Returns `None` when every slot is
    /// taken, in which case the event is lost.
    pub fn acquire(
        &self,
        source: SourceId,
        timestamp: i64,
        payload: &'static str,
    ) -> Option<LogRecord> {
        let index = self.inner.free.pop()?;
        self.inner.occupants[index].store(source as u8, Ordering::Release);
        Some(LogRecord {
            source,
            timestamp,
            payload: Payload::Static(payload),
            slot: Some(PoolSlot {
                pool: self.inner.clone(),
                index,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.occupants.len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.inner.free.len()
    }

    /// Source currently holding slot `index`.
    pub fn occupant(&self, index: usize) -> Option<SourceId> {
        let marker = self.inner.occupants.get(index)?.load(Ordering::Acquire);
        SourceId::from_index(marker)
    }
}

#[derive(Debug)]
struct PoolSlot {
    pool: Arc<PoolInner>,
    index: usize,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.pool.occupants[self.index].store(FREE_SLOT, Ordering::Release);
        let _ = self.pool.free.push(self.index);
    }
}
