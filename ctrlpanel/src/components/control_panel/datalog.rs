use crate::{
    devices::{
        hardware::sensor::SensorRegistry,
        software::{
            clock::{log_file_name_in_minute, to_system_time, LogicalClock},
            storage::{lock_store, LogFile, LogStore, Medium, SharedLogStore, StorageGuard},
        },
    },
    messages::control::record::{LogPool, LogRecord, Payload, SourceId},
};
use crossbeam::queue::ArrayQueue;
use std::{
    collections::{HashMap, TryReserveError},
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::{mpsc::UnboundedSender, Notify};
use tracing::{debug, info, warn};

/// Room reserved for one formatted log line.
const LINE_CAPACITY: usize = 64;

/// Log files one minute may start before the writer gives up.
const MAX_FILES_PER_MINUTE: usize = 100;

/// Queue sizing and rotation limits of the data log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLogSettings {
    pub queue_capacity: usize,
    /// Depth that wakes the writer, also the interrupt pool size.
    pub high_watermark: usize,
    /// Depth the writer drains down to.
    pub low_watermark: usize,
    pub max_file_size: u64,
}

impl DataLogSettings {
    /// Derive the watermarks from percentages of `queue_capacity`.
    pub fn from_percentages(
        queue_capacity: usize,
        high_percent: usize,
        low_percent: usize,
        max_file_size: u64,
    ) -> Self {
        let queue_capacity = queue_capacity.max(1);
        let high_watermark = (queue_capacity * high_percent / 100).clamp(1, queue_capacity);
        let low_watermark = (queue_capacity * low_percent / 100).min(high_watermark - 1);
        Self {
            queue_capacity,
            high_watermark,
            low_watermark,
            max_file_size,
        }
    }
}

impl Default for DataLogSettings {
    fn default() -> Self {
        Self::from_percentages(30, 70, 30, 20_480)
    }
}

/// Raised when a new log file replaces a previous one. The previous file is
/// complete and can be mailed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationNotice {
    pub previous: PathBuf,
    pub current: PathBuf,
}

#[derive(Debug, Default)]
struct DataLogStats {
    enqueued: AtomicUsize,
    dropped: AtomicUsize,
    written: AtomicUsize,
    discarded: AtomicUsize,
    wakeups: AtomicUsize,
}

/// Snapshot of the data log counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataLogCounters {
    /// Records accepted by the queue.
    pub enqueued: usize,
    /// Records lost before reaching the queue: full queue, pool exhaustion
    /// or allocation failure.
    pub dropped: usize,
    pub written: usize,
    /// Records popped without being written.
    pub discarded: usize,
    pub wakeups: usize,
}

/// Outcome of one writer wake cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    pub written: usize,
    pub discarded: usize,
    pub bytes: u64,
    /// A write failed and the drain stopped early.
    pub aborted: bool,
}

#[derive(Debug, Default)]
struct FileState {
    medium: Medium,
    current: Option<PathBuf>,
    previous: Option<PathBuf>,
}

/// Bounded log pipeline. Producers enqueue without blocking from task or
/// interrupt context, and a single writer drains the queue into rotating
/// files once the high watermark is reached.
#[derive(Debug)]
pub struct DataLog {
    queue: ArrayQueue<LogRecord>,
    settings: DataLogSettings,
    pool: LogPool,
    wake: Notify,
    /// Cleared by the wake of a crossing, set again when a drain ends.
    armed: AtomicBool,
    stats: DataLogStats,
    files: Mutex<FileState>,
    clock: Arc<LogicalClock>,
    notices: Option<UnboundedSender<RotationNotice>>,
}

impl DataLog {
    pub fn new(settings: DataLogSettings, clock: Arc<LogicalClock>) -> Self {
        Self {
            queue: ArrayQueue::new(settings.queue_capacity),
            pool: LogPool::new(settings.high_watermark),
            settings,
            wake: Notify::new(),
            armed: AtomicBool::new(true),
            stats: DataLogStats::default(),
            files: Mutex::new(FileState::default()),
            clock,
            notices: None,
        }
    }

    /// Deliver rotation notices to `sink`.
    pub fn with_notices(mut self, sink: UnboundedSender<RotationNotice>) -> Self {
        self.notices = Some(sink);
        self
    }

    pub fn settings(&self) -> &DataLogSettings {
        &self.settings
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn pool(&self) -> &LogPool {
        &self.pool
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    pub fn counters(&self) -> DataLogCounters {
        DataLogCounters {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            written: self.stats.written.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
            wakeups: self.stats.wakeups.load(Ordering::Relaxed),
        }
    }

    fn files(&self) -> MutexGuard<'_, FileState> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a record built in task context. A record the queue cannot
    /// take is released on the spot. Returns whether it was queued.
    pub fn log(&self, record: LogRecord) -> bool {
        self.enqueue(record)
    }

    /// Build and enqueue a task context record stamped with the current time.
    /// Allocation failure drops the sample.
    pub fn log_value(&self, source: SourceId, payload: Result<Payload, TryReserveError>) -> bool {
        match payload {
            Ok(payload) => self.enqueue(LogRecord::new(source, self.clock.now(), payload)),
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Interrupt context producer: takes a preallocated pool slot and never
    /// blocks. The event is silently lost when the pool is exhausted.
    pub fn log_event(&self, source: SourceId, payload: &'static str) -> bool {
        match self.pool.acquire(source, self.clock.now(), payload) {
            Some(record) => self.enqueue(record),
            None => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn enqueue(&self, record: LogRecord) -> bool {
        let accepted = match self.queue.push(record) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(rejected) => {
                rejected.release();
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        };
        if !accepted || self.queue.len() >= self.settings.high_watermark {
            self.wake_writer();
        }
        accepted
    }

    /// Wake the writer once per high watermark crossing. Calling it while
    /// the writer already runs does nothing.
    fn wake_writer(&self) {
        if self.armed.swap(false, Ordering::AcqRel) {
            self.stats.wakeups.fetch_add(1, Ordering::Relaxed);
            self.wake.notify_one();
        }
    }

    /// Switch the active storage medium. A file open on the other medium is
    /// abandoned, so the next drain starts a new file and raises a rotation
    /// notice for the abandoned one.
    pub fn set_medium(&self, medium: Medium) {
        let mut files = self.files();
        if files.medium != medium {
            if let Some(current) = files.current.take() {
                debug!(file = %current.display(), "log file abandoned by medium switch");
            }
            info!(%medium, "data log medium switched");
            files.medium = medium;
        }
    }

    pub fn medium(&self) -> Medium {
        self.files().medium
    }

    /// File the next drain appends to, if one is open.
    pub fn current_file(&self) -> Option<PathBuf> {
        self.files().current.clone()
    }

    /// Writer task: sleeps until woken, then runs one drain cycle off the
    /// async workers.
    pub async fn run_writer(self: Arc<Self>, store: SharedLogStore, guard: StorageGuard) {
        loop {
            self.wake.notified().await;
            let log = self.clone();
            let store = store.clone();
            let guard = guard.clone();
            match tokio::task::spawn_blocking(move || log.drain(&store, &guard)).await {
                Ok(report) => debug!(?report, "data log drained"),
                Err(err) => warn!(%err, "data log drain task failed"),
            }
        }
    }

    /// One writer wake cycle. Writes records down to the low watermark when
    /// the storage guard and a log file are available, otherwise pops and
    /// releases them unwritten. The guard is held for this cycle only.
    pub fn drain(&self, store: &SharedLogStore, guard: &StorageGuard) -> DrainReport {
        let report = match guard.try_acquire() {
            None => {
                debug!("storage guard busy, discarding log records");
                self.discard()
            }
            Some(_token) => {
                let mut store = lock_store(store);
                match self.open_current(&mut *store) {
                    Some(file) => self.write(file),
                    None => self.discard(),
                }
            }
        };
        self.armed.store(true, Ordering::Release);
        report
    }

    fn discard(&self) -> DrainReport {
        let mut report = DrainReport::default();
        while self.queue.len() > self.settings.low_watermark {
            let Some(record) = self.queue.pop() else { break };
            record.release();
            report.discarded += 1;
        }
        self.stats.discarded.fetch_add(report.discarded, Ordering::Relaxed);
        report
    }

    fn write(&self, mut file: Box<dyn LogFile>) -> DrainReport {
        let mut report = DrainReport::default();
        let mut line = String::with_capacity(LINE_CAPACITY);
        while self.queue.len() > self.settings.low_watermark {
            let Some(record) = self.queue.pop() else { break };
            line.clear();
            record.write_line(&mut line);
            record.release();
            if let Err(err) = file.append(&line) {
                warn!(%err, "log write failed, drain stopped");
                report.aborted = true;
                break;
            }
            report.written += 1;
            report.bytes += line.len() as u64;
        }
        if let Err(err) = file.close(to_system_time(self.clock.now())) {
            warn!(%err, "log file close failed");
        }
        self.stats.written.fetch_add(report.written, Ordering::Relaxed);
        report
    }

    /// Open the file to append to, starting a new one when there is none,
    /// when the current one reached the size limit or vanished. A name
    /// already taken in this minute is appended to while it has room,
    /// otherwise the next sequence number is tried. Returns `None` when
    /// storage is unavailable.
    fn open_current(&self, store: &mut dyn LogStore) -> Option<Box<dyn LogFile>> {
        let mut files = self.files();
        if let Some(path) = files.current.clone() {
            match self.open_with_room(store, &path) {
                Ok(Some(file)) => return Some(file),
                Ok(None) => debug!(file = %path.display(), "log file full"),
                Err(err) => debug!(%err, file = %path.display(), "log file vanished"),
            }
            files.current = None;
        }

        let dir = store.log_dir(files.medium);
        if !store.dir_present(&dir) {
            warn!(dir = %dir.display(), "log directory missing");
            return None;
        }
        let now = self.clock.now();
        for sequence in 0..MAX_FILES_PER_MINUTE {
            let path = dir.join(log_file_name_in_minute(now, sequence));
            let file = match self.open_with_room(store, &path) {
                Ok(Some(file)) => {
                    info!(file = %path.display(), "appending to existing log file");
                    file
                }
                Ok(None) => continue,
                Err(_) => match store.create(&path) {
                    Ok(file) => {
                        info!(file = %path.display(), "new log file");
                        file
                    }
                    Err(err) => {
                        warn!(%err, file = %path.display(), "log file create failed");
                        return None;
                    }
                },
            };
            files.current = Some(path.clone());
            if let Some(previous) = files.previous.replace(path.clone()) {
                self.notify_rotation(previous, path);
            }
            return Some(file);
        }
        warn!(dir = %dir.display(), "every log file of this minute is full");
        None
    }

    /// Open `path` for appending. `Ok(None)` when it reached the size limit.
    fn open_with_room(
        &self,
        store: &mut dyn LogStore,
        path: &Path,
    ) -> io::Result<Option<Box<dyn LogFile>>> {
        let file = store.open_append(path)?;
        match file.size() {
            Ok(size) if size >= self.settings.max_file_size => Ok(None),
            _ => Ok(Some(file)),
        }
    }

    fn notify_rotation(&self, previous: PathBuf, current: PathBuf) {
        if previous == current {
            return;
        }
        if let Some(sink) = &self.notices {
            if sink.send(RotationNotice { previous, current }).is_err() {
                debug!("rotation notice receiver gone");
            }
        }
    }
}

/// Periodic sampler: logs every sensor once per its configured log rate.
#[derive(Debug, Default)]
pub struct Sampler {
    elapsed: HashMap<SourceId, u32>,
}

impl Sampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one second and log every sensor whose rate elapsed. Returns
    /// how many samples were queued.
    pub fn on_second(&mut self, log: &DataLog, sensors: &SensorRegistry) -> usize {
        let mut queued = 0;
        for sensor in sensors.iter() {
            let rate = sensor.lograte();
            if rate == 0 {
                continue;
            }
            let elapsed = self.elapsed.entry(sensor.source()).or_insert(0);
            *elapsed += 1;
            if *elapsed < rate {
                continue;
            }
            *elapsed = 0;
            match sensor.value() {
                Ok(payload) => {
                    let record = LogRecord::new(sensor.source(), log.clock().now(), payload);
                    if log.log(record) {
                        queued += 1;
                    }
                }
                Err(err) => debug!(source = %sensor.source(), %err, "sample skipped"),
            }
        }
        queued
    }
}
