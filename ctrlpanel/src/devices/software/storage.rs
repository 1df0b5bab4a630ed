use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};
use strum_macros::{Display, EnumString, IntoStaticStr};
use tokio::sync::OwnedMutexGuard;

/// Name of the log directory on every medium.
pub const LOG_DIR: &str = "LOG";

/// Storage media the data log can write to.
#[derive(
    EnumString, IntoStaticStr, Display, Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq,
    Hash, Default,
)]
pub enum Medium {
    /// On-board data flash, drive `a`.
    #[default]
    #[strum(serialize = "a")]
    #[serde(rename = "a")]
    DataFlash,
    /// Removable card, drive `b`.
    #[strum(serialize = "b")]
    #[serde(rename = "b")]
    SdCard,
}

impl Medium {
    /// Directory holding this medium below the store root.
    pub fn drive_dir(&self) -> &'static str {
        match self {
            Medium::DataFlash => "A",
            Medium::SdCard => "B",
        }
    }
}

/// Process wide token serializing every access to the log store. Holders
/// try to take it without waiting and give up when it is already taken.
#[derive(Clone, Debug, Default)]
pub struct StorageGuard {
    lock: Arc<tokio::sync::Mutex<()>>,
}

/// Held while the storage guard is owned. Dropping it releases the guard.
pub type StorageToken = OwnedMutexGuard<()>;

impl StorageGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero-wait acquisition.
    pub fn try_acquire(&self) -> Option<StorageToken> {
        self.lock.clone().try_lock_owned().ok()
    }

    pub fn is_held(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

/// An open log file. Closing stamps the file with the panel's logical time.
pub trait LogFile: Send {
    fn size(&self) -> io::Result<u64>;
    fn append(&mut self, line: &str) -> io::Result<()>;
    fn close(self: Box<Self>, modified: SystemTime) -> io::Result<()>;
}

/// The file system the data log and the file commands work against.
pub trait LogStore: Send {
    /// Log directory of `medium`.
    fn log_dir(&self, medium: Medium) -> PathBuf;
    fn dir_present(&self, dir: &Path) -> bool;
    /// Create `path`. Fails if it already exists.
    fn create(&mut self, path: &Path) -> io::Result<Box<dyn LogFile>>;
    /// Open an existing file for appending.
    fn open_append(&mut self, path: &Path) -> io::Result<Box<dyn LogFile>>;
    /// Name and size of every file in `dir`, sorted by name.
    fn list(&self, dir: &Path) -> io::Result<Vec<(String, u64)>>;
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
    fn remove(&mut self, path: &Path) -> io::Result<()>;
}

/// Store shared between the writer task and the file commands.
pub type SharedLogStore = Arc<Mutex<dyn LogStore>>;

/// Lock a shared store, recovering it if a previous holder panicked.
pub fn lock_store(store: &SharedLogStore) -> MutexGuard<'_, dyn LogStore + 'static> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Host directory backed store. Medium `a` lives under `<root>/A`, medium
/// `b` under `<root>/B`.
#[derive(Debug, Clone)]
pub struct FsLogStore {
    root: PathBuf,
}

impl FsLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the log directory of every medium.
    pub fn prepare(&self) -> io::Result<()> {
        for medium in [Medium::DataFlash, Medium::SdCard] {
            fs::create_dir_all(self.log_dir(medium))?;
        }
        Ok(())
    }

    pub fn shared(self) -> SharedLogStore {
        Arc::new(Mutex::new(self))
    }
}

struct FsLogFile {
    file: File,
}

impl LogFile for FsLogFile {
    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn append(&mut self, line: &str) -> io::Result<()> {
        self.file.write_all(line.as_bytes())
    }

    fn close(mut self: Box<Self>, modified: SystemTime) -> io::Result<()> {
        self.file.flush()?;
        self.file.set_modified(modified)
    }
}

impl LogStore for FsLogStore {
    fn log_dir(&self, medium: Medium) -> PathBuf {
        self.root.join(medium.drive_dir()).join(LOG_DIR)
    }

    fn dir_present(&self, dir: &Path) -> bool {
        dir.is_dir()
    }

    fn create(&mut self, path: &Path) -> io::Result<Box<dyn LogFile>> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(Box::new(FsLogFile { file }))
    }

    fn open_append(&mut self, path: &Path) -> io::Result<Box<dyn LogFile>> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Box::new(FsLogFile { file }))
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<(String, u64)>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_file() {
                entries.push((entry.file_name().to_string_lossy().into_owned(), metadata.len()));
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn remove(&mut self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::software::clock::{to_system_time, DEFAULT_EPOCH};
    use std::str::FromStr;

    #[test]
    fn test_medium_names() {
        assert_eq!(Medium::from_str("a"), Ok(Medium::DataFlash));
        assert_eq!(Medium::from_str("b"), Ok(Medium::SdCard));
        assert!(Medium::from_str("c").is_err());
        assert_eq!(Medium::SdCard.to_string(), "b");
    }

    #[test]
    fn test_guard_is_exclusive_until_dropped() {
        let guard = StorageGuard::new();
        let token = guard.try_acquire().expect("guard free");
        assert!(guard.is_held());
        assert!(guard.clone().try_acquire().is_none());
        drop(token);
        assert!(!guard.is_held());
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn test_fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FsLogStore::new(dir.path());
        store.prepare().unwrap();
        let log_dir = store.log_dir(Medium::SdCard);
        assert!(store.dir_present(&log_dir));
        assert_eq!(log_dir, dir.path().join("B").join("LOG"));

        let path = log_dir.join("040307_0000.log");
        let mut file = store.create(&path).unwrap();
        file.append("temp | 04/03/07 00:00:00 | 21C\r\n").unwrap();
        file.close(to_system_time(DEFAULT_EPOCH)).unwrap();

        let mut file = store.open_append(&path).unwrap();
        file.append("pot | 04/03/07 00:00:01 | 40%\r\n").unwrap();
        assert_eq!(file.size().unwrap(), 63);
        file.close(to_system_time(DEFAULT_EPOCH + 1)).unwrap();

        let modified = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(modified, to_system_time(DEFAULT_EPOCH + 1));
        assert_eq!(
            store.list(&log_dir).unwrap(),
            vec![("040307_0000.log".to_string(), 63)]
        );
        store.remove(&path).unwrap();
        assert!(store.open_append(&path).is_err());
    }

    #[test]
    fn test_create_never_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FsLogStore::new(dir.path());
        store.prepare().unwrap();
        let path = store.log_dir(Medium::DataFlash).join("040307_0000.log");
        let mut file = store.create(&path).unwrap();
        file.append("pb1 | 04/03/07 00:00:00 | PRESS\r\n").unwrap();
        file.close(to_system_time(DEFAULT_EPOCH)).unwrap();

        let err = store.create(&path).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "pb1 | 04/03/07 00:00:00 | PRESS\r\n"
        );
    }

    #[test]
    fn test_lock_store_recovers_from_poison() {
        let dir = tempfile::tempdir().unwrap();
        let fs_store = FsLogStore::new(dir.path());
        fs_store.prepare().unwrap();
        let store = fs_store.shared();
        let held = store.clone();
        let _ = std::thread::spawn(move || {
            let _store = held.lock().unwrap();
            panic!("store holder died");
        })
        .join();
        assert!(store.is_poisoned());

        let store = lock_store(&store);
        let log_dir = store.log_dir(Medium::SdCard);
        assert!(store.dir_present(&log_dir));
    }
}
