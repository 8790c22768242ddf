//! Command store backed by a JSON file
//!
//! The file is the source of truth: every call re-reads it, so commands
//! written by another process (the web API) are picked up on the next poll.
//! Every read-modify-write cycle holds an advisory lock on a sidecar
//! `.lock` file, so writers in other processes are serialized too. Writes
//! go to a uniquely named temp file in the same directory which is then
//! renamed over the original.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use fs2::FileExt;
use tempfile::NamedTempFile;
use uuid::Uuid;

use super::{
    CommandCompletion, CommandState, CommandStore, CommandTable, RecordingCommand,
    RecordingRequest, StoreError,
};

pub struct JsonFileCommandStore {
    path: PathBuf,
    lock_path: PathBuf,
    /// Serializes calls on this handle.
    lock: Mutex<()>,
}

impl JsonFileCommandStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            lock_path: path.with_extension("json.lock"),
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Lock the sidecar file. The lock is held until the returned file is closed.
    fn lock_file(&self, exclusive: bool) -> Result<File, StoreError> {
        let dir = self.dir();
        std::fs::create_dir_all(dir)
            .map_err(|e| StoreError::Io(format!("create {:?}: {}", dir, e)))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| StoreError::Io(format!("open {:?}: {}", self.lock_path, e)))?;

        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.map_err(|e| StoreError::Io(format!("lock {:?}: {}", self.lock_path, e)))?;
        Ok(file)
    }

    fn load(&self) -> Result<CommandTable, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(CommandTable::default()),
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| StoreError::Corrupt(format!("{:?}: {}", self.path, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CommandTable::default()),
            Err(e) => Err(StoreError::Io(format!("read {:?}: {}", self.path, e))),
        }
    }

    fn save(&self, table: &CommandTable) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(table)
            .map_err(|e| StoreError::Io(format!("serialize commands: {}", e)))?;

        let dir = self.dir();
        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|e| StoreError::Io(format!("create temp file in {:?}: {}", dir, e)))?;
        tmp.write_all(contents.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| StoreError::Io(format!("write {:?}: {}", tmp.path(), e)))?;
        tmp.persist(&self.path).map_err(|e| {
            StoreError::Io(format!("rename {:?} to {:?}: {}", e.file.path(), self.path, e.error))
        })?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&CommandTable) -> T) -> Result<T, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _file_lock = self.lock_file(false)?;
        let table = self.load()?;
        Ok(f(&table))
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut CommandTable) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _file_lock = self.lock_file(true)?;
        let mut table = self.load()?;
        let result = f(&mut table)?;
        self.save(&table)?;
        Ok(result)
    }
}

impl CommandStore for JsonFileCommandStore {
    fn get_active(&self) -> Result<Option<RecordingCommand>, StoreError> {
        self.read(|table| table.active().cloned())
    }

    fn get(&self, id: Uuid) -> Result<Option<RecordingCommand>, StoreError> {
        self.read(|table| table.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<RecordingCommand>, StoreError> {
        self.read(|table| table.list())
    }

    fn submit(&self, request: RecordingRequest) -> Result<RecordingCommand, StoreError> {
        self.mutate(|table| table.submit(request))
    }

    fn request_stop(&self, id: Uuid) -> Result<RecordingCommand, StoreError> {
        self.mutate(|table| table.request_stop(id))
    }

    fn compare_and_set(
        &self,
        id: Uuid,
        expected: CommandState,
        new: CommandState,
    ) -> Result<bool, StoreError> {
        self.mutate(|table| table.compare_and_set(id, expected, new))
    }

    fn finish(&self, id: Uuid, completion: CommandCompletion) -> Result<(), StoreError> {
        self.mutate(|table| table.finish(id, completion))
    }

    fn wait_for_change(&self, timeout: Duration) -> bool {
        // Other processes write the file; there is nothing to wait on.
        std::thread::sleep(timeout);
        false
    }
}
