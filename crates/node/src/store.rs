//! Store selection and the data-dir lock.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use divid_storage::fjall::FjallStore;
use divid_storage::memory::MemoryStore;
use divid_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};
use fs2::FileExt;

use crate::config::Backend;

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";

#[derive(Clone)]
pub enum Store {
    Memory(Arc<MemoryStore>),
    Fjall(Arc<FjallStore>),
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.put(column, key, value),
            Store::Fjall(store) => store.put(column, key, value),
        }
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(column, key),
            Store::Fjall(store) => store.delete(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }

    fn sync(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.sync(),
            Store::Fjall(store) => store.sync(),
        }
    }
}

pub fn open_store(backend: Backend, db_path: &Path) -> Result<Store, String> {
    match backend {
        Backend::Memory => Ok(Store::Memory(Arc::new(MemoryStore::new()))),
        Backend::Fjall => {
            fs::create_dir_all(db_path)
                .map_err(|err| format!("failed to create {}: {err}", db_path.display()))?;
            let store = FjallStore::open(db_path)
                .map_err(|err| format!("failed to open {}: {err}", db_path.display()))?;
            Ok(Store::Fjall(Arc::new(store)))
        }
    }
}

/// Held for the life of the process; the OS drops the lock on exit.
pub struct DataDirLock {
    _file: File,
}

pub fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let pid = std::process::id();
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={pid}");
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            let suffix = if holder.is_empty() {
                String::new()
            } else {
                format!(" ({holder})")
            };
            Err(format!(
                "data dir {} is already locked (another divid instance may be running); lock file {}{suffix}",
                data_dir.display(),
                lock_path.display()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_the_same_dir_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _held = lock_data_dir(dir.path()).expect("first lock");
        let err = lock_data_dir(dir.path())
            .err()
            .expect("second lock must fail");
        assert!(err.contains("already locked"), "{err}");
        assert!(err.contains("pid="), "{err}");
    }

    #[test]
    fn memory_store_round_trips_through_the_wrapper() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(Backend::Memory, &dir.path().join("db")).expect("open");
        store.put(Column::Meta, b"k", b"v").expect("put");
        assert_eq!(store.get(Column::Meta, b"k").expect("get"), Some(b"v".to_vec()));
    }
}
