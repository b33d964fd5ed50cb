//! Queue file persistence
//!
//! The whole record set lives in one JSON object (id -> record). Every save
//! rewrites the file through a temp file in the same directory followed by a
//! rename, so readers never observe a half-written file. Writers serialise on
//! an exclusive advisory lock on a sibling `.lock` file, held only for the
//! duration of a single reload-mutate-save step.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StoreError;
use crate::record::TaskRecord;

/// Read the queue file; a missing file is an empty queue
pub(crate) fn load(path: &Path) -> Result<BTreeMap<String, TaskRecord>, StoreError> {
    debug!(path = %path.display(), "load: called");
    if !path.exists() {
        debug!("load: no queue file yet");
        return Ok(BTreeMap::new());
    }

    let file = File::open(path)?;
    let tasks: BTreeMap<String, TaskRecord> =
        serde_json::from_reader(BufReader::new(file)).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

    debug!(count = tasks.len(), "load: complete");
    Ok(tasks)
}

/// Atomically replace the queue file with `tasks`
pub(crate) fn save(path: &Path, tasks: &BTreeMap<String, TaskRecord>) -> Result<(), StoreError> {
    debug!(path = %path.display(), count = tasks.len(), "save: called");
    let dir = parent_dir(path);
    let tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut writer, tasks)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

/// How long a writer waits for another handle to finish its mutation
pub(crate) const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const LOCK_RETRY: Duration = Duration::from_millis(10);

/// Take the exclusive lock for `path`, waiting up to `timeout` for the
/// current holder. The lock is released when the returned file is dropped.
pub(crate) fn lock(path: &Path, timeout: Duration) -> Result<File, StoreError> {
    let lock_path = lock_path(path);
    debug!(lock_path = %lock_path.display(), ?timeout, "lock: called");
    fs::create_dir_all(parent_dir(path))?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;

    let deadline = Instant::now() + timeout;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(_) if Instant::now() < deadline => thread::sleep(LOCK_RETRY),
            Err(e) => {
                debug!(error = %e, "lock: gave up waiting");
                return Err(StoreError::Locked {
                    path: path.to_path_buf(),
                });
            }
        }
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}
