use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::config::SegmentId;
use crate::error::{WalError, WalResult};

/// Writer- and segment-scoped advisory lock file name.
pub const LOCK_FILE: &str = "_lock";
/// Metadata snapshot file name inside a segment.
pub const META_FILE: &str = "_meta";
/// Event log file name inside a segment.
pub const EVENT_FILE: &str = "_event";
/// Base table transaction file, read during symbol dictionary setup.
pub const TXN_FILE: &str = "_txn";
/// Base table column version file.
pub const COLUMN_VERSION_FILE: &str = "_cv";
/// Prefix of per-writer WAL directory names.
pub const WAL_NAME_BASE: &str = "wal";
/// Column name txn marking unqualified symbol dictionary file names.
pub const COLUMN_NAME_TXN_NONE: i64 = -1;

pub fn wal_name(wal_id: u32) -> String {
    format!("{WAL_NAME_BASE}{wal_id}")
}

pub fn table_dir(db_root: &Path, table_name: &str) -> PathBuf {
    db_root.join(table_name)
}

pub fn wal_dir(db_root: &Path, table_name: &str, wal_id: u32) -> PathBuf {
    table_dir(db_root, table_name).join(wal_name(wal_id))
}

pub fn segment_dir(wal_root: &Path, segment_id: SegmentId) -> PathBuf {
    wal_root.join(segment_id.to_string())
}

/// Primary (data) file of a column.
pub fn primary_file(dir: &Path, column_name: &str) -> PathBuf {
    dir.join(format!("{column_name}.d"))
}

/// Secondary (offset index) file of a var-length column.
pub fn secondary_file(dir: &Path, column_name: &str) -> PathBuf {
    dir.join(format!("{column_name}.i"))
}

fn qualified(dir: &Path, column_name: &str, suffix: &str, column_name_txn: i64) -> PathBuf {
    if column_name_txn == COLUMN_NAME_TXN_NONE {
        dir.join(format!("{column_name}.{suffix}"))
    } else {
        dir.join(format!("{column_name}.{suffix}.{column_name_txn}"))
    }
}

/// Symbol dictionary offset file.
pub fn offset_file(dir: &Path, column_name: &str, column_name_txn: i64) -> PathBuf {
    qualified(dir, column_name, "o", column_name_txn)
}

/// Symbol dictionary character file.
pub fn char_file(dir: &Path, column_name: &str, column_name_txn: i64) -> PathBuf {
    qualified(dir, column_name, "c", column_name_txn)
}

/// Symbol bitmap index key file.
pub fn key_file(dir: &Path, column_name: &str, column_name_txn: i64) -> PathBuf {
    qualified(dir, column_name, "k", column_name_txn)
}

/// Symbol bitmap index value file.
pub fn value_file(dir: &Path, column_name: &str, column_name_txn: i64) -> PathBuf {
    qualified(dir, column_name, "v", column_name_txn)
}

/// Characters that would clash with file naming or SQL syntax.
const FORBIDDEN_NAME_CHARS: &[char] = &[
    '.', '?', ',', '\'', '"', '\\', '/', ':', ')', '(', '+', '-', '*', '%', '~',
];

pub fn is_valid_column_name(name: &str) -> bool {
    !name.is_empty()
        && !name.chars().any(|c| {
            c.is_control() || c == '\u{feff}' || FORBIDDEN_NAME_CHARS.contains(&c)
        })
        && name != " "
}

/// An exclusive advisory lock on a directory, held through a `_lock` file.
///
/// The lock is process-scoped (OS advisory) and released on drop; the lock
/// file itself is left in place.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    pub fn acquire(dir: &Path) -> WalResult<Self> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(WalError::CannotLock { path });
        }
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Durably records directory entries after file creation or rename.
#[cfg(unix)]
pub fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub fn fsync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
