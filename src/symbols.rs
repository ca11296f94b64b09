use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::info;

use crate::error::{WalError, WalResult};
use crate::fs;

/// Reads a seqlock-guarded file: the leading version long is even while the
/// file is stable and odd while the base table writer is mutating it. Spins
/// until two consecutive reads agree, bounded by `timeout`.
fn read_stable(path: &Path, timeout: Duration) -> WalResult<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    loop {
        let bytes = std::fs::read(path)?;
        if bytes.len() >= 8 {
            let version = i64::from_le_bytes(bytes[..8].try_into().expect("length checked"));
            if version % 2 == 0 && std::fs::read(path)? == bytes {
                return Ok(bytes);
            }
        }
        if Instant::now() >= deadline {
            return Err(WalError::SpinLockTimeout {
                path: path.to_path_buf(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        std::thread::yield_now();
    }
}

/// Snapshot of the base table's `_txn` file.
///
/// Symbol value counts are dense: one entry per symbol column in column
/// order, dropped symbol columns included.
#[derive(Debug, Clone)]
pub struct TxSnapshot {
    pub structure_version: i64,
    pub column_version: i64,
    pub symbol_counts: Vec<i32>,
}

impl TxSnapshot {
    pub fn read(table_dir: &Path, timeout: Duration) -> WalResult<Self> {
        let path = table_dir.join(fs::TXN_FILE);
        let bytes = read_stable(&path, timeout)?;
        let mut cursor = Cursor::new(bytes.as_slice());
        cursor.read_i64::<LittleEndian>()?; // seqlock version
        let structure_version = cursor.read_i64::<LittleEndian>()?;
        let column_version = cursor.read_i64::<LittleEndian>()?;
        let count = cursor.read_i32::<LittleEndian>()?;
        let mut symbol_counts = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            symbol_counts.push(cursor.read_i32::<LittleEndian>()?);
        }
        Ok(Self {
            structure_version,
            column_version,
            symbol_counts,
        })
    }
}

/// Snapshot of the base table's `_cv` (column version) file, mapping column
/// indices to the name txn qualifying their dictionary file names.
#[derive(Debug, Clone)]
pub struct ColumnVersionSnapshot {
    pub version: i64,
    name_txns: HashMap<i32, i64>,
}

impl ColumnVersionSnapshot {
    pub fn read(table_dir: &Path, timeout: Duration) -> WalResult<Self> {
        let path = table_dir.join(fs::COLUMN_VERSION_FILE);
        let bytes = read_stable(&path, timeout)?;
        let mut cursor = Cursor::new(bytes.as_slice());
        let version = cursor.read_i64::<LittleEndian>()?;
        let count = cursor.read_i32::<LittleEndian>()?;
        let mut name_txns = HashMap::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            let column_index = cursor.read_i32::<LittleEndian>()?;
            let name_txn = cursor.read_i64::<LittleEndian>()?;
            name_txns.insert(column_index, name_txn);
        }
        Ok(Self { version, name_txns })
    }

    pub fn default_column_name_txn(&self, column_index: usize) -> i64 {
        self.name_txns
            .get(&(column_index as i32))
            .copied()
            .unwrap_or(fs::COLUMN_NAME_TXN_NONE)
    }
}

/// Read-only view over one symbol column's dictionary.
///
/// Loaded eagerly from the hard-linked `.o` / `.c` files under the wal root;
/// the count is pinned at open so keys coined by the base table afterwards
/// are invisible to this writer.
#[derive(Debug, Default)]
pub struct SymbolMapReader {
    keys: HashMap<String, i32>,
}

impl SymbolMapReader {
    /// A dictionary with no entries; every value is coined locally.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn open(dir: &Path, column_name: &str, symbol_count: i32) -> WalResult<Self> {
        let offsets_raw = std::fs::read(fs::offset_file(dir, column_name, fs::COLUMN_NAME_TXN_NONE))?;
        let chars_raw = std::fs::read(fs::char_file(dir, column_name, fs::COLUMN_NAME_TXN_NONE))?;
        let needed = (symbol_count as usize + 1) * 8;
        if offsets_raw.len() < needed {
            return Err(WalError::corrupted(format!(
                "symbol offset file for {column_name} holds {} bytes, need {needed}",
                offsets_raw.len()
            )));
        }
        let offset_at = |index: usize| -> u64 {
            u64::from_le_bytes(
                offsets_raw[index * 8..index * 8 + 8]
                    .try_into()
                    .expect("length checked"),
            )
        };
        let mut keys = HashMap::with_capacity(symbol_count.max(0) as usize);
        for key in 0..symbol_count {
            let lo = offset_at(key as usize) as usize;
            let hi = offset_at(key as usize + 1) as usize;
            if hi > chars_raw.len() || lo + 4 > hi {
                return Err(WalError::corrupted(format!(
                    "symbol char file for {column_name} truncated at key {key}"
                )));
            }
            let len = i32::from_le_bytes(chars_raw[lo..lo + 4].try_into().expect("length checked"));
            if len < 0 || lo + 4 + len as usize > hi {
                return Err(WalError::corrupted(format!(
                    "symbol char record for {column_name} has bad length {len} at key {key}"
                )));
            }
            let value = std::str::from_utf8(&chars_raw[lo + 4..lo + 4 + len as usize])
                .map_err(|e| WalError::corrupted(format!("symbol value not utf-8: {e}")))?;
            keys.insert(value.to_string(), key);
        }
        Ok(Self { keys })
    }

    pub fn key_of(&self, value: &str) -> Option<i32> {
        self.keys.get(value).copied()
    }

    pub fn symbol_count(&self) -> i32 {
        self.keys.len() as i32
    }
}

fn symbol_file_pairs(
    table_dir: &Path,
    wal_root: &Path,
    column_name: &str,
    column_name_txn: i64,
) -> [(PathBuf, PathBuf); 4] {
    let none = fs::COLUMN_NAME_TXN_NONE;
    [
        (
            fs::offset_file(table_dir, column_name, column_name_txn),
            fs::offset_file(wal_root, column_name, none),
        ),
        (
            fs::char_file(table_dir, column_name, column_name_txn),
            fs::char_file(wal_root, column_name, none),
        ),
        (
            fs::key_file(table_dir, column_name, column_name_txn),
            fs::key_file(wal_root, column_name, none),
        ),
        (
            fs::value_file(table_dir, column_name, column_name_txn),
            fs::value_file(wal_root, column_name, none),
        ),
    ]
}

/// Hard-links the base table's dictionary files for one column into the wal
/// root under unqualified names. Returns `false` (after removing partial
/// links) when any link fails; the caller then falls back to an empty
/// dictionary. The base table writer may rename or drop the column
/// concurrently, so a failed link is expected traffic, not an error.
pub fn link_symbol_files(
    table_dir: &Path,
    wal_root: &Path,
    column_name: &str,
    column_name_txn: i64,
) -> bool {
    for (from, to) in symbol_file_pairs(table_dir, wal_root, column_name, column_name_txn) {
        if let Err(error) = std::fs::hard_link(&from, &to) {
            info!(
                from = %from.display(),
                to = %to.display(),
                %error,
                "failed to link symbol file, falling back to empty dictionary"
            );
            remove_symbol_files(wal_root, column_name);
            return false;
        }
    }
    true
}

/// Removes the hard-linked dictionary files of one column from the wal root;
/// missing files are ignored.
pub fn remove_symbol_files(wal_root: &Path, column_name: &str) {
    let none = fs::COLUMN_NAME_TXN_NONE;
    for path in [
        fs::offset_file(wal_root, column_name, none),
        fs::char_file(wal_root, column_name, none),
        fs::key_file(wal_root, column_name, none),
        fs::value_file(wal_root, column_name, none),
    ] {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write_base_cv, write_base_txn, write_symbol_dictionary};

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[test]
    fn reads_txn_and_cv_snapshots() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_base_txn(dir.path(), 3, 7, &[2, 5]).expect("txn");
        write_base_cv(dir.path(), 7, &[(2, 11)]).expect("cv");

        let txn = TxSnapshot::read(dir.path(), TIMEOUT).expect("read txn");
        assert_eq!(3, txn.structure_version);
        assert_eq!(7, txn.column_version);
        assert_eq!(vec![2, 5], txn.symbol_counts);

        let cv = ColumnVersionSnapshot::read(dir.path(), TIMEOUT).expect("read cv");
        assert_eq!(7, cv.version);
        assert_eq!(11, cv.default_column_name_txn(2));
        assert_eq!(fs::COLUMN_NAME_TXN_NONE, cv.default_column_name_txn(0));
    }

    #[test]
    fn torn_seqlock_read_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Odd version marks a write in progress that never settles.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1_i64.to_le_bytes());
        std::fs::write(dir.path().join(fs::TXN_FILE), &bytes).expect("write");
        assert!(matches!(
            TxSnapshot::read(dir.path(), Duration::from_millis(50)),
            Err(WalError::SpinLockTimeout { .. })
        ));
    }

    #[test]
    fn dictionary_link_and_lookup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table_dir = dir.path().join("trades");
        let wal_root = table_dir.join("wal1");
        std::fs::create_dir_all(&wal_root).expect("dirs");
        write_symbol_dictionary(&table_dir, "sym", 4, &["red", "green", "blue"]).expect("dict");

        assert!(link_symbol_files(&table_dir, &wal_root, "sym", 4));
        let reader = SymbolMapReader::open(&wal_root, "sym", 3).expect("open");
        assert_eq!(Some(0), reader.key_of("red"));
        assert_eq!(Some(2), reader.key_of("blue"));
        assert_eq!(None, reader.key_of("cyan"));
        assert_eq!(3, reader.symbol_count());

        remove_symbol_files(&wal_root, "sym");
        assert!(!fs::offset_file(&wal_root, "sym", fs::COLUMN_NAME_TXN_NONE).exists());
        // The base table keeps its own link.
        assert!(fs::offset_file(&table_dir, "sym", 4).exists());
    }

    #[test]
    fn failed_link_cleans_up_partials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table_dir = dir.path().join("trades");
        let wal_root = table_dir.join("wal1");
        std::fs::create_dir_all(&wal_root).expect("dirs");
        write_symbol_dictionary(&table_dir, "sym", 4, &["red"]).expect("dict");
        // Drop one of the four source files to break the third link.
        std::fs::remove_file(fs::key_file(&table_dir, "sym", 4)).expect("remove");

        assert!(!link_symbol_files(&table_dir, &wal_root, "sym", 4));
        assert!(!fs::offset_file(&wal_root, "sym", fs::COLUMN_NAME_TXN_NONE).exists());
        assert!(!fs::char_file(&wal_root, "sym", fs::COLUMN_NAME_TXN_NONE).exists());
    }
}
