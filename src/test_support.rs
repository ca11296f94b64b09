//! In-process collaborators for exercising the writer: a table sequencer
//! backed by a mutex-guarded map, fault-injecting sequencer wrappers, and
//! builders for the base-table files the symbol interner reads.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::Mutex;

use crate::config::SegmentId;
use crate::error::{WalError, WalResult};
use crate::fs;
use crate::meta::{AlterAction, AlterOperation, WalWriterMetadata};
use crate::sequencer::{MetadataChangeLog, TableSequencer, NO_TXN};

/// One granted data/SQL txn, for assertions on ordering and positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnRecord {
    pub txn: i64,
    pub wal_id: u32,
    pub segment_id: SegmentId,
    pub segment_txn: i64,
}

#[derive(Debug, Default)]
struct TableState {
    next_wal_id: u32,
    next_txn: i64,
    metadata: WalWriterMetadata,
    base_version: i64,
    changes: Vec<AlterAction>,
    txn_log: Vec<TxnRecord>,
}

/// An in-memory [`TableSequencer`] shared by every writer of a test table.
///
/// Grants strictly monotonic txns, tracks the authoritative schema, and
/// rejects txn allocation with [`NO_TXN`] whenever the caller's structure
/// version lags it, exactly like the production coordinator.
#[derive(Debug, Default)]
pub struct LocalSequencer {
    tables: Mutex<HashMap<String, TableState>>,
}

impl LocalSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table with its initial schema.
    pub fn create_table(&self, table_name: &str, metadata: WalWriterMetadata) {
        let mut tables = self.tables.lock();
        let base_version = metadata.structure_version();
        tables.insert(
            table_name.to_string(),
            TableState {
                next_wal_id: 0,
                next_txn: 0,
                metadata,
                base_version,
                changes: Vec::new(),
                txn_log: Vec::new(),
            },
        );
    }

    /// Every data/SQL txn granted so far, in grant order.
    pub fn txn_log(&self, table_name: &str) -> Vec<TxnRecord> {
        self.tables
            .lock()
            .get(table_name)
            .map(|t| t.txn_log.clone())
            .unwrap_or_default()
    }

    pub fn structure_version(&self, table_name: &str) -> i64 {
        self.tables
            .lock()
            .get(table_name)
            .map(|t| t.metadata.structure_version())
            .unwrap_or(-1)
    }

    fn with_table<T>(
        &self,
        table_name: &str,
        f: impl FnOnce(&mut TableState) -> WalResult<T>,
    ) -> WalResult<T> {
        let mut tables = self.tables.lock();
        let state = tables
            .get_mut(table_name)
            .ok_or_else(|| WalError::invalid_state(format!("unknown table: {table_name}")))?;
        f(state)
    }
}

impl TableSequencer for LocalSequencer {
    fn next_wal_id(&self, table_name: &str) -> WalResult<u32> {
        self.with_table(table_name, |state| {
            state.next_wal_id += 1;
            Ok(state.next_wal_id)
        })
    }

    fn load_table_metadata(&self, table_name: &str, sink: &mut WalWriterMetadata) -> WalResult<()> {
        self.with_table(table_name, |state| {
            *sink = state.metadata.clone();
            Ok(())
        })
    }

    fn next_txn(
        &self,
        table_name: &str,
        wal_id: u32,
        structure_version: i64,
        segment_id: SegmentId,
        segment_txn: i64,
    ) -> WalResult<i64> {
        self.with_table(table_name, |state| {
            if structure_version != state.metadata.structure_version() {
                return Ok(NO_TXN);
            }
            state.next_txn += 1;
            state.txn_log.push(TxnRecord {
                txn: state.next_txn,
                wal_id,
                segment_id,
                segment_txn,
            });
            Ok(state.next_txn)
        })
    }

    fn next_structure_txn(
        &self,
        table_name: &str,
        structure_version: i64,
        operation: &AlterOperation,
    ) -> WalResult<i64> {
        self.with_table(table_name, |state| {
            if structure_version != state.metadata.structure_version() {
                return Ok(NO_TXN);
            }
            for action in operation.actions() {
                match action {
                    AlterAction::AddColumn {
                        name,
                        column_type,
                        geo_bits,
                    } => {
                        state.metadata.add_column(name, *column_type, *geo_bits)?;
                    }
                    AlterAction::RemoveColumn { name } => {
                        state.metadata.remove_column(name)?;
                    }
                    AlterAction::RenameColumn { name, new_name } => {
                        state.metadata.rename_column(name, new_name)?;
                    }
                }
                state.changes.push(action.clone());
            }
            state.next_txn += 1;
            Ok(state.next_txn)
        })
    }

    fn metadata_change_log(
        &self,
        table_name: &str,
        from_version: i64,
    ) -> WalResult<Box<dyn MetadataChangeLog>> {
        self.with_table(table_name, |state| {
            let skip = (from_version - state.base_version).max(0) as usize;
            let actions = state.changes.iter().skip(skip).cloned().collect();
            Ok(Box::new(VecChangeLog { actions, next: 0 }) as Box<dyn MetadataChangeLog>)
        })
    }
}

struct VecChangeLog {
    actions: Vec<AlterAction>,
    next: usize,
}

impl MetadataChangeLog for VecChangeLog {
    fn next(&mut self) -> Option<AlterAction> {
        let action = self.actions.get(self.next).cloned();
        if action.is_some() {
            self.next += 1;
        }
        action
    }
}

/// Delegating sequencer whose txn allocation fails outright after a set
/// number of grants. Unlike [`FailingChangeLogSequencer`] the failure
/// surfaces before any catch-up runs, so the writer rolls back instead of
/// going straight to distress.
pub struct FailingTxnSequencer {
    inner: Arc<LocalSequencer>,
    grants_left: Mutex<u32>,
}

impl FailingTxnSequencer {
    pub fn new(inner: Arc<LocalSequencer>, grants_before_failure: u32) -> Self {
        Self {
            inner,
            grants_left: Mutex::new(grants_before_failure),
        }
    }
}

impl TableSequencer for FailingTxnSequencer {
    fn next_wal_id(&self, table_name: &str) -> WalResult<u32> {
        self.inner.next_wal_id(table_name)
    }

    fn load_table_metadata(&self, table_name: &str, sink: &mut WalWriterMetadata) -> WalResult<()> {
        self.inner.load_table_metadata(table_name, sink)
    }

    fn next_txn(
        &self,
        table_name: &str,
        wal_id: u32,
        structure_version: i64,
        segment_id: SegmentId,
        segment_txn: i64,
    ) -> WalResult<i64> {
        let mut grants_left = self.grants_left.lock();
        if *grants_left == 0 {
            return Err(WalError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "sequencer unavailable",
            )));
        }
        *grants_left -= 1;
        self.inner
            .next_txn(table_name, wal_id, structure_version, segment_id, segment_txn)
    }

    fn next_structure_txn(
        &self,
        table_name: &str,
        structure_version: i64,
        operation: &AlterOperation,
    ) -> WalResult<i64> {
        self.inner
            .next_structure_txn(table_name, structure_version, operation)
    }

    fn metadata_change_log(
        &self,
        table_name: &str,
        from_version: i64,
    ) -> WalResult<Box<dyn MetadataChangeLog>> {
        self.inner.metadata_change_log(table_name, from_version)
    }
}

/// Delegating sequencer that reports the writer's view as stale after a set
/// number of grants and then fails the change-log pull; drives the commit
/// catch-up path into distress.
pub struct FailingChangeLogSequencer {
    inner: Arc<LocalSequencer>,
    grants_left: Mutex<u32>,
}

impl FailingChangeLogSequencer {
    pub fn new(inner: Arc<LocalSequencer>, grants_before_failure: u32) -> Self {
        Self {
            inner,
            grants_left: Mutex::new(grants_before_failure),
        }
    }
}

impl TableSequencer for FailingChangeLogSequencer {
    fn next_wal_id(&self, table_name: &str) -> WalResult<u32> {
        self.inner.next_wal_id(table_name)
    }

    fn load_table_metadata(&self, table_name: &str, sink: &mut WalWriterMetadata) -> WalResult<()> {
        self.inner.load_table_metadata(table_name, sink)
    }

    fn next_txn(
        &self,
        table_name: &str,
        wal_id: u32,
        structure_version: i64,
        segment_id: SegmentId,
        segment_txn: i64,
    ) -> WalResult<i64> {
        let mut grants_left = self.grants_left.lock();
        if *grants_left == 0 {
            return Ok(NO_TXN);
        }
        *grants_left -= 1;
        self.inner
            .next_txn(table_name, wal_id, structure_version, segment_id, segment_txn)
    }

    fn next_structure_txn(
        &self,
        table_name: &str,
        structure_version: i64,
        operation: &AlterOperation,
    ) -> WalResult<i64> {
        self.inner
            .next_structure_txn(table_name, structure_version, operation)
    }

    fn metadata_change_log(
        &self,
        _table_name: &str,
        _from_version: i64,
    ) -> WalResult<Box<dyn MetadataChangeLog>> {
        Err(WalError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "change log unavailable",
        )))
    }
}

/// Writes a stable base-table `_txn` file with one symbol count per dense
/// symbol column.
pub fn write_base_txn(
    table_dir: &Path,
    structure_version: i64,
    column_version: i64,
    symbol_counts: &[i32],
) -> std::io::Result<()> {
    std::fs::create_dir_all(table_dir)?;
    let mut buf = Vec::new();
    buf.write_i64::<LittleEndian>(0)?; // seqlock version, even = stable
    buf.write_i64::<LittleEndian>(structure_version)?;
    buf.write_i64::<LittleEndian>(column_version)?;
    buf.write_i32::<LittleEndian>(symbol_counts.len() as i32)?;
    for &count in symbol_counts {
        buf.write_i32::<LittleEndian>(count)?;
    }
    std::fs::write(table_dir.join(fs::TXN_FILE), buf)
}

/// Writes a stable base-table `_cv` file mapping column indices to the name
/// txns qualifying their dictionary files.
pub fn write_base_cv(
    table_dir: &Path,
    version: i64,
    name_txns: &[(i32, i64)],
) -> std::io::Result<()> {
    std::fs::create_dir_all(table_dir)?;
    let mut buf = Vec::new();
    buf.write_i64::<LittleEndian>(version)?;
    buf.write_i32::<LittleEndian>(name_txns.len() as i32)?;
    for &(column_index, name_txn) in name_txns {
        buf.write_i32::<LittleEndian>(column_index)?;
        buf.write_i64::<LittleEndian>(name_txn)?;
    }
    std::fs::write(table_dir.join(fs::COLUMN_VERSION_FILE), buf)
}

/// Writes one symbol column's dictionary files (`.o`, `.c`, `.k`, `.v`)
/// qualified by `column_name_txn`; keys are assigned in `values` order.
pub fn write_symbol_dictionary(
    table_dir: &Path,
    column_name: &str,
    column_name_txn: i64,
    values: &[&str],
) -> std::io::Result<()> {
    std::fs::create_dir_all(table_dir)?;
    let mut chars = Vec::new();
    let mut offsets = Vec::new();
    offsets.write_i64::<LittleEndian>(0)?;
    for value in values {
        chars.write_i32::<LittleEndian>(value.len() as i32)?;
        chars.extend_from_slice(value.as_bytes());
        offsets.write_i64::<LittleEndian>(chars.len() as i64)?;
    }
    std::fs::write(fs::char_file(table_dir, column_name, column_name_txn), chars)?;
    std::fs::write(
        fs::offset_file(table_dir, column_name, column_name_txn),
        offsets,
    )?;
    std::fs::write(fs::key_file(table_dir, column_name, column_name_txn), [])?;
    std::fs::write(fs::value_file(table_dir, column_name, column_name_txn), [])?;
    Ok(())
}
