use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::column::{self, ColumnFilePair, ColumnSwitch};
use crate::config::{SegmentId, WalConfig};
use crate::error::{WalError, WalResult};
use crate::events::WalEventWriter;
use crate::fs::{self, DirLock};
use crate::meta::{AlterAction, AlterOperation, WalWriterMetadata};
use crate::sequencer::{MetadataChangeLog, TableSequencer, NO_TXN};
use crate::symbols::{self, ColumnVersionSnapshot, SymbolMapReader, TxSnapshot};
use crate::types::{self, ColumnType, SYMBOL_NULL};

/// Written-mark value of a dropped column; compares above any row index.
const COLUMN_DELETED_MARK: i64 = i64::MAX;

/// Per-symbol-column interning state.
#[derive(Debug)]
struct SymbolState {
    /// Read-only view over the hard-linked base dictionary; empty when the
    /// base table had none at segment open.
    reader: SymbolMapReader,
    /// Values coined by this writer since the last commit.
    local: HashMap<String, i32>,
    /// Base dictionary size at the last commit or segment open; locally
    /// coined keys start here.
    initial_count: i32,
}

impl SymbolState {
    fn empty() -> Self {
        Self {
            reader: SymbolMapReader::empty(),
            local: HashMap::new(),
            initial_count: 0,
        }
    }
}

/// Writer-side state of one column slot; slots of dropped columns stay in
/// place so later column indices remain stable.
#[derive(Debug)]
struct ColumnSlot {
    files: Option<ColumnFilePair>,
    /// `-1` = untouched in the current row, otherwise the last row index
    /// written, or [`COLUMN_DELETED_MARK`].
    written_mark: i64,
    symbol: Option<SymbolState>,
}

impl ColumnSlot {
    fn live() -> Self {
        Self {
            files: None,
            written_mark: -1,
            symbol: None,
        }
    }

    fn dropped() -> Self {
        Self {
            files: None,
            written_mark: COLUMN_DELETED_MARK,
            symbol: None,
        }
    }
}

/// The WAL ingestion frontend of one table.
///
/// A writer owns an isolated append-only directory
/// `<db_root>/<table>/wal<id>` holding numbered segments, receives rows and
/// schema changes from exactly one caller at a time, and orders its commits
/// through the table's shared [`TableSequencer`]. Any partial-write failure
/// moves the writer into the terminal distressed state; the owner must
/// observe [`WalWriter::is_distressed`] and discard the instance instead of
/// recycling it.
pub struct WalWriter {
    config: WalConfig,
    sequencer: Arc<dyn TableSequencer>,
    table_name: String,
    wal_id: u32,
    wal_name: String,
    wal_root: PathBuf,
    metadata: WalWriterMetadata,
    columns: Vec<ColumnSlot>,
    events: Option<WalEventWriter>,
    segment_id: SegmentId,
    segment_row_count: i64,
    current_txn_start_row: i64,
    txn_min_timestamp: i64,
    txn_max_timestamp: i64,
    txn_out_of_order: bool,
    last_segment_txn: i64,
    roll_segment_on_next_row: bool,
    distressed: bool,
    open: bool,
    segment_lock: Option<DirLock>,
    wal_lock: Option<DirLock>,
}

impl WalWriter {
    /// Opens a writer for `table_name`, reserving a fresh wal id from the
    /// sequencer, locking the wal directory and opening segment 0.
    pub fn open(
        config: WalConfig,
        table_name: &str,
        sequencer: Arc<dyn TableSequencer>,
    ) -> WalResult<Self> {
        let config = config.normalized();
        let wal_id = sequencer.next_wal_id(table_name)?;
        let wal_name = fs::wal_name(wal_id);
        let wal_root = fs::wal_dir(&config.db_root, table_name, wal_id);
        std::fs::create_dir_all(&wal_root)?;
        let wal_lock = DirLock::acquire(&wal_root)?;

        let mut metadata = WalWriterMetadata::new();
        sequencer.load_table_metadata(table_name, &mut metadata)?;

        let segment_id = SegmentId::new(0);
        let segment_dir = fs::segment_dir(&wal_root, segment_id);
        std::fs::create_dir_all(&segment_dir)?;
        let segment_lock = DirLock::acquire(&segment_dir)?;

        let page_size = config.data_append_page_size;
        let mut columns = Vec::with_capacity(metadata.column_count());
        for index in 0..metadata.column_count() {
            let column = metadata.column(index);
            if column.is_dropped() {
                columns.push(ColumnSlot::dropped());
            } else {
                let designated = Some(index) == metadata.timestamp_index();
                let files = ColumnFilePair::create(
                    &segment_dir,
                    column.name(),
                    column.column_type(),
                    designated,
                    page_size,
                )?;
                let mut slot = ColumnSlot::live();
                slot.files = Some(files);
                columns.push(slot);
            }
        }
        metadata.switch_to(&segment_dir)?;
        let events = WalEventWriter::open(&segment_dir, page_size)?;
        fs::fsync_dir(&segment_dir)?;

        let mut writer = WalWriter {
            config,
            sequencer,
            table_name: table_name.to_string(),
            wal_id,
            wal_name,
            wal_root,
            metadata,
            columns,
            events: Some(events),
            segment_id,
            segment_row_count: 0,
            current_txn_start_row: 0,
            txn_min_timestamp: i64::MAX,
            txn_max_timestamp: -1,
            txn_out_of_order: false,
            last_segment_txn: 0,
            roll_segment_on_next_row: false,
            distressed: false,
            open: true,
            segment_lock: Some(segment_lock),
            wal_lock: Some(wal_lock),
        };
        writer.configure_symbol_table()?;
        info!(table = %writer.table_name, wal = %writer.wal_name, "opened WAL writer");
        Ok(writer)
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn wal_id(&self) -> u32 {
        self.wal_id
    }

    pub fn wal_name(&self) -> &str {
        &self.wal_name
    }

    pub fn wal_root(&self) -> &Path {
        &self.wal_root
    }

    pub fn metadata(&self) -> &WalWriterMetadata {
        &self.metadata
    }

    pub fn structure_version(&self) -> i64 {
        self.metadata.structure_version()
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn segment_row_count(&self) -> i64 {
        self.segment_row_count
    }

    pub fn uncommitted_row_count(&self) -> i64 {
        self.segment_row_count - self.current_txn_start_row
    }

    pub fn in_transaction(&self) -> bool {
        self.segment_row_count > self.current_txn_start_row
    }

    pub fn is_distressed(&self) -> bool {
        self.distressed
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Base-dictionary size pinned at the last commit or segment open.
    ///
    /// Returns `0` for columns beyond the writer's view (a caller with newer
    /// metadata may ask about a column this writer has not seen yet) and
    /// `-1` for non-symbol columns.
    pub fn symbol_count_watermark(&self, column_index: usize) -> i32 {
        match self.columns.get(column_index) {
            None => 0,
            Some(slot) => slot.symbol.as_ref().map(|s| s.initial_count).unwrap_or(-1),
        }
    }

    /// Starts a row with timestamp `0`; for tables without a designated
    /// timestamp column.
    pub fn new_row(&mut self) -> WalResult<Row<'_>> {
        self.new_row_at(0)
    }

    /// Starts a row at `timestamp`, first rolling to a new segment when the
    /// previous commit scheduled one.
    pub fn new_row_at(&mut self, timestamp: i64) -> WalResult<Row<'_>> {
        self.check_distressed()?;
        if let Err(e) = self.prepare_row(timestamp) {
            self.enter_distress(&e);
            return Err(e);
        }
        Ok(Row {
            writer: self,
            timestamp,
        })
    }

    /// Commits pending rows: writes the DATA event, allocates a sequencer
    /// txn (catching up on schema changes as needed), resets the txn cursor
    /// and returns the txn. Returns [`NO_TXN`] when no rows are pending.
    pub fn commit(&mut self) -> WalResult<i64> {
        self.check_distressed()?;
        if !self.in_transaction() {
            return Ok(NO_TXN);
        }
        match self.commit_inner() {
            Ok(txn) => Ok(txn),
            Err(e) => {
                if !self.distressed {
                    let _ = self.rollback();
                }
                self.note_critical(&e);
                Err(e)
            }
        }
    }

    /// Commit with a lag hint. The hint is accepted for interface
    /// compatibility and ignored; behaves exactly like [`WalWriter::commit`].
    pub fn commit_with_lag(&mut self, _lag_micros: i64) -> WalResult<i64> {
        self.commit()
    }

    /// Appends a TRUNCATE event and allocates its sequencer txn.
    pub fn truncate(&mut self) -> WalResult<i64> {
        self.check_distressed()?;
        let result = (|| {
            self.last_segment_txn = self.events_mut()?.truncate()?;
            self.next_sequencer_txn()
        })();
        match result {
            Ok(txn) => Ok(txn),
            Err(e) => {
                if !self.distressed {
                    let _ = self.rollback();
                }
                self.enter_distress(&e);
                Err(e)
            }
        }
    }

    /// Applies a structural schema change through the sequencer.
    ///
    /// Validates the operation (catching up and revalidating once when the
    /// local schema is stale), allocates a structure txn — retrying after
    /// catch-up while the sequencer reports a concurrent change — and then
    /// replays the operation against this writer's own metadata and segment
    /// state. A local replay failure leaves the txn committed but poisons
    /// the writer.
    pub fn apply_alter(&mut self, operation: &AlterOperation) -> WalResult<i64> {
        self.check_distressed()?;
        if self.in_transaction() {
            return Err(WalError::UncommittedInserts {
                table: self.table_name.clone(),
            });
        }
        let txn = loop {
            self.validate_operation(operation)?;
            let sequencer = Arc::clone(&self.sequencer);
            let txn = sequencer.next_structure_txn(
                &self.table_name,
                self.metadata.structure_version(),
                operation,
            )?;
            if txn == NO_TXN {
                self.apply_metadata_change_log(i64::MAX)?;
            } else {
                break txn;
            }
        };
        if let Err(e) = self.apply_operation_locally(operation) {
            error!(
                table = %self.table_name,
                wal = %self.wal_name,
                error = %e,
                "failed to apply structure change locally, writer distressed"
            );
            self.distressed = true;
        }
        Ok(txn)
    }

    /// Records a non-structural operation (UPDATE, schema-neutral ALTER) as
    /// an SQL event and allocates its sequencer txn. A failure may leave a
    /// half-written event record, so it always poisons the writer.
    pub fn apply_sql(
        &mut self,
        command_type: i32,
        sql: &str,
        execution_context: &[u8],
    ) -> WalResult<i64> {
        self.check_distressed()?;
        let result = (|| {
            self.last_segment_txn = self.events_mut()?.sql(command_type, sql, execution_context)?;
            self.next_sequencer_txn()
        })();
        match result {
            Ok(txn) => Ok(txn),
            Err(e) => {
                self.enter_distress(&e);
                Err(e)
            }
        }
    }

    /// Catches up on schema changes up to the current sequencer version.
    /// Returns `false` and poisons the writer when the catch-up fails.
    pub fn go_active(&mut self) -> bool {
        self.go_active_up_to(i64::MAX)
    }

    /// Catches up on schema changes up to `max_structure_version` exclusive.
    pub fn go_active_up_to(&mut self, max_structure_version: i64) -> bool {
        match self.apply_metadata_change_log(max_structure_version) {
            Ok(()) => true,
            Err(error) => {
                error!(
                    table = %self.table_name,
                    wal = %self.wal_name,
                    %error,
                    "could not apply structure changes, WAL will be closed"
                );
                self.distressed = true;
                false
            }
        }
    }

    /// Requests a segment roll; the writer moves to a fresh segment before
    /// the next row is started.
    pub fn request_segment_roll(&mut self) {
        self.roll_segment_on_next_row = true;
    }

    /// Discards pending rows, rewinding every live column to the last commit
    /// boundary and withdrawing any event record whose sequencer txn was
    /// never granted.
    pub fn rollback(&mut self) -> WalResult<()> {
        if !self.open {
            return Ok(());
        }
        // A commit or truncate that failed between appending its event
        // record and the txn grant leaves that record unconfirmed; it must
        // not outlive the rows it describes.
        if let Err(e) = self.events_mut().and_then(WalEventWriter::rollback_last) {
            self.enter_distress(&e);
            return Err(e);
        }
        if !(self.in_transaction() || self.has_dirty_columns()) {
            return Ok(());
        }
        if let Err(e) = self.set_append_position(self.current_txn_start_row) {
            // A failed rewind leaves column files inconsistent; the pool
            // must not retry the rollback.
            self.enter_distress(&e);
            return Err(e);
        }
        self.segment_row_count = self.current_txn_start_row;
        self.txn_min_timestamp = i64::MAX;
        self.txn_max_timestamp = -1;
        self.txn_out_of_order = false;
        Ok(())
    }

    /// Rolls back pending rows and releases files and locks. Errors are
    /// logged; close always completes.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        if let Err(error) = self.rollback() {
            error!(
                table = %self.table_name,
                wal = %self.wal_name,
                %error,
                "rollback on close failed"
            );
        }
        self.do_close(true);
    }

    fn do_close(&mut self, truncate: bool) {
        self.open = false;
        if let Some(events) = self.events.take() {
            if let Err(error) = events.close(truncate) {
                error!(wal = %self.wal_name, %error, "failed to close event log");
            }
        }
        for slot in &mut self.columns {
            slot.symbol = None;
            if let Some(files) = slot.files.take() {
                if let Err(error) = files.close(truncate) {
                    error!(wal = %self.wal_name, %error, "failed to close column files");
                }
            }
        }
        self.segment_lock = None;
        self.wal_lock = None;
        info!(table = %self.table_name, wal = %self.wal_name, "closed WAL writer");
    }

    fn check_distressed(&self) -> WalResult<()> {
        if !self.open {
            return Err(WalError::invalid_state("WAL writer is closed"));
        }
        if self.distressed {
            return Err(WalError::Distressed {
                table: self.table_name.clone(),
                wal_id: self.wal_id,
            });
        }
        Ok(())
    }

    fn enter_distress(&mut self, error: &WalError) {
        if !self.distressed {
            self.distressed = true;
            error!(
                table = %self.table_name,
                wal = %self.wal_name,
                %error,
                "WAL writer distressed"
            );
        }
    }

    fn note_critical(&mut self, error: &WalError) {
        if error.is_critical() {
            self.enter_distress(error);
        }
    }

    fn note_result<T>(&mut self, result: WalResult<T>) -> WalResult<T> {
        if let Err(e) = &result {
            self.note_critical(e);
        }
        result
    }

    fn events_mut(&mut self) -> WalResult<&mut WalEventWriter> {
        self.events
            .as_mut()
            .ok_or_else(|| WalError::invalid_state("event log is closed"))
    }

    fn current_segment_dir(&self) -> PathBuf {
        fs::segment_dir(&self.wal_root, self.segment_id)
    }

    fn column_label(&self, column_index: usize) -> String {
        if column_index < self.metadata.column_count() {
            self.metadata.column(column_index).name().to_string()
        } else {
            format!("#{column_index}")
        }
    }

    fn prepare_row(&mut self, timestamp: i64) -> WalResult<()> {
        if self.roll_segment_on_next_row {
            self.open_new_segment()?;
            self.roll_segment_on_next_row = false;
        }
        if let Some(timestamp_index) = self.metadata.timestamp_index() {
            let row = self.segment_row_count;
            let slot = &mut self.columns[timestamp_index];
            let files = slot
                .files
                .as_mut()
                .ok_or_else(|| WalError::invalid_state("designated timestamp column is closed"))?;
            files.put_timestamp_entry(timestamp, row)?;
            slot.written_mark = row;
        }
        Ok(())
    }

    pub(crate) fn put_scalar<F>(&mut self, column_index: usize, write: F) -> WalResult<()>
    where
        F: FnOnce(&mut ColumnFilePair) -> WalResult<()>,
    {
        let row = self.segment_row_count;
        let slot = self.columns.get_mut(column_index).ok_or_else(|| {
            WalError::invalid_state(format!("column index out of bounds: {column_index}"))
        })?;
        match slot.files.as_mut() {
            Some(files) => {
                write(files)?;
                slot.written_mark = row;
                Ok(())
            }
            // Column dropped concurrently; the value has nowhere to go and
            // the row remains null here.
            None => Ok(()),
        }
    }

    pub(crate) fn put_symbol(&mut self, column_index: usize, value: Option<&str>) -> WalResult<()> {
        let row = self.segment_row_count;
        let slot = self.columns.get_mut(column_index).ok_or_else(|| {
            WalError::invalid_state(format!("column index out of bounds: {column_index}"))
        })?;
        if let (Some(symbol), Some(files)) = (slot.symbol.as_mut(), slot.files.as_mut()) {
            let key = match value {
                None => SYMBOL_NULL,
                Some(v) => match symbol.reader.key_of(v) {
                    Some(key) => key,
                    None => match symbol.local.get(v) {
                        Some(&key) => key,
                        None => {
                            let key = symbol.initial_count + symbol.local.len() as i32;
                            symbol.local.insert(v.to_string(), key);
                            key
                        }
                    },
                },
            };
            files.put_symbol_key(key)?;
            slot.written_mark = row;
            return Ok(());
        }
        Err(WalError::NotSymbolColumn(self.column_label(column_index)))
    }

    pub(crate) fn put_geo_hash(&mut self, column_index: usize, value: i64) -> WalResult<()> {
        let kind = if column_index < self.metadata.column_count() {
            self.metadata.column(column_index).column_type()
        } else {
            return Err(WalError::invalid_state(format!(
                "column index out of bounds: {column_index}"
            )));
        };
        match kind {
            ColumnType::GeoByte => self.put_scalar(column_index, |c| c.put_byte(value as i8)),
            ColumnType::GeoShort => self.put_scalar(column_index, |c| c.put_short(value as i16)),
            ColumnType::GeoInt => self.put_scalar(column_index, |c| c.put_int(value as i32)),
            ColumnType::GeoLong => self.put_scalar(column_index, |c| c.put_long(value)),
            other => Err(WalError::InvalidValue {
                what: "geo-hash column",
                value: other.name().to_string(),
            }),
        }
    }

    pub(crate) fn put_geo_str(&mut self, column_index: usize, hash: &str) -> WalResult<()> {
        let bits = if column_index < self.metadata.column_count() {
            self.metadata.column(column_index).geo_bits()
        } else {
            return Err(WalError::invalid_state(format!(
                "column index out of bounds: {column_index}"
            )));
        };
        let value = types::geohash_from_str(hash, bits)?;
        self.put_geo_hash(column_index, value)
    }

    pub(crate) fn put_geo_hash_deg(
        &mut self,
        column_index: usize,
        lat: f64,
        lon: f64,
    ) -> WalResult<()> {
        let bits = if column_index < self.metadata.column_count() {
            self.metadata.column(column_index).geo_bits()
        } else {
            return Err(WalError::invalid_state(format!(
                "column index out of bounds: {column_index}"
            )));
        };
        let value = types::geohash_from_coordinates(lat, lon, bits)?;
        self.put_geo_hash(column_index, value)
    }

    pub(crate) fn row_append(&mut self, timestamp: i64) -> WalResult<()> {
        let result = self.row_append_inner(timestamp);
        self.note_result(result)
    }

    fn row_append_inner(&mut self, timestamp: i64) -> WalResult<()> {
        let row = self.segment_row_count;
        for slot in &mut self.columns {
            if slot.written_mark < row {
                if let Some(files) = slot.files.as_mut() {
                    files.put_null()?;
                }
            }
        }
        if timestamp > self.txn_max_timestamp {
            self.txn_max_timestamp = timestamp;
        } else {
            self.txn_out_of_order |= self.txn_max_timestamp != timestamp;
        }
        if timestamp < self.txn_min_timestamp {
            self.txn_min_timestamp = timestamp;
        }
        self.segment_row_count += 1;
        Ok(())
    }

    pub(crate) fn cancel_row(&mut self) -> WalResult<()> {
        let result = self.set_append_position(self.segment_row_count);
        self.note_result(result)
    }

    fn set_append_position(&mut self, row_count: i64) -> WalResult<()> {
        for slot in &mut self.columns {
            if let Some(files) = slot.files.as_mut() {
                files.jump_to_row(row_count)?;
                slot.written_mark = row_count - 1;
            }
        }
        Ok(())
    }

    fn has_dirty_columns(&self) -> bool {
        self.columns.iter().any(|slot| {
            slot.written_mark >= self.current_txn_start_row
                && slot.written_mark != COLUMN_DELETED_MARK
        })
    }

    fn commit_inner(&mut self) -> WalResult<i64> {
        debug!(
            wal = %self.wal_name,
            segment_id = %self.segment_id,
            row_lo = self.current_txn_start_row,
            row_hi = self.segment_row_count,
            "committing data block"
        );
        let (row_lo, row_hi) = (self.current_txn_start_row, self.segment_row_count);
        let (min_ts, max_ts, out_of_order) = (
            self.txn_min_timestamp,
            self.txn_max_timestamp,
            self.txn_out_of_order,
        );
        self.last_segment_txn = self
            .events_mut()?
            .data(row_lo, row_hi, min_ts, max_ts, out_of_order)?;
        let txn = self.next_sequencer_txn()?;
        self.reset_data_txn_properties();
        self.may_roll_segment_on_next_row();
        Ok(txn)
    }

    /// Optimistic txn allocation: while the sequencer reports the writer's
    /// view as stale, pull the metadata change log and retry.
    fn next_sequencer_txn(&mut self) -> WalResult<i64> {
        loop {
            let sequencer = Arc::clone(&self.sequencer);
            let txn = sequencer.next_txn(
                &self.table_name,
                self.wal_id,
                self.metadata.structure_version(),
                self.segment_id,
                self.last_segment_txn,
            )?;
            if txn == NO_TXN {
                self.apply_metadata_change_log(i64::MAX)?;
            } else {
                self.events_mut()?.confirm_last();
                return Ok(txn);
            }
        }
    }

    fn reset_data_txn_properties(&mut self) {
        self.current_txn_start_row = self.segment_row_count;
        self.txn_min_timestamp = i64::MAX;
        self.txn_max_timestamp = -1;
        self.txn_out_of_order = false;
        for slot in &mut self.columns {
            if let Some(symbol) = slot.symbol.as_mut() {
                symbol.local.clear();
                symbol.initial_count = symbol.reader.symbol_count();
            }
        }
    }

    fn may_roll_segment_on_next_row(&mut self) {
        if !self.roll_segment_on_next_row
            && self.segment_row_count >= self.config.segment_rollover_row_count as i64
        {
            self.roll_segment_on_next_row = true;
        }
    }

    /// Applies sequencer-side schema changes up to `version_hi` exclusive,
    /// requiring strict `+1` version steps. Any failure poisons the writer.
    fn apply_metadata_change_log(&mut self, version_hi: i64) -> WalResult<()> {
        let sequencer = Arc::clone(&self.sequencer);
        let mut cursor: Box<dyn MetadataChangeLog> = match sequencer
            .metadata_change_log(&self.table_name, self.metadata.structure_version())
        {
            Ok(cursor) => cursor,
            Err(e) => {
                self.enter_distress(&e);
                return Err(e);
            }
        };
        let mut version = self.metadata.structure_version();
        while version < version_hi {
            let Some(action) = cursor.next() else {
                break;
            };
            if let Err(e) = self.apply_action(&action) {
                self.enter_distress(&e);
                return Err(e);
            }
            version += 1;
            if version != self.metadata.structure_version() {
                let e = WalError::StructureVersionSkew {
                    table: self.table_name.clone(),
                    version,
                };
                self.enter_distress(&e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Validates an alter operation against the local schema, catching up
    /// and revalidating once when the schema may simply be stale.
    fn validate_operation(&mut self, operation: &AlterOperation) -> WalResult<()> {
        match self.validate_operation_once(operation) {
            Ok(()) => Ok(()),
            Err(e)
                if !e.is_critical() && !matches!(e, WalError::MultiStatementAlter { .. }) =>
            {
                self.apply_metadata_change_log(i64::MAX)?;
                self.validate_operation_once(operation)
            }
            Err(e) => Err(e),
        }
    }

    fn validate_operation_once(&self, operation: &AlterOperation) -> WalResult<()> {
        let old_version = self.metadata.structure_version();
        let steps = operation.actions().len() as i64;
        if steps != 1 {
            return Err(WalError::MultiStatementAlter {
                table: self.table_name.clone(),
                old_version,
                new_version: old_version + steps,
            });
        }
        for action in operation.actions() {
            match action {
                AlterAction::AddColumn {
                    name,
                    column_type,
                    geo_bits,
                } => {
                    if !fs::is_valid_column_name(name) {
                        return Err(WalError::InvalidColumnName(name.clone()));
                    }
                    if self.metadata.column_index_quiet(name).is_some() {
                        return Err(WalError::DuplicateColumn(name.clone()));
                    }
                    match column_type.geo_bits_range() {
                        Some((lo, hi)) if !(lo..=hi).contains(geo_bits) => {
                            return Err(WalError::InvalidGeoBits {
                                kind: column_type.name(),
                                bits: *geo_bits,
                            });
                        }
                        None if *geo_bits != 0 => {
                            return Err(WalError::InvalidGeoBits {
                                kind: column_type.name(),
                                bits: *geo_bits,
                            });
                        }
                        _ => {}
                    }
                }
                AlterAction::RemoveColumn { name } => {
                    let index = self
                        .metadata
                        .column_index_quiet(name)
                        .ok_or_else(|| WalError::ColumnNotFound(name.clone()))?;
                    if Some(index) == self.metadata.timestamp_index() {
                        return Err(WalError::TimestampColumn(name.clone()));
                    }
                }
                AlterAction::RenameColumn { name, new_name } => {
                    let index = self
                        .metadata
                        .column_index_quiet(name)
                        .ok_or_else(|| WalError::ColumnNotFound(name.clone()))?;
                    if Some(index) == self.metadata.timestamp_index() {
                        return Err(WalError::TimestampColumn(name.clone()));
                    }
                    if !fs::is_valid_column_name(new_name) {
                        return Err(WalError::InvalidColumnName(new_name.clone()));
                    }
                    if self.metadata.column_index_quiet(new_name).is_some() {
                        return Err(WalError::DuplicateColumn(new_name.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_operation_locally(&mut self, operation: &AlterOperation) -> WalResult<()> {
        for action in operation.actions() {
            self.apply_action(action)?;
        }
        Ok(())
    }

    fn apply_action(&mut self, action: &AlterAction) -> WalResult<()> {
        match action {
            AlterAction::AddColumn {
                name,
                column_type,
                geo_bits,
            } => self.apply_add_column(name, *column_type, *geo_bits),
            AlterAction::RemoveColumn { name } => self.apply_remove_column(name),
            AlterAction::RenameColumn { name, new_name } => {
                self.apply_rename_column(name, new_name)
            }
        }
    }

    fn apply_add_column(
        &mut self,
        name: &str,
        column_type: ColumnType,
        geo_bits: u8,
    ) -> WalResult<()> {
        if let Some(index) = self.metadata.column_index_quiet(name) {
            return if self.metadata.column(index).column_type() == column_type {
                info!(
                    wal = %self.wal_name,
                    column = name,
                    "column has already been added by another WAL writer"
                );
                Ok(())
            } else {
                Err(WalError::DuplicateColumn(name.to_string()))
            };
        }

        let uncommitted_rows = self.uncommitted_row_count();
        if self.current_txn_start_row > 0 {
            self.roll_uncommitted_to_new_segment()?;
        }
        if self.current_txn_start_row == 0 || self.segment_row_count == self.current_txn_start_row
        {
            let rows_in_segment = self.uncommitted_row_count();
            self.metadata.add_column(name, column_type, geo_bits)?;
            let index = self.metadata.column_count() - 1;
            self.columns.push(ColumnSlot::live());
            if column_type.is_symbol() {
                // A freshly added column has no base dictionary yet.
                self.configure_symbol_map(index, name, 0, fs::COLUMN_NAME_TXN_NONE)?;
            }
            if !self.roll_segment_on_next_row {
                // Uncommitted rows (if any) were already rolled into the
                // current segment; snapshot the new schema there and open
                // the column's files. With a roll pending both happen on the
                // next row instead.
                let dir = self.current_segment_dir();
                self.metadata.switch_to(&dir)?;
                let files = ColumnFilePair::create(
                    &dir,
                    name,
                    column_type,
                    false,
                    self.config.data_append_page_size,
                )?;
                self.columns[index].files = Some(files);
            }
            if uncommitted_rows > 0 {
                if let Some(files) = self.columns[index].files.as_mut() {
                    for _ in 0..rows_in_segment {
                        files.put_null()?;
                    }
                }
            }
            info!(
                wal = %self.wal_name,
                segment_id = %self.segment_id,
                column = name,
                "added column to WAL"
            );
            Ok(())
        } else {
            Err(WalError::ConcurrentStructureChange {
                table: self.table_name.clone(),
                column: name.to_string(),
            })
        }
    }

    fn apply_remove_column(&mut self, name: &str) -> WalResult<()> {
        let Some(index) = self.metadata.column_index_quiet(name) else {
            return Err(WalError::ColumnNotFound(name.to_string()));
        };
        let kind = self.metadata.column(index).column_type();
        if self.current_txn_start_row > 0 {
            self.roll_uncommitted_to_new_segment()?;
        }
        if self.current_txn_start_row == 0 || self.segment_row_count == self.current_txn_start_row
        {
            self.metadata.remove_column(name)?;
            if !self.roll_segment_on_next_row {
                self.metadata.switch_to(&self.current_segment_dir())?;
            }
            if kind.is_symbol() {
                self.remove_symbol_map(index);
            }
            self.mark_column_removed(index)?;
            info!(
                wal = %self.wal_name,
                segment_id = %self.segment_id,
                column = name,
                "removed column from WAL"
            );
            Ok(())
        } else {
            Err(WalError::ConcurrentStructureChange {
                table: self.table_name.clone(),
                column: name.to_string(),
            })
        }
    }

    fn apply_rename_column(&mut self, name: &str, new_name: &str) -> WalResult<()> {
        let Some(index) = self.metadata.column_index_quiet(name) else {
            return Err(WalError::ColumnNotFound(name.to_string()));
        };
        if self.current_txn_start_row > 0 {
            self.roll_uncommitted_to_new_segment()?;
        }
        if self.current_txn_start_row == 0 || self.segment_row_count == self.current_txn_start_row
        {
            self.metadata.rename_column(name, new_name)?;
            // Hard-linked symbol dictionary files under the wal root keep
            // the old name on purpose; they are consulted only by this
            // writer and never resolved through the segment snapshot.
            if !self.roll_segment_on_next_row {
                let dir = self.current_segment_dir();
                self.metadata.switch_to(&dir)?;
                if let Some(files) = self.columns[index].files.as_mut() {
                    files.rename_files(&dir, new_name)?;
                }
            }
            info!(
                wal = %self.wal_name,
                segment_id = %self.segment_id,
                column = name,
                new_column = new_name,
                "renamed column in WAL"
            );
            Ok(())
        } else {
            Err(WalError::ConcurrentStructureChange {
                table: self.table_name.clone(),
                column: name.to_string(),
            })
        }
    }

    fn mark_column_removed(&mut self, index: usize) -> WalResult<()> {
        let slot = &mut self.columns[index];
        slot.written_mark = COLUMN_DELETED_MARK;
        if let Some(files) = slot.files.take() {
            files.close(true)?;
        }
        Ok(())
    }

    fn remove_symbol_map(&mut self, index: usize) {
        self.columns[index].symbol = None;
        symbols::remove_symbol_files(&self.wal_root, self.metadata.column(index).name());
    }

    /// Opens a fresh segment once the current one has no uncommitted rows;
    /// scheduled by commit past the rollover threshold or by a schema change
    /// that could not touch the live segment.
    fn open_new_segment(&mut self) -> WalResult<()> {
        let segment_id = self.segment_id.next();
        let dir = fs::segment_dir(&self.wal_root, segment_id);
        std::fs::create_dir_all(&dir)?;
        let lock = DirLock::acquire(&dir)?;

        self.current_txn_start_row = 0;
        self.txn_min_timestamp = i64::MAX;
        self.txn_max_timestamp = -1;
        self.txn_out_of_order = false;

        for index in 0..self.columns.len() {
            let (live, name, kind) = {
                let column = self.metadata.column(index);
                (
                    !column.is_dropped(),
                    column.name().to_string(),
                    column.column_type(),
                )
            };
            if live {
                let designated = Some(index) == self.metadata.timestamp_index();
                let files = ColumnFilePair::create(
                    &dir,
                    &name,
                    kind,
                    designated,
                    self.config.data_append_page_size,
                )?;
                let slot = &mut self.columns[index];
                if let Some(old) = slot.files.replace(files) {
                    old.close(true)?;
                }
                slot.written_mark = -1;
                if let Some(symbol) = slot.symbol.as_mut() {
                    symbol.initial_count = symbol.reader.symbol_count();
                    symbol.local.clear();
                }
            } else {
                self.columns[index].written_mark = COLUMN_DELETED_MARK;
            }
        }

        self.segment_row_count = 0;
        self.metadata.switch_to(&dir)?;
        self.events_mut()?.switch_to(&dir)?;
        fs::fsync_dir(&dir)?;
        self.last_segment_txn = 0;
        self.segment_lock = Some(lock);
        self.segment_id = segment_id;
        info!(wal = %self.wal_name, segment_id = %segment_id, "opened WAL segment");
        Ok(())
    }

    /// Relocates the current transaction's uncommitted rows into a freshly
    /// laid-out segment; used by schema changes arriving mid-transaction.
    ///
    /// With no uncommitted rows the roll is deferred to the next row
    /// instead. The in-flight DATA event of the old segment (written by a
    /// commit that is catching up on this very schema change) is withdrawn
    /// and re-emitted as `[0, uncommitted)` in the new segment.
    fn roll_uncommitted_to_new_segment(&mut self) -> WalResult<()> {
        let uncommitted_rows = self.uncommitted_row_count();
        let new_segment_id = self.segment_id.next();

        if uncommitted_rows > 0 {
            let new_dir = fs::segment_dir(&self.wal_root, new_segment_id);
            std::fs::create_dir_all(&new_dir)?;
            let new_lock = DirLock::acquire(&new_dir)?;
            info!(
                wal = %self.wal_name,
                new_segment_id = %new_segment_id,
                row_count = uncommitted_rows,
                "rolling uncommitted rows to new segment"
            );

            let row_lo = self.current_txn_start_row;
            let row_hi = self.segment_row_count;
            // Copy phase: relocate every live column's uncommitted byte
            // range. A failure drops the collected descriptors and leaves
            // the new directory behind for cleanup.
            let mut switches: Vec<Option<ColumnSwitch>> = Vec::with_capacity(self.columns.len());
            for index in 0..self.columns.len() {
                let name = self.metadata.column(index).name();
                match self.columns[index].files.as_ref() {
                    Some(files) => switches.push(Some(column::roll_column_to_segment(
                        files, &new_dir, name, row_lo, row_hi,
                    )?)),
                    None => switches.push(None),
                }
            }
            // Switch phase: adopt the relocated files.
            for (slot, switch) in self.columns.iter_mut().zip(switches) {
                match (slot.files.as_mut(), switch) {
                    (Some(files), Some(switch)) => {
                        files.switch_to_segment(switch)?;
                        slot.written_mark = -1;
                    }
                    _ => slot.written_mark = COLUMN_DELETED_MARK,
                }
            }

            self.events_mut()?.rollback_last()?;
            self.events_mut()?.switch_to(&new_dir)?;
            let (min_ts, max_ts, out_of_order) = (
                self.txn_min_timestamp,
                self.txn_max_timestamp,
                self.txn_out_of_order,
            );
            self.last_segment_txn = self
                .events_mut()?
                .data(0, uncommitted_rows, min_ts, max_ts, out_of_order)?;
            fs::fsync_dir(&new_dir)?;

            self.segment_lock = Some(new_lock);
            self.segment_id = new_segment_id;
            self.segment_row_count = uncommitted_rows;
            self.current_txn_start_row = 0;
        } else if self.segment_row_count > 0 {
            self.roll_segment_on_next_row = true;
        }
        Ok(())
    }

    /// Wires up symbol dictionaries at writer open: reads the base table's
    /// `_txn` / `_cv` files under a bounded spin, insisting the recorded
    /// structure version matches this writer's and that both files agree on
    /// the column version. On any mismatch every symbol column falls back to
    /// an empty dictionary and coins all keys locally.
    fn configure_symbol_table(&mut self) -> WalResult<()> {
        let has_symbols = self
            .metadata
            .columns()
            .any(|c| !c.is_dropped() && c.column_type().is_symbol());
        if !has_symbols {
            return Ok(());
        }
        let table_dir = fs::table_dir(&self.config.db_root, &self.table_name);
        let timeout = self.config.spin_lock_timeout();
        let snapshot = match self.read_base_snapshot(&table_dir, timeout) {
            Ok(snapshot) => snapshot,
            Err(e @ WalError::SpinLockTimeout { .. }) => {
                warn!(
                    table = %self.table_name,
                    error = %e,
                    "base table metadata unstable, using empty symbol dictionaries"
                );
                None
            }
            Err(e) => return Err(e),
        };

        let mut dense_symbol_index = 0_usize;
        for index in 0..self.metadata.column_count() {
            let (is_symbol, dropped, name) = {
                let column = self.metadata.column(index);
                (
                    column.column_type().is_symbol(),
                    column.is_dropped(),
                    column.name().to_string(),
                )
            };
            if is_symbol && !dropped {
                match &snapshot {
                    Some((tx, cv)) => {
                        let count = tx
                            .symbol_counts
                            .get(dense_symbol_index)
                            .copied()
                            .unwrap_or(0);
                        let name_txn = cv.default_column_name_txn(index);
                        self.configure_symbol_map(index, &name, count, name_txn)?;
                    }
                    None => {
                        self.configure_symbol_map(index, &name, 0, fs::COLUMN_NAME_TXN_NONE)?
                    }
                }
            }
            if is_symbol {
                // Dropped symbol columns still occupy a dense slot in the
                // base table's symbol count table.
                dense_symbol_index += 1;
            }
        }
        Ok(())
    }

    fn read_base_snapshot(
        &self,
        table_dir: &Path,
        timeout: Duration,
    ) -> WalResult<Option<(TxSnapshot, ColumnVersionSnapshot)>> {
        let deadline = Instant::now() + timeout;
        loop {
            let tx = TxSnapshot::read(table_dir, timeout)?;
            if tx.structure_version != self.metadata.structure_version() {
                // The on-disk table moved past (or lags) this writer's
                // schema; symbol counts would not line up with our columns.
                return Ok(None);
            }
            let cv = ColumnVersionSnapshot::read(table_dir, timeout)?;
            if tx.column_version == cv.version {
                return Ok(Some((tx, cv)));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::yield_now();
        }
    }

    fn configure_symbol_map(
        &mut self,
        index: usize,
        name: &str,
        symbol_count: i32,
        column_name_txn: i64,
    ) -> WalResult<()> {
        let state = if symbol_count == 0 {
            SymbolState::empty()
        } else {
            let table_dir = fs::table_dir(&self.config.db_root, &self.table_name);
            if symbols::link_symbol_files(&table_dir, &self.wal_root, name, column_name_txn) {
                let reader = SymbolMapReader::open(&self.wal_root, name, symbol_count)?;
                SymbolState {
                    initial_count: reader.symbol_count(),
                    reader,
                    local: HashMap::new(),
                }
            } else {
                SymbolState::empty()
            }
        };
        self.columns[index].symbol = Some(state);
        Ok(())
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for WalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalWriter")
            .field("table", &self.table_name)
            .field("wal", &self.wal_name)
            .field("segment_id", &self.segment_id)
            .field("segment_row_count", &self.segment_row_count)
            .field("distressed", &self.distressed)
            .finish()
    }
}

/// One in-flight row of a [`WalWriter`].
///
/// Setters route typed values into column files; [`Row::append`] fills
/// untouched columns with their null encoding and publishes the row into the
/// current transaction, [`Row::cancel`] discards the partial row.
pub struct Row<'a> {
    writer: &'a mut WalWriter,
    timestamp: i64,
}

impl Row<'_> {
    pub fn put_bool(&mut self, column_index: usize, value: bool) -> WalResult<()> {
        let result = self.writer.put_scalar(column_index, |c| c.put_bool(value));
        self.writer.note_result(result)
    }

    pub fn put_byte(&mut self, column_index: usize, value: i8) -> WalResult<()> {
        let result = self.writer.put_scalar(column_index, |c| c.put_byte(value));
        self.writer.note_result(result)
    }

    pub fn put_short(&mut self, column_index: usize, value: i16) -> WalResult<()> {
        let result = self.writer.put_scalar(column_index, |c| c.put_short(value));
        self.writer.note_result(result)
    }

    pub fn put_char(&mut self, column_index: usize, value: char) -> WalResult<()> {
        let result = self.writer.put_scalar(column_index, |c| c.put_char(value));
        self.writer.note_result(result)
    }

    pub fn put_int(&mut self, column_index: usize, value: i32) -> WalResult<()> {
        let result = self.writer.put_scalar(column_index, |c| c.put_int(value));
        self.writer.note_result(result)
    }

    pub fn put_long(&mut self, column_index: usize, value: i64) -> WalResult<()> {
        let result = self.writer.put_scalar(column_index, |c| c.put_long(value));
        self.writer.note_result(result)
    }

    /// Timestamp values of non-designated timestamp columns.
    pub fn put_timestamp(&mut self, column_index: usize, value: i64) -> WalResult<()> {
        self.put_long(column_index, value)
    }

    pub fn put_float(&mut self, column_index: usize, value: f32) -> WalResult<()> {
        let result = self.writer.put_scalar(column_index, |c| c.put_float(value));
        self.writer.note_result(result)
    }

    pub fn put_double(&mut self, column_index: usize, value: f64) -> WalResult<()> {
        let result = self
            .writer
            .put_scalar(column_index, |c| c.put_double(value));
        self.writer.note_result(result)
    }

    pub fn put_long128(&mut self, column_index: usize, hi: i64, lo: i64) -> WalResult<()> {
        let result = self
            .writer
            .put_scalar(column_index, |c| c.put_long128(hi, lo));
        self.writer.note_result(result)
    }

    pub fn put_long256(
        &mut self,
        column_index: usize,
        l0: i64,
        l1: i64,
        l2: i64,
        l3: i64,
    ) -> WalResult<()> {
        let result = self
            .writer
            .put_scalar(column_index, |c| c.put_long256(l0, l1, l2, l3));
        self.writer.note_result(result)
    }

    /// Parses a hex literal (with or without `0x`) into a 256-bit value.
    pub fn put_long256_hex(&mut self, column_index: usize, hex: &str) -> WalResult<()> {
        let limbs = types::long256_from_hex(hex)?;
        self.put_long256(column_index, limbs[0], limbs[1], limbs[2], limbs[3])
    }

    pub fn put_str(&mut self, column_index: usize, value: &str) -> WalResult<()> {
        let result = self.writer.put_scalar(column_index, |c| c.put_str(value));
        self.writer.note_result(result)
    }

    pub fn put_str_char(&mut self, column_index: usize, value: char) -> WalResult<()> {
        let mut buf = [0_u8; 4];
        let s: &str = value.encode_utf8(&mut buf);
        let result = self.writer.put_scalar(column_index, |c| c.put_str(s));
        self.writer.note_result(result)
    }

    pub fn put_bin(&mut self, column_index: usize, value: &[u8]) -> WalResult<()> {
        let result = self.writer.put_scalar(column_index, |c| c.put_bin(value));
        self.writer.note_result(result)
    }

    /// Resolves a symbol value to its dictionary key, coining a new key for
    /// values unknown to both the base dictionary and this writer.
    pub fn put_sym(&mut self, column_index: usize, value: &str) -> WalResult<()> {
        let result = self.writer.put_symbol(column_index, Some(value));
        self.writer.note_result(result)
    }

    pub fn put_sym_char(&mut self, column_index: usize, value: char) -> WalResult<()> {
        let mut buf = [0_u8; 4];
        let s: &str = value.encode_utf8(&mut buf);
        let result = self.writer.put_symbol(column_index, Some(s));
        self.writer.note_result(result)
    }

    pub fn put_sym_null(&mut self, column_index: usize) -> WalResult<()> {
        let result = self.writer.put_symbol(column_index, None);
        self.writer.note_result(result)
    }

    pub fn put_geo_hash(&mut self, column_index: usize, value: i64) -> WalResult<()> {
        let result = self.writer.put_geo_hash(column_index, value);
        self.writer.note_result(result)
    }

    pub fn put_geo_hash_deg(&mut self, column_index: usize, lat: f64, lon: f64) -> WalResult<()> {
        let result = self.writer.put_geo_hash_deg(column_index, lat, lon);
        self.writer.note_result(result)
    }

    pub fn put_geo_str(&mut self, column_index: usize, hash: &str) -> WalResult<()> {
        let result = self.writer.put_geo_str(column_index, hash);
        self.writer.note_result(result)
    }

    /// Publishes the row: untouched columns receive their null encoding, the
    /// transaction's timestamp range and ordering flag are updated.
    pub fn append(self) -> WalResult<()> {
        let timestamp = self.timestamp;
        self.writer.row_append(timestamp)
    }

    /// Discards the partially written row, rewinding all column cursors to
    /// the current row boundary.
    pub fn cancel(self) -> WalResult<()> {
        self.writer.cancel_row()
    }
}
