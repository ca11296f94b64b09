use crate::config::SegmentId;
use crate::error::WalResult;
use crate::meta::{AlterAction, AlterOperation, WalWriterMetadata};

/// Sentinel returned by the sequencer when a txn cannot be allocated against
/// the caller's view of the table; the caller must catch up on the metadata
/// change log and retry.
pub const NO_TXN: i64 = -1;

/// The table-scoped coordinator that orders transactions across writers.
///
/// One sequencer serves all WAL writers of a table. Txn allocation is
/// optimistic: the writer states the structure version and segment position
/// it believes in, and the sequencer answers [`NO_TXN`] whenever that view
/// is stale. Implementations live outside this crate; the in-process
/// [`crate::test_support::LocalSequencer`] backs the test suite.
pub trait TableSequencer {
    /// Reserves the next writer id for the table, unique among concurrent
    /// writers.
    fn next_wal_id(&self, table_name: &str) -> WalResult<u32>;

    /// Populates `sink` with the table schema at the current structure
    /// version.
    fn load_table_metadata(&self, table_name: &str, sink: &mut WalWriterMetadata) -> WalResult<()>;

    /// Allocates a txn for a data or SQL event, or [`NO_TXN`] when the
    /// writer's `(structure_version, segment_id, segment_txn)` view no longer
    /// suffices to append.
    fn next_txn(
        &self,
        table_name: &str,
        wal_id: u32,
        structure_version: i64,
        segment_id: SegmentId,
        segment_txn: i64,
    ) -> WalResult<i64>;

    /// Allocates a txn for a structural change advancing `structure_version`
    /// by one, or [`NO_TXN`] when a concurrent change won the race.
    fn next_structure_txn(
        &self,
        table_name: &str,
        structure_version: i64,
        operation: &AlterOperation,
    ) -> WalResult<i64>;

    /// Opens a cursor over schema changes starting at `from_version`. The
    /// cursor is a scoped resource; dropping it releases it.
    fn metadata_change_log(
        &self,
        table_name: &str,
        from_version: i64,
    ) -> WalResult<Box<dyn MetadataChangeLog>>;
}

/// Cursor over the sequencer's schema change log, yielding one action per
/// structure version step.
pub trait MetadataChangeLog {
    fn next(&mut self) -> Option<AlterAction>;
}
