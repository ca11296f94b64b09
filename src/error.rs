use std::fmt::Display;
use std::path::PathBuf;

/// A specialized error type for WAL writer operations.
///
/// Errors split into two classes, see [`WalError::is_critical`]: invalid
/// arguments leave the writer usable, critical failures transition it into
/// the distressed state from which only `close` is legal.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Could not acquire an advisory lock.
    #[error("cannot lock {path:?}")]
    CannotLock { path: PathBuf },
    /// Column name failed identifier validation.
    #[error("invalid column name: {0}")]
    InvalidColumnName(String),
    /// A column with this name already exists.
    #[error("duplicate column name: {0}")]
    DuplicateColumn(String),
    /// No live column with this name.
    #[error("column does not exist: {0}")]
    ColumnNotFound(String),
    /// Unknown or out-of-range column type tag.
    #[error("invalid column type: {0}")]
    InvalidColumnType(i32),
    /// Geo-hash precision outside the storage width of the column kind.
    #[error("invalid geo-hash bits for {kind}: {bits}")]
    InvalidGeoBits { kind: &'static str, bits: u8 },
    /// A value could not be parsed into the column's representation.
    #[error("invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: String },
    /// The designated timestamp column cannot be dropped or renamed.
    #[error("cannot drop or rename designated timestamp column: {0}")]
    TimestampColumn(String),
    /// Structure changes are forbidden while rows are pending.
    #[error("cannot alter table with uncommitted inserts [table={table}]")]
    UncommittedInserts { table: String },
    /// DDL advancing the structure version by more than one step.
    #[error(
        "statements containing multiple transactions are not supported for WAL tables \
         [table={table}, old_version={old_version}, new_version={new_version}]"
    )]
    MultiStatementAlter {
        table: String,
        old_version: i64,
        new_version: i64,
    },
    /// Typed setter used against a column without a symbol dictionary.
    #[error("column {0} has no symbol dictionary")]
    NotSymbolColumn(String),
    /// The writer has entered the terminal distressed state.
    #[error("WAL writer is distressed and cannot be used any more [table={table}, wal={wal_id}]")]
    Distressed { table: String, wal_id: u32 },
    /// A record could not be parsed or failed its checksum.
    #[error("corrupted record: {0}")]
    CorruptedRecord(String),
    /// The metadata change log did not advance the version by exactly one.
    #[error("could not apply table definition changes, version unchanged [table={table}, version={version}]")]
    StructureVersionSkew { table: String, version: i64 },
    /// A concurrent writer changed the schema in a way this writer cannot absorb.
    #[error("column {column} changed concurrently, cannot apply commit [table={table}]")]
    ConcurrentStructureChange { table: String, column: String },
    /// Timed out waiting for a consistent base-table metadata read.
    #[error("timed out reading {path:?} after {timeout_ms} ms")]
    SpinLockTimeout { path: PathBuf, timeout_ms: u64 },
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl WalError {
    /// Create a corrupted-record error from a displayable value.
    pub fn corrupted<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::CorruptedRecord(msg.to_string())
    }

    /// Create an invalid-state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }

    /// Whether this error poisons the writer.
    ///
    /// Critical errors indicate a possible partial write or an inconsistency
    /// with the sequencer; the writer marks itself distressed and the owner
    /// must discard it. Non-critical errors reject the operation and leave
    /// the writer state untouched.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            WalError::Io(_)
                | WalError::CannotLock { .. }
                | WalError::Distressed { .. }
                | WalError::CorruptedRecord(_)
                | WalError::StructureVersionSkew { .. }
                | WalError::ConcurrentStructureChange { .. }
                | WalError::SpinLockTimeout { .. }
                | WalError::InvalidState(_)
        )
    }
}

/// A Result type alias for WAL writer operations.
pub type WalResult<T> = Result<T, WalError>;
