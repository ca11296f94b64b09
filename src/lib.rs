//! WAL segment writer for Tessera's column-oriented time-series tables.
//!
//! Every writer instance owns an isolated append-only directory
//! `<db_root>/<table>/wal<N>` and persists row inserts and schema changes
//! into a sequence of numbered, self-contained *segments*:
//!
//! ```text
//! <table>/
//!   _txn, _cv            base table files, shared read-only via hard links
//!   wal<N>/
//!     _lock              writer-scoped advisory lock
//!     <segment_id>/
//!       _lock            segment-scoped advisory lock
//!       _meta            schema snapshot at segment open
//!       _event           DATA / SQL / TRUNCATE event log
//!       <column>.d       primary column file
//!       <column>.i       var-length offset index
//! ```
//!
//! Commit ordering across concurrent writers of one table goes through a
//! shared [`TableSequencer`]: txn allocation is optimistic, and a
//! [`sequencer::NO_TXN`] answer makes the writer pull the metadata change
//! log, replay the missed schema changes against its own segment state
//! (rolling uncommitted rows into a freshly laid-out segment when needed)
//! and retry.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tessera_wal::test_support::LocalSequencer;
//! use tessera_wal::{ColumnType, WalConfig, WalWriter, WalWriterMetadata};
//!
//! # fn main() -> tessera_wal::WalResult<()> {
//! let sequencer = Arc::new(LocalSequencer::new());
//! let mut schema = WalWriterMetadata::new();
//! schema.init_column("ts", ColumnType::Timestamp, 0);
//! schema.init_column("price", ColumnType::Double, 0);
//! schema.set_timestamp_index(Some(0));
//! sequencer.create_table("trades", schema);
//!
//! let mut writer = WalWriter::open(WalConfig::default(), "trades", sequencer)?;
//! let mut row = writer.new_row_at(1_000_000)?;
//! row.put_double(1, 42.5)?;
//! row.append()?;
//! let txn = writer.commit()?;
//! # let _ = txn;
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure model
//!
//! Invalid arguments (duplicate columns, bad identifiers, altering with
//! uncommitted inserts) reject the call and leave the writer usable. Any
//! partial-write hazard — I/O failure, a sequencer inconsistency, a failed
//! structure-change replay — moves the writer into the terminal *distressed*
//! state: every subsequent entry point fails and the owning pool must
//! discard the instance. Distress is a queryable state
//! ([`WalWriter::is_distressed`]), not just an error path.

pub mod column;
pub mod config;
pub mod error;
pub mod events;
pub mod fs;
pub mod mem;
pub mod meta;
pub mod sequencer;
pub mod symbols;
pub mod test_support;
pub mod types;

mod writer;

pub use config::{SegmentId, WalConfig};
pub use error::{WalError, WalResult};
pub use events::{WalEvent, WalEventReader, WalEventWriter};
pub use meta::{AlterAction, AlterOperation, ColumnMeta, WalWriterMetadata};
pub use sequencer::{MetadataChangeLog, TableSequencer, NO_TXN};
pub use types::ColumnType;
pub use writer::{Row, WalWriter};
