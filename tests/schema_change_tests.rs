use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use tessera_wal::fs as layout;
use tessera_wal::test_support::{
    write_base_cv, write_base_txn, write_symbol_dictionary, LocalSequencer,
};
use tessera_wal::types::{INT_NULL, LONG_NULL};
use tessera_wal::{
    AlterAction, AlterOperation, ColumnType, WalConfig, WalError, WalEvent, WalEventReader,
    WalWriter, WalWriterMetadata,
};

const TABLE: &str = "trades";

fn config(dir: &TempDir) -> WalConfig {
    WalConfig {
        db_root: dir.path().to_path_buf(),
        ..WalConfig::default()
    }
}

fn trades_schema() -> WalWriterMetadata {
    let mut schema = WalWriterMetadata::new();
    schema.init_column("ts", ColumnType::Timestamp, 0);
    schema.init_column("value", ColumnType::Int, 0);
    schema.set_timestamp_index(Some(0));
    schema
}

fn open_writer(dir: &TempDir, sequencer: &Arc<LocalSequencer>) -> WalWriter {
    WalWriter::open(
        config(dir),
        TABLE,
        Arc::clone(sequencer) as Arc<dyn tessera_wal::TableSequencer>,
    )
    .expect("open writer")
}

fn segment_path(writer: &WalWriter, segment: u32) -> PathBuf {
    writer.wal_root().join(segment.to_string())
}

fn insert_value(writer: &mut WalWriter, ts: i64, value: i32) {
    let mut row = writer.new_row_at(ts).expect("row");
    row.put_int(1, value).expect("put");
    row.append().expect("append");
}

fn i32_at(bytes: &[u8], index: usize) -> i32 {
    i32::from_le_bytes(bytes[index * 4..index * 4 + 4].try_into().expect("i32"))
}

fn i64_at(bytes: &[u8], index: usize) -> i64 {
    i64::from_le_bytes(bytes[index * 8..index * 8 + 8].try_into().expect("i64"))
}

#[test]
fn add_column_after_commit_rolls_on_next_row() {
    let dir = TempDir::new().expect("tempdir");
    let sequencer = Arc::new(LocalSequencer::new());
    sequencer.create_table(TABLE, trades_schema());
    let mut writer = open_writer(&dir, &sequencer);

    insert_value(&mut writer, 100, 1);
    insert_value(&mut writer, 200, 2);
    writer.commit().expect("commit");

    let txn = writer
        .apply_alter(&AlterOperation::add_column("x", ColumnType::Int))
        .expect("alter");
    assert!(txn > 0);
    assert_eq!(1, writer.structure_version());
    // The committed rows stay in segment 0; the writer moves on the next
    // row.
    assert_eq!(0, writer.segment_id().as_u32());

    let mut row = writer.new_row_at(300).expect("row");
    row.put_int(1, 3).expect("put");
    row.put_int(2, 33).expect("put");
    row.append().expect("append");
    assert_eq!(1, writer.segment_id().as_u32());
    writer.commit().expect("commit");

    let seg0 = segment_path(&writer, 0);
    let seg1 = segment_path(&writer, 1);
    drop(writer);

    // Segment 0 predates the column and never sees it.
    assert!(!seg0.join("x.d").exists());
    let seg0_meta = WalWriterMetadata::read_from(&seg0.join(layout::META_FILE)).expect("meta");
    assert_eq!(2, seg0_meta.column_count());

    let x = std::fs::read(seg1.join("x.d")).expect("x.d");
    assert_eq!(4, x.len());
    assert_eq!(33, i32_at(&x, 0));
    let seg1_meta = WalWriterMetadata::read_from(&seg1.join(layout::META_FILE)).expect("meta");
    assert_eq!(3, seg1_meta.column_count());
    assert_eq!(1, seg1_meta.structure_version());
    assert_eq!(Some(2), seg1_meta.column_index_quiet("x"));
}

#[test]
fn add_column_with_uncommitted_rows_rolls_them_to_a_new_segment() {
    let dir = TempDir::new().expect("tempdir");
    let sequencer = Arc::new(LocalSequencer::new());
    sequencer.create_table(TABLE, trades_schema());
    let mut writer = open_writer(&dir, &sequencer);
    let mut other = open_writer(&dir, &sequencer);

    insert_value(&mut writer, 10, 1);
    insert_value(&mut writer, 20, 2);
    writer.commit().expect("commit");
    insert_value(&mut writer, 30, 3);
    insert_value(&mut writer, 40, 4);
    insert_value(&mut writer, 50, 5);

    // A concurrent writer wins a schema change while three rows are pending.
    other
        .apply_alter(&AlterOperation::add_column("x", ColumnType::Int))
        .expect("alter");

    // Commit catches up, relocates the pending rows into segment 1 and
    // retries against the new structure version.
    let txn = writer.commit().expect("commit");
    assert!(txn > 0);
    assert_eq!(1, writer.structure_version());
    assert_eq!(1, writer.segment_id().as_u32());
    assert_eq!(3, writer.segment_row_count());
    assert!(!writer.in_transaction());

    let seg0 = segment_path(&writer, 0);
    let seg1 = segment_path(&writer, 1);
    drop(writer);
    drop(other);

    // The old segment keeps only the committed rows and its single
    // confirmed DATA event; the in-flight event moved with the rows.
    let seg0_value = std::fs::read(seg0.join("value.d")).expect("value.d");
    assert_eq!(8, seg0_value.len());
    let seg0_events = WalEventReader::read(&seg0.join(layout::EVENT_FILE)).expect("events");
    assert_eq!(
        vec![WalEvent::Data {
            row_lo: 0,
            row_hi: 2,
            min_timestamp: 10,
            max_timestamp: 20,
            out_of_order: false
        }],
        seg0_events
    );

    let seg1_value = std::fs::read(seg1.join("value.d")).expect("value.d");
    assert_eq!([3, 4, 5], [
        i32_at(&seg1_value, 0),
        i32_at(&seg1_value, 1),
        i32_at(&seg1_value, 2)
    ]);
    // Relocated timestamp entries renumber from row zero.
    let seg1_ts = std::fs::read(seg1.join("ts.d")).expect("ts.d");
    assert_eq!((30, 0), (i64_at(&seg1_ts, 0), i64_at(&seg1_ts, 1)));
    assert_eq!((50, 2), (i64_at(&seg1_ts, 4), i64_at(&seg1_ts, 5)));

    // The new column is back-filled with nulls for the relocated rows.
    let x = std::fs::read(seg1.join("x.d")).expect("x.d");
    assert_eq!(12, x.len());
    assert!((0..3).all(|i| i32_at(&x, i) == INT_NULL));

    let seg1_events = WalEventReader::read(&seg1.join(layout::EVENT_FILE)).expect("events");
    assert_eq!(
        vec![WalEvent::Data {
            row_lo: 0,
            row_hi: 3,
            min_timestamp: 30,
            max_timestamp: 50,
            out_of_order: false
        }],
        seg1_events
    );
}

#[test]
fn concurrent_writer_catches_up_in_place_at_segment_start() {
    let dir = TempDir::new().expect("tempdir");
    let sequencer = Arc::new(LocalSequencer::new());
    sequencer.create_table(TABLE, trades_schema());
    let mut w1 = open_writer(&dir, &sequencer);
    let mut w2 = open_writer(&dir, &sequencer);

    // W2 has one pending row from the very start of its segment.
    insert_value(&mut w2, 10, 1);

    // W1 commits a schema change first.
    w1.apply_alter(&AlterOperation::add_column("y", ColumnType::Long))
        .expect("alter");

    // W2's commit receives NO_TXN, applies the change log locally (adding
    // the column in place and back-filling the pending row) and succeeds.
    let txn = w2.commit().expect("commit");
    assert!(txn > 0);
    assert_eq!(1, w2.structure_version());
    assert_eq!(0, w2.segment_id().as_u32());

    let mut row = w2.new_row_at(20).expect("row");
    row.put_int(1, 2).expect("put");
    row.put_long(2, 42).expect("put");
    row.append().expect("append");
    w2.commit().expect("commit");

    let seg0 = segment_path(&w2, 0);
    drop(w2);
    drop(w1);

    let y = std::fs::read(seg0.join("y.d")).expect("y.d");
    assert_eq!(16, y.len());
    assert_eq!(LONG_NULL, i64_at(&y, 0));
    assert_eq!(42, i64_at(&y, 1));

    let events = WalEventReader::read(&seg0.join(layout::EVENT_FILE)).expect("events");
    assert_eq!(2, events.len());
    assert!(matches!(
        events[0],
        WalEvent::Data { row_lo: 0, row_hi: 1, .. }
    ));
    assert!(matches!(
        events[1],
        WalEvent::Data { row_lo: 1, row_hi: 2, .. }
    ));

    let meta = WalWriterMetadata::read_from(&seg0.join(layout::META_FILE)).expect("meta");
    assert_eq!(Some(2), meta.column_index_quiet("y"));
    assert_eq!(1, meta.structure_version());
}

#[test]
fn remove_column_tombstones_the_slot() {
    let dir = TempDir::new().expect("tempdir");
    let sequencer = Arc::new(LocalSequencer::new());
    let mut schema = trades_schema();
    schema.init_column("extra", ColumnType::Double, 0);
    sequencer.create_table(TABLE, schema);
    let mut writer = open_writer(&dir, &sequencer);

    insert_value(&mut writer, 10, 1);
    writer.commit().expect("commit");

    writer
        .apply_alter(&AlterOperation::remove_column("extra"))
        .expect("alter");
    assert_eq!(1, writer.structure_version());
    assert_eq!(None, writer.metadata().column_index_quiet("extra"));
    assert_eq!(3, writer.metadata().column_count());

    // Writes to the dropped slot are discarded; the row still lands.
    let mut row = writer.new_row_at(20).expect("row");
    row.put_int(1, 2).expect("put");
    row.put_double(2, 1.5).expect("put dropped");
    row.append().expect("append");
    writer.commit().expect("commit");

    let seg1 = segment_path(&writer, 1);
    drop(writer);

    assert!(!seg1.join("extra.d").exists());
    let meta = WalWriterMetadata::read_from(&seg1.join(layout::META_FILE)).expect("meta");
    assert_eq!(3, meta.column_count());
    assert!(meta.column(2).is_dropped());
    assert_eq!(None, meta.column_index_quiet("extra"));
}

#[test]
fn remove_symbol_column_deletes_linked_dictionary_files() {
    let dir = TempDir::new().expect("tempdir");
    let sequencer = Arc::new(LocalSequencer::new());
    let mut schema = trades_schema();
    schema.init_column("sym", ColumnType::Symbol, 0);
    sequencer.create_table(TABLE, schema);

    let table_dir = dir.path().join(TABLE);
    write_base_txn(&table_dir, 0, 1, &[1]).expect("base txn");
    write_base_cv(&table_dir, 1, &[(2, 4)]).expect("base cv");
    write_symbol_dictionary(&table_dir, "sym", 4, &["only"]).expect("dict");

    let mut writer = open_writer(&dir, &sequencer);
    assert!(writer.wal_root().join("sym.o").exists());

    writer
        .apply_alter(&AlterOperation::remove_column("sym"))
        .expect("alter");

    for suffix in ["o", "c", "k", "v"] {
        assert!(
            !writer.wal_root().join(format!("sym.{suffix}")).exists(),
            "sym.{suffix} should be gone"
        );
    }
    // The base table's own files are untouched.
    assert!(table_dir.join("sym.o.4").exists());
    assert_eq!(-1, writer.symbol_count_watermark(2));
}

#[test]
fn rename_column_on_fresh_segment_renames_files_in_place() {
    let dir = TempDir::new().expect("tempdir");
    let sequencer = Arc::new(LocalSequencer::new());
    sequencer.create_table(TABLE, trades_schema());
    let mut writer = open_writer(&dir, &sequencer);

    writer
        .apply_alter(&AlterOperation::rename_column("value", "px"))
        .expect("alter");
    assert_eq!(Some(1), writer.metadata().column_index_quiet("px"));

    let seg0 = segment_path(&writer, 0);
    assert!(seg0.join("px.d").exists());
    assert!(!seg0.join("value.d").exists());

    insert_value(&mut writer, 10, 7);
    writer.commit().expect("commit");
    drop(writer);

    let px = std::fs::read(seg0.join("px.d")).expect("px.d");
    assert_eq!(7, i32_at(&px, 0));
    let meta = WalWriterMetadata::read_from(&seg0.join(layout::META_FILE)).expect("meta");
    assert_eq!(Some(1), meta.column_index_quiet("px"));
}

#[test]
fn rename_after_commit_defers_to_the_next_segment() {
    let dir = TempDir::new().expect("tempdir");
    let sequencer = Arc::new(LocalSequencer::new());
    sequencer.create_table(TABLE, trades_schema());
    let mut writer = open_writer(&dir, &sequencer);

    insert_value(&mut writer, 10, 1);
    writer.commit().expect("commit");
    writer
        .apply_alter(&AlterOperation::rename_column("value", "px"))
        .expect("alter");

    insert_value(&mut writer, 20, 2);
    writer.commit().expect("commit");
    assert_eq!(1, writer.segment_id().as_u32());

    let seg0 = segment_path(&writer, 0);
    let seg1 = segment_path(&writer, 1);
    drop(writer);

    // The sealed segment keeps the old name in both files and snapshot, so
    // readers of segment 0 see identical bytes under the old metadata.
    assert!(seg0.join("value.d").exists());
    assert!(!seg0.join("px.d").exists());
    let seg0_meta = WalWriterMetadata::read_from(&seg0.join(layout::META_FILE)).expect("meta");
    assert_eq!(Some(1), seg0_meta.column_index_quiet("value"));
    assert_eq!(0, seg0_meta.structure_version());

    assert!(seg1.join("px.d").exists());
    let seg1_meta = WalWriterMetadata::read_from(&seg1.join(layout::META_FILE)).expect("meta");
    assert_eq!(Some(1), seg1_meta.column_index_quiet("px"));
    assert_eq!(1, seg1_meta.structure_version());
}

#[test]
fn multi_statement_alter_is_rejected_without_retry() {
    let dir = TempDir::new().expect("tempdir");
    let sequencer = Arc::new(LocalSequencer::new());
    sequencer.create_table(TABLE, trades_schema());
    let mut writer = open_writer(&dir, &sequencer);

    let operation = AlterOperation::new(vec![
        AlterAction::AddColumn {
            name: "a".into(),
            column_type: ColumnType::Int,
            geo_bits: 0,
        },
        AlterAction::AddColumn {
            name: "b".into(),
            column_type: ColumnType::Int,
            geo_bits: 0,
        },
    ]);
    assert!(matches!(
        writer.apply_alter(&operation),
        Err(WalError::MultiStatementAlter { .. })
    ));
    assert_eq!(0, writer.structure_version());
    assert!(!writer.is_distressed());

    // The writer stays usable.
    insert_value(&mut writer, 10, 1);
    writer.commit().expect("commit");
}

#[test]
fn designated_timestamp_cannot_be_dropped_or_renamed() {
    let dir = TempDir::new().expect("tempdir");
    let sequencer = Arc::new(LocalSequencer::new());
    sequencer.create_table(TABLE, trades_schema());
    let mut writer = open_writer(&dir, &sequencer);

    assert!(matches!(
        writer.apply_alter(&AlterOperation::remove_column("ts")),
        Err(WalError::TimestampColumn(_))
    ));
    assert!(matches!(
        writer.apply_alter(&AlterOperation::rename_column("ts", "when")),
        Err(WalError::TimestampColumn(_))
    ));
    assert!(!writer.is_distressed());
    assert_eq!(0, writer.structure_version());
}

#[test]
fn alter_with_uncommitted_inserts_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let sequencer = Arc::new(LocalSequencer::new());
    sequencer.create_table(TABLE, trades_schema());
    let mut writer = open_writer(&dir, &sequencer);

    insert_value(&mut writer, 10, 1);
    assert!(matches!(
        writer.apply_alter(&AlterOperation::add_column("x", ColumnType::Int)),
        Err(WalError::UncommittedInserts { .. })
    ));
    assert!(!writer.is_distressed());

    writer.rollback().expect("rollback");
    writer
        .apply_alter(&AlterOperation::add_column("x", ColumnType::Int))
        .expect("alter");
}

#[test]
fn stale_validation_catches_up_and_retries_once() {
    let dir = TempDir::new().expect("tempdir");
    let sequencer = Arc::new(LocalSequencer::new());
    sequencer.create_table(TABLE, trades_schema());
    let mut w1 = open_writer(&dir, &sequencer);
    let mut w2 = open_writer(&dir, &sequencer);

    w1.apply_alter(&AlterOperation::add_column("y", ColumnType::Long))
        .expect("alter");

    // W2 validates the removal of a column it has never seen; the catch-up
    // retry makes it pass.
    let txn = w2
        .apply_alter(&AlterOperation::remove_column("y"))
        .expect("alter");
    assert!(txn > 0);
    assert_eq!(2, w2.structure_version());
    assert_eq!(None, w2.metadata().column_index_quiet("y"));
}

#[test]
fn go_active_pulls_outstanding_schema_changes() {
    let dir = TempDir::new().expect("tempdir");
    let sequencer = Arc::new(LocalSequencer::new());
    sequencer.create_table(TABLE, trades_schema());
    let mut w1 = open_writer(&dir, &sequencer);
    let mut w2 = open_writer(&dir, &sequencer);

    w1.apply_alter(&AlterOperation::add_column("a", ColumnType::Int))
        .expect("alter");
    w1.apply_alter(&AlterOperation::add_column("b", ColumnType::Long))
        .expect("alter");

    assert_eq!(0, w2.structure_version());
    assert!(w2.go_active());
    assert_eq!(2, w2.structure_version());
    assert_eq!(Some(2), w2.metadata().column_index_quiet("a"));
    assert_eq!(Some(3), w2.metadata().column_index_quiet("b"));
    assert!(!w2.is_distressed());
}

#[test]
fn duplicate_add_surfaces_after_catch_up() {
    let dir = TempDir::new().expect("tempdir");
    let sequencer = Arc::new(LocalSequencer::new());
    sequencer.create_table(TABLE, trades_schema());
    let mut w1 = open_writer(&dir, &sequencer);
    let mut w2 = open_writer(&dir, &sequencer);

    w1.apply_alter(&AlterOperation::add_column("x", ColumnType::Int))
        .expect("alter");

    // W2 races the same add; after catching up the column exists and the
    // operation is invalid, but the writer survives.
    assert!(matches!(
        w2.apply_alter(&AlterOperation::add_column("x", ColumnType::Int)),
        Err(WalError::DuplicateColumn(_))
    ));
    assert!(!w2.is_distressed());
    assert_eq!(1, w2.structure_version());
    assert_eq!(Some(2), w2.metadata().column_index_quiet("x"));

    insert_value(&mut w2, 10, 1);
    w2.commit().expect("commit");
}

#[test]
fn invalid_column_names_are_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let sequencer = Arc::new(LocalSequencer::new());
    sequencer.create_table(TABLE, trades_schema());
    let mut writer = open_writer(&dir, &sequencer);

    for bad in ["", "a.b", "a/b", "a*b"] {
        assert!(matches!(
            writer.apply_alter(&AlterOperation::add_column(bad, ColumnType::Int)),
            Err(WalError::InvalidColumnName(_))
        ));
    }
    assert_eq!(0, writer.structure_version());
}

#[test]
fn add_symbol_column_mid_stream_coins_keys_locally() {
    let dir = TempDir::new().expect("tempdir");
    let sequencer = Arc::new(LocalSequencer::new());
    sequencer.create_table(TABLE, trades_schema());
    let mut writer = open_writer(&dir, &sequencer);

    insert_value(&mut writer, 10, 1);
    writer.commit().expect("commit");
    writer
        .apply_alter(&AlterOperation::add_column("tag", ColumnType::Symbol))
        .expect("alter");

    let mut row = writer.new_row_at(20).expect("row");
    row.put_sym(2, "fresh").expect("sym");
    row.append().expect("append");
    writer.commit().expect("commit");
    assert_eq!(0, writer.symbol_count_watermark(2));

    let seg1 = segment_path(&writer, 1);
    drop(writer);
    let tag = std::fs::read(seg1.join("tag.d")).expect("tag.d");
    assert_eq!(0, i32_at(&tag, 0));
}
