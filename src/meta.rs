use std::io::{Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{WalError, WalResult};
use crate::fs;
use crate::types::ColumnType;

const META_MAGIC: u32 = 0x5457_414C; // "TWAL"
const META_FORMAT_VERSION: u16 = 1;

/// One column of the table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    name: String,
    column_type: ColumnType,
    geo_bits: u8,
    dropped: bool,
}

impl ColumnMeta {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn geo_bits(&self) -> u8 {
        self.geo_bits
    }

    /// Dropped columns keep their slot so indices of later columns stay
    /// stable within the writer's lifetime.
    pub fn is_dropped(&self) -> bool {
        self.dropped
    }
}

/// A single schema change, as carried by the sequencer's change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlterAction {
    AddColumn {
        name: String,
        column_type: ColumnType,
        geo_bits: u8,
    },
    RemoveColumn {
        name: String,
    },
    RenameColumn {
        name: String,
        new_name: String,
    },
}

/// A structural DDL operation submitted to [`crate::WalWriter::apply_alter`].
///
/// Operations advancing the structure version by more than one step (for
/// example `alter table add column a, b`) are rejected by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlterOperation {
    actions: Vec<AlterAction>,
}

impl AlterOperation {
    pub fn new(actions: Vec<AlterAction>) -> Self {
        Self { actions }
    }

    pub fn add_column(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self::new(vec![AlterAction::AddColumn {
            name: name.into(),
            column_type,
            geo_bits: 0,
        }])
    }

    pub fn add_geo_column(name: impl Into<String>, column_type: ColumnType, geo_bits: u8) -> Self {
        Self::new(vec![AlterAction::AddColumn {
            name: name.into(),
            column_type,
            geo_bits,
        }])
    }

    pub fn remove_column(name: impl Into<String>) -> Self {
        Self::new(vec![AlterAction::RemoveColumn { name: name.into() }])
    }

    pub fn rename_column(name: impl Into<String>, new_name: impl Into<String>) -> Self {
        Self::new(vec![AlterAction::RenameColumn {
            name: name.into(),
            new_name: new_name.into(),
        }])
    }

    pub fn actions(&self) -> &[AlterAction] {
        &self.actions
    }
}

/// The writer's view of the table schema.
///
/// Mirrors the base table's structure at a given structure version and is
/// serialized into every segment as its `_meta` snapshot. Mutators bump the
/// structure version by exactly one; the writer checks this after every
/// change-log application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalWriterMetadata {
    columns: Vec<ColumnMeta>,
    timestamp_index: Option<usize>,
    structure_version: i64,
}

impl WalWriterMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of column slots, dropped columns included.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, index: usize) -> &ColumnMeta {
        &self.columns[index]
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnMeta> {
        self.columns.iter()
    }

    /// Index of a live column by name, or `None`.
    ///
    /// Dropped columns do not resolve; their names may be reused.
    pub fn column_index_quiet(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| !c.dropped && c.name == name)
    }

    pub fn column_index(&self, name: &str) -> WalResult<usize> {
        self.column_index_quiet(name)
            .ok_or_else(|| WalError::ColumnNotFound(name.to_string()))
    }

    pub fn timestamp_index(&self) -> Option<usize> {
        self.timestamp_index
    }

    pub fn structure_version(&self) -> i64 {
        self.structure_version
    }

    /// Clears the schema before the sequencer repopulates it.
    pub fn reset(&mut self) {
        self.columns.clear();
        self.timestamp_index = None;
        self.structure_version = 0;
    }

    /// Appends a column without touching the structure version; used while
    /// the sequencer populates a fresh snapshot.
    pub fn init_column(&mut self, name: impl Into<String>, column_type: ColumnType, geo_bits: u8) {
        self.columns.push(ColumnMeta {
            name: name.into(),
            column_type,
            geo_bits,
            dropped: false,
        });
    }

    pub fn set_timestamp_index(&mut self, index: Option<usize>) {
        self.timestamp_index = index;
    }

    pub fn set_structure_version(&mut self, version: i64) {
        self.structure_version = version;
    }

    /// Appends a live column and advances the structure version.
    pub fn add_column(
        &mut self,
        name: &str,
        column_type: ColumnType,
        geo_bits: u8,
    ) -> WalResult<usize> {
        if self.column_index_quiet(name).is_some() {
            return Err(WalError::DuplicateColumn(name.to_string()));
        }
        self.columns.push(ColumnMeta {
            name: name.to_string(),
            column_type,
            geo_bits,
            dropped: false,
        });
        self.structure_version += 1;
        Ok(self.columns.len() - 1)
    }

    /// Tombstones a live column and advances the structure version.
    pub fn remove_column(&mut self, name: &str) -> WalResult<usize> {
        let index = self.column_index(name)?;
        if Some(index) == self.timestamp_index {
            return Err(WalError::TimestampColumn(name.to_string()));
        }
        self.columns[index].dropped = true;
        self.structure_version += 1;
        Ok(index)
    }

    /// Renames a live column and advances the structure version.
    pub fn rename_column(&mut self, name: &str, new_name: &str) -> WalResult<usize> {
        let index = self.column_index(name)?;
        if self.column_index_quiet(new_name).is_some() {
            return Err(WalError::DuplicateColumn(new_name.to_string()));
        }
        self.columns[index].name = new_name.to_string();
        self.structure_version += 1;
        Ok(index)
    }

    /// Serializes the snapshot into `<segment_dir>/_meta`, replacing any
    /// previous snapshot of this segment.
    pub fn switch_to(&self, segment_dir: &Path) -> WalResult<()> {
        let mut buf = Vec::with_capacity(64 + self.columns.len() * 32);
        buf.write_u32::<LittleEndian>(META_MAGIC)?;
        buf.write_u16::<LittleEndian>(META_FORMAT_VERSION)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_i32::<LittleEndian>(self.columns.len() as i32)?;
        buf.write_i32::<LittleEndian>(
            self.timestamp_index.map(|i| i as i32).unwrap_or(-1),
        )?;
        buf.write_i64::<LittleEndian>(self.structure_version)?;
        for column in &self.columns {
            let tag = column.column_type.tag();
            buf.write_i32::<LittleEndian>(if column.dropped { -tag } else { tag })?;
            buf.write_u8(column.geo_bits)?;
            buf.write_u16::<LittleEndian>(column.name.len() as u16)?;
            buf.extend_from_slice(column.name.as_bytes());
        }
        let path = segment_dir.join(fs::META_FILE);
        let mut file = std::fs::File::create(&path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    /// Reads a snapshot back; used by segment readers and tests.
    pub fn read_from(path: &Path) -> WalResult<Self> {
        let bytes = std::fs::read(path)?;
        let mut cursor = Cursor::new(bytes.as_slice());
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != META_MAGIC {
            return Err(WalError::corrupted(format!(
                "bad metadata magic in {}: {magic:#x}",
                path.display()
            )));
        }
        let version = cursor.read_u16::<LittleEndian>()?;
        if version != META_FORMAT_VERSION {
            return Err(WalError::corrupted(format!(
                "unsupported metadata version: {version}"
            )));
        }
        cursor.read_u16::<LittleEndian>()?;
        let column_count = cursor.read_i32::<LittleEndian>()?;
        let timestamp_index = cursor.read_i32::<LittleEndian>()?;
        let structure_version = cursor.read_i64::<LittleEndian>()?;
        let mut columns = Vec::with_capacity(column_count.max(0) as usize);
        for _ in 0..column_count {
            let tag = cursor.read_i32::<LittleEndian>()?;
            let geo_bits = cursor.read_u8()?;
            let name_len = cursor.read_u16::<LittleEndian>()? as usize;
            let mut name = vec![0_u8; name_len];
            cursor.read_exact(&mut name)?;
            columns.push(ColumnMeta {
                name: String::from_utf8(name)
                    .map_err(|e| WalError::corrupted(format!("column name not utf-8: {e}")))?,
                column_type: ColumnType::from_tag(tag.abs())?,
                geo_bits,
                dropped: tag < 0,
            });
        }
        Ok(Self {
            columns,
            timestamp_index: usize::try_from(timestamp_index).ok(),
            structure_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WalWriterMetadata {
        let mut meta = WalWriterMetadata::new();
        meta.init_column("ts", ColumnType::Timestamp, 0);
        meta.init_column("price", ColumnType::Double, 0);
        meta.init_column("sym", ColumnType::Symbol, 0);
        meta.set_timestamp_index(Some(0));
        meta
    }

    #[test]
    fn mutators_advance_structure_version() {
        let mut meta = sample();
        assert_eq!(0, meta.structure_version());
        meta.add_column("qty", ColumnType::Long, 0).expect("add");
        assert_eq!(1, meta.structure_version());
        meta.remove_column("qty").expect("remove");
        assert_eq!(2, meta.structure_version());
        meta.rename_column("price", "px").expect("rename");
        assert_eq!(3, meta.structure_version());
        assert_eq!(Some(1), meta.column_index_quiet("px"));
        assert_eq!(None, meta.column_index_quiet("price"));
    }

    #[test]
    fn dropped_column_does_not_resolve_and_name_is_reusable() {
        let mut meta = sample();
        meta.remove_column("price").expect("remove");
        assert_eq!(None, meta.column_index_quiet("price"));
        assert!(meta.column(1).is_dropped());
        let index = meta.add_column("price", ColumnType::Float, 0).expect("re-add");
        assert_eq!(3, index);
        assert_eq!(Some(3), meta.column_index_quiet("price"));
    }

    #[test]
    fn timestamp_column_cannot_be_removed() {
        let mut meta = sample();
        assert!(matches!(
            meta.remove_column("ts"),
            Err(WalError::TimestampColumn(_))
        ));
        assert_eq!(0, meta.structure_version());
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut meta = sample();
        meta.add_column("geo", ColumnType::GeoInt, 20).expect("add");
        meta.remove_column("price").expect("remove");
        meta.switch_to(dir.path()).expect("switch");

        let read = WalWriterMetadata::read_from(&dir.path().join(fs::META_FILE)).expect("read");
        assert_eq!(meta, read);
        assert!(read.column(1).is_dropped());
        assert_eq!(20, read.column(3).geo_bits());
        assert_eq!(Some(0), read.timestamp_index());
        assert_eq!(2, read.structure_version());
    }
}
