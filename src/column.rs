use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::WalResult;
use crate::fs;
use crate::mem::AppendMemory;
use crate::types::{
    ColumnType, GEO_BYTE_NULL, GEO_INT_NULL, GEO_LONG_NULL, GEO_SHORT_NULL, INT_NULL,
    LONG128_NULL_HI, LONG128_NULL_LO, LONG_NULL, SYMBOL_NULL,
};

/// Bytes per row of the designated timestamp column: `(timestamp, row_index)`.
pub const TIMESTAMP_ENTRY_SIZE: u64 = 16;

/// The append files of one live column inside one segment.
///
/// Fixed-width types use only the primary file. Var-length types append
/// payload to the primary and the post-write end offset to the secondary,
/// which starts with a `0` sentinel.
#[derive(Debug)]
pub struct ColumnFilePair {
    kind: ColumnType,
    designated: bool,
    primary: AppendMemory,
    secondary: Option<AppendMemory>,
}

impl ColumnFilePair {
    pub fn create(
        dir: &Path,
        column_name: &str,
        kind: ColumnType,
        designated: bool,
        page_size: u64,
    ) -> WalResult<Self> {
        let primary = AppendMemory::create(&fs::primary_file(dir, column_name), page_size)?;
        let secondary = if kind.is_var_len() {
            let mut mem = AppendMemory::create(&fs::secondary_file(dir, column_name), page_size)?;
            mem.put_i64(0)?;
            Some(mem)
        } else {
            None
        };
        Ok(Self {
            kind,
            designated,
            primary,
            secondary,
        })
    }

    pub fn kind(&self) -> ColumnType {
        self.kind
    }

    /// Bytes per row in the primary file; var-length columns have none.
    fn row_size(&self) -> Option<u64> {
        if self.designated {
            Some(TIMESTAMP_ENTRY_SIZE)
        } else {
            self.kind.fixed_size()
        }
    }

    pub fn put_bool(&mut self, value: bool) -> WalResult<()> {
        self.primary.put_bool(value)
    }

    pub fn put_byte(&mut self, value: i8) -> WalResult<()> {
        self.primary.put_i8(value)
    }

    pub fn put_short(&mut self, value: i16) -> WalResult<()> {
        self.primary.put_i16(value)
    }

    pub fn put_char(&mut self, value: char) -> WalResult<()> {
        self.primary.put_char(value)
    }

    pub fn put_int(&mut self, value: i32) -> WalResult<()> {
        self.primary.put_i32(value)
    }

    pub fn put_long(&mut self, value: i64) -> WalResult<()> {
        self.primary.put_i64(value)
    }

    pub fn put_float(&mut self, value: f32) -> WalResult<()> {
        self.primary.put_f32(value)
    }

    pub fn put_double(&mut self, value: f64) -> WalResult<()> {
        self.primary.put_f64(value)
    }

    /// 128-bit integers are stored low half first.
    pub fn put_long128(&mut self, hi: i64, lo: i64) -> WalResult<()> {
        self.primary.put_i64_pair(lo, hi)
    }

    pub fn put_long256(&mut self, l0: i64, l1: i64, l2: i64, l3: i64) -> WalResult<()> {
        self.primary.put_long256(l0, l1, l2, l3)
    }

    pub fn put_symbol_key(&mut self, key: i32) -> WalResult<()> {
        self.primary.put_i32(key)
    }

    /// Designated timestamp entry: the timestamp plus the row index it was
    /// written at.
    pub fn put_timestamp_entry(&mut self, timestamp: i64, row_index: i64) -> WalResult<()> {
        self.primary.put_i64_pair(timestamp, row_index)
    }

    pub fn put_str(&mut self, value: &str) -> WalResult<()> {
        let end = self.primary.put_str(value)?;
        self.secondary_mut().put_i64(end as i64)
    }

    pub fn put_bin(&mut self, value: &[u8]) -> WalResult<()> {
        let end = self.primary.put_bin(value)?;
        self.secondary_mut().put_i64(end as i64)
    }

    fn secondary_mut(&mut self) -> &mut AppendMemory {
        self.secondary
            .as_mut()
            .expect("var-length column carries a secondary file")
    }

    /// Emits this column's null encoding for one untouched row.
    pub fn put_null(&mut self) -> WalResult<()> {
        use ColumnType::*;
        match self.kind {
            Bool | Byte => self.primary.put_u8(0),
            Short => self.primary.put_i16(0),
            Char => self.primary.put_char('\0'),
            Int => self.primary.put_i32(INT_NULL),
            Long | Date | Timestamp => self.primary.put_i64(LONG_NULL),
            Float => self.primary.put_f32(f32::NAN),
            Double => self.primary.put_f64(f64::NAN),
            Symbol => self.primary.put_i32(SYMBOL_NULL),
            GeoByte => self.primary.put_i8(GEO_BYTE_NULL),
            GeoShort => self.primary.put_i16(GEO_SHORT_NULL),
            GeoInt => self.primary.put_i32(GEO_INT_NULL),
            GeoLong => self.primary.put_i64(GEO_LONG_NULL),
            Long128 => self.primary.put_i64_pair(LONG128_NULL_LO, LONG128_NULL_HI),
            Long256 => self
                .primary
                .put_long256(LONG_NULL, LONG_NULL, LONG_NULL, LONG_NULL),
            String => {
                let end = self.primary.put_null_str()?;
                self.secondary_mut().put_i64(end as i64)
            }
            Binary => {
                let end = self.primary.put_null_bin()?;
                self.secondary_mut().put_i64(end as i64)
            }
        }
    }

    /// Rewinds the append cursors so the files logically hold `row_count`
    /// rows; the physical truncation happens on close.
    pub fn jump_to_row(&mut self, row_count: i64) -> WalResult<()> {
        let row_count = row_count.max(0) as u64;
        if let Some(secondary) = self.secondary.as_mut() {
            let primary_len = if row_count == 0 {
                0
            } else {
                secondary.read_i64(row_count * 8)? as u64
            };
            secondary.jump_to((row_count + 1) * 8)?;
            self.primary.jump_to(primary_len)
        } else {
            let size = self.row_size().expect("fixed-width column");
            self.primary.jump_to(row_count * size)
        }
    }

    /// Current append cursors `(primary, secondary)`.
    pub fn append_offsets(&self) -> (u64, Option<u64>) {
        (self.primary.pos(), self.secondary.as_ref().map(|s| s.pos()))
    }

    /// Renames the column's files in place after a rename-column change;
    /// open descriptors stay valid.
    pub fn rename_files(&mut self, dir: &Path, new_name: &str) -> WalResult<()> {
        if let Some(secondary) = self.secondary.as_mut() {
            let to = fs::secondary_file(dir, new_name);
            std::fs::rename(secondary.path(), &to)?;
            secondary.set_path(to);
        }
        let to = fs::primary_file(dir, new_name);
        std::fs::rename(self.primary.path(), &to)?;
        self.primary.set_path(to);
        Ok(())
    }

    /// Adopts the relocated files produced by [`roll_column_to_segment`],
    /// truncating the files left in the previous segment.
    pub fn switch_to_segment(&mut self, switch: ColumnSwitch) -> WalResult<()> {
        let ColumnSwitch { primary, secondary } = switch;
        self.primary.jump_to(primary.old_offset)?;
        self.primary
            .switch_to(primary.file, primary.path, primary.new_offset)?;
        if let Some(target) = secondary {
            let mem = self.secondary_mut();
            mem.jump_to(target.old_offset)?;
            mem.switch_to(target.file, target.path, target.new_offset)?;
        }
        Ok(())
    }

    pub fn close(self, truncate: bool) -> WalResult<()> {
        let ColumnFilePair {
            primary, secondary, ..
        } = self;
        let first = primary.close(truncate);
        let second = match secondary {
            Some(mem) => mem.close(truncate),
            None => Ok(()),
        };
        first.and(second)
    }
}

/// One relocated file of a column switching segments mid-transaction.
#[derive(Debug)]
pub struct SwitchTarget {
    pub file: std::fs::File,
    pub path: PathBuf,
    /// Logical end of the file left behind in the old segment.
    pub old_offset: u64,
    /// Append cursor in the relocated file.
    pub new_offset: u64,
}

/// Relocated files for one column; dropping it before the switch closes the
/// descriptors and abandons the new segment directory for cleanup.
#[derive(Debug)]
pub struct ColumnSwitch {
    pub primary: SwitchTarget,
    pub secondary: Option<SwitchTarget>,
}

fn create_switch_file(path: &Path, content: &[u8]) -> WalResult<std::fs::File> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(content)?;
    Ok(file)
}

/// Copies the uncommitted row range `[row_lo, row_hi)` of one column into a
/// new segment directory, translating var-length offsets so the relocated
/// secondary starts at zero. The live mapping is untouched until
/// [`ColumnFilePair::switch_to_segment`] adopts the returned files.
pub fn roll_column_to_segment(
    column: &ColumnFilePair,
    new_segment_dir: &Path,
    column_name: &str,
    row_lo: i64,
    row_hi: i64,
) -> WalResult<ColumnSwitch> {
    let (row_lo, row_hi) = (row_lo.max(0) as u64, row_hi.max(0) as u64);
    match (&column.secondary, column.row_size()) {
        (Some(secondary), _) => {
            let primary_lo = secondary.read_i64(row_lo * 8)? as u64;
            let primary_hi = secondary.read_i64(row_hi * 8)? as u64;
            let payload = column.primary.slice(primary_lo, primary_hi)?;
            let primary_file =
                create_switch_file(&fs::primary_file(new_segment_dir, column_name), payload)?;

            let mut offsets = Vec::with_capacity(((row_hi - row_lo + 1) * 8) as usize);
            for row in row_lo..=row_hi {
                let end = secondary.read_i64(row * 8)? as u64;
                offsets.write_i64::<LittleEndian>((end - primary_lo) as i64)?;
            }
            let secondary_file =
                create_switch_file(&fs::secondary_file(new_segment_dir, column_name), &offsets)?;

            Ok(ColumnSwitch {
                primary: SwitchTarget {
                    file: primary_file,
                    path: fs::primary_file(new_segment_dir, column_name),
                    old_offset: primary_lo,
                    new_offset: primary_hi - primary_lo,
                },
                secondary: Some(SwitchTarget {
                    file: secondary_file,
                    path: fs::secondary_file(new_segment_dir, column_name),
                    old_offset: (row_lo + 1) * 8,
                    new_offset: (row_hi - row_lo + 1) * 8,
                }),
            })
        }
        (None, Some(size)) => {
            let data = column.primary.slice(row_lo * size, row_hi * size)?;
            let file = if column.designated {
                // Timestamp entries carry their segment row index in the
                // second long; relocated rows renumber from zero.
                let mut renumbered = Vec::with_capacity(data.len());
                for (row, entry) in data.chunks_exact(TIMESTAMP_ENTRY_SIZE as usize).enumerate() {
                    renumbered.extend_from_slice(&entry[..8]);
                    renumbered.write_i64::<LittleEndian>(row as i64)?;
                }
                create_switch_file(&fs::primary_file(new_segment_dir, column_name), &renumbered)?
            } else {
                create_switch_file(&fs::primary_file(new_segment_dir, column_name), data)?
            };
            Ok(ColumnSwitch {
                primary: SwitchTarget {
                    file,
                    path: fs::primary_file(new_segment_dir, column_name),
                    old_offset: row_lo * size,
                    new_offset: (row_hi - row_lo) * size,
                },
                secondary: None,
            })
        }
        (None, None) => unreachable!("var-length columns carry a secondary file"),
    }
}
