use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{WalError, WalResult};
use crate::types::{BIN_HEADER_NULL, STR_HEADER_NULL};

/// A memory-mapped append-only file.
///
/// Models the column, event and metadata files of a segment as
/// `(file, mapped capacity, append cursor)`. The mapping grows in
/// `page_size` quanta; the logical length is the append cursor, and closing
/// with `truncate` shrinks the file to it. [`AppendMemory::jump_to`] rewinds
/// (or advances) the cursor without touching mapped bytes, and
/// [`AppendMemory::switch_to`] adopts a different file in place, truncating
/// the previous one at its cursor.
#[derive(Debug)]
pub struct AppendMemory {
    file: File,
    mmap: MmapMut,
    capacity: u64,
    pos: u64,
    page_size: u64,
    path: PathBuf,
}

impl AppendMemory {
    /// Creates (or truncates) the file at `path` and maps it for appending.
    pub fn create(path: &Path, page_size: u64) -> WalResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(page_size)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            file,
            mmap,
            capacity: page_size,
            pos: 0,
            page_size,
            path: path.to_path_buf(),
        })
    }

    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Updates the remembered path after the file was renamed on disk.
    pub fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    fn ensure_capacity(&mut self, required: u64) -> WalResult<()> {
        if required <= self.capacity {
            return Ok(());
        }
        let new_capacity = required.div_ceil(self.page_size) * self.page_size;
        self.file.set_len(new_capacity)?;
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        self.capacity = new_capacity;
        Ok(())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> WalResult<()> {
        let end = self.pos + bytes.len() as u64;
        self.ensure_capacity(end)?;
        self.mmap[self.pos as usize..end as usize].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    #[inline]
    pub fn put_u8(&mut self, value: u8) -> WalResult<()> {
        self.put_bytes(&[value])
    }

    #[inline]
    pub fn put_i8(&mut self, value: i8) -> WalResult<()> {
        self.put_bytes(&[value as u8])
    }

    #[inline]
    pub fn put_bool(&mut self, value: bool) -> WalResult<()> {
        self.put_u8(value as u8)
    }

    #[inline]
    pub fn put_i16(&mut self, value: i16) -> WalResult<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Characters are stored as 2-byte UTF-16 code units.
    #[inline]
    pub fn put_char(&mut self, value: char) -> WalResult<()> {
        self.put_bytes(&(value as u16).to_le_bytes())
    }

    #[inline]
    pub fn put_i32(&mut self, value: i32) -> WalResult<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    #[inline]
    pub fn put_i64(&mut self, value: i64) -> WalResult<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    #[inline]
    pub fn put_f32(&mut self, value: f32) -> WalResult<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    #[inline]
    pub fn put_f64(&mut self, value: f64) -> WalResult<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Writes two longs as one 16-byte unit.
    pub fn put_i64_pair(&mut self, first: i64, second: i64) -> WalResult<()> {
        let mut buf = [0_u8; 16];
        buf[..8].copy_from_slice(&first.to_le_bytes());
        buf[8..].copy_from_slice(&second.to_le_bytes());
        self.put_bytes(&buf)
    }

    pub fn put_long256(&mut self, l0: i64, l1: i64, l2: i64, l3: i64) -> WalResult<()> {
        let mut buf = [0_u8; 32];
        buf[..8].copy_from_slice(&l0.to_le_bytes());
        buf[8..16].copy_from_slice(&l1.to_le_bytes());
        buf[16..24].copy_from_slice(&l2.to_le_bytes());
        buf[24..].copy_from_slice(&l3.to_le_bytes());
        self.put_bytes(&buf)
    }

    /// Appends a length-prefixed UTF-8 string; returns the cursor after the
    /// write, which var-length columns record in their secondary file.
    pub fn put_str(&mut self, value: &str) -> WalResult<u64> {
        self.put_i32(value.len() as i32)?;
        self.put_bytes(value.as_bytes())?;
        Ok(self.pos)
    }

    /// Appends a null string header; returns the cursor after the write.
    pub fn put_null_str(&mut self) -> WalResult<u64> {
        self.put_i32(STR_HEADER_NULL)?;
        Ok(self.pos)
    }

    /// Appends a length-prefixed binary value; returns the cursor after the
    /// write.
    pub fn put_bin(&mut self, value: &[u8]) -> WalResult<u64> {
        self.put_i64(value.len() as i64)?;
        self.put_bytes(value)?;
        Ok(self.pos)
    }

    /// Appends a null binary header; returns the cursor after the write.
    pub fn put_null_bin(&mut self) -> WalResult<u64> {
        self.put_i64(BIN_HEADER_NULL)?;
        Ok(self.pos)
    }

    /// Reads a long from an absolute offset inside the written region.
    pub fn read_i64(&self, offset: u64) -> WalResult<i64> {
        let end = offset + 8;
        if end > self.capacity {
            return Err(WalError::invalid_state(format!(
                "read past mapped capacity of {}: offset {offset}",
                self.path.display()
            )));
        }
        let mut buf = [0_u8; 8];
        buf.copy_from_slice(&self.mmap[offset as usize..end as usize]);
        Ok(i64::from_le_bytes(buf))
    }

    /// Returns the written bytes in `[lo, hi)`.
    pub fn slice(&self, lo: u64, hi: u64) -> WalResult<&[u8]> {
        if hi > self.capacity || lo > hi {
            return Err(WalError::invalid_state(format!(
                "slice [{lo}, {hi}) past mapped capacity of {}",
                self.path.display()
            )));
        }
        Ok(&self.mmap[lo as usize..hi as usize])
    }

    /// Moves the append cursor, growing the mapping when jumping forward.
    pub fn jump_to(&mut self, offset: u64) -> WalResult<()> {
        self.ensure_capacity(offset)?;
        self.pos = offset;
        Ok(())
    }

    /// Adopts `file` as the backing store, placing the cursor at `pos`.
    ///
    /// The previous file is flushed and truncated at its current cursor.
    pub fn switch_to(&mut self, file: File, path: PathBuf, pos: u64) -> WalResult<()> {
        let len = file.metadata()?.len();
        let capacity = len.max(self.page_size).div_ceil(self.page_size) * self.page_size;
        if capacity != len {
            file.set_len(capacity)?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let old_file = std::mem::replace(&mut self.file, file);
        let old_mmap = std::mem::replace(&mut self.mmap, mmap);
        old_mmap.flush()?;
        drop(old_mmap);
        old_file.set_len(self.pos)?;

        self.capacity = capacity;
        self.pos = pos;
        self.path = path;
        Ok(())
    }

    /// Flushes the mapping and, when `truncate` is set, shrinks the file to
    /// the logical length.
    pub fn close(self, truncate: bool) -> WalResult<()> {
        let AppendMemory {
            file, mmap, pos, ..
        } = self;
        mmap.flush()?;
        drop(mmap);
        if truncate {
            file.set_len(pos)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 64 * 1024;

    #[test]
    fn append_grows_and_truncates_on_close() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("col.d");
        let mut mem = AppendMemory::create(&path, PAGE).expect("create");
        for i in 0..20_000_i64 {
            mem.put_i64(i).expect("append");
        }
        assert_eq!(20_000 * 8, mem.pos());
        assert!(std::fs::metadata(&path).expect("stat").len() >= 20_000 * 8);
        mem.close(true).expect("close");
        assert_eq!(20_000 * 8, std::fs::metadata(&path).expect("stat").len());
    }

    #[test]
    fn jump_rewinds_logical_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("col.d");
        let mut mem = AppendMemory::create(&path, PAGE).expect("create");
        mem.put_i64(1).expect("append");
        mem.put_i64(2).expect("append");
        mem.jump_to(8).expect("jump");
        mem.put_i64(3).expect("append");
        assert_eq!(3, mem.read_i64(8).expect("read"));
        mem.close(true).expect("close");
        assert_eq!(16, std::fs::metadata(&path).expect("stat").len());
    }

    #[test]
    fn var_length_headers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("col.d");
        let mut mem = AppendMemory::create(&path, PAGE).expect("create");
        let end = mem.put_str("abc").expect("str");
        assert_eq!(4 + 3, end);
        let end = mem.put_null_str().expect("null str");
        assert_eq!(4 + 3 + 4, end);
        assert_eq!(
            STR_HEADER_NULL,
            i32::from_le_bytes(mem.slice(7, 11).expect("slice").try_into().expect("len"))
        );
    }

    #[test]
    fn switch_to_truncates_old_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old_path = dir.path().join("0.d");
        let new_path = dir.path().join("1.d");
        let mut mem = AppendMemory::create(&old_path, PAGE).expect("create");
        for i in 0..4_i64 {
            mem.put_i64(i).expect("append");
        }
        // Pretend rows 2..4 moved to the new file.
        let mut new_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&new_path)
            .expect("new file");
        use std::io::Write;
        new_file.write_all(&2_i64.to_le_bytes()).expect("write");
        new_file.write_all(&3_i64.to_le_bytes()).expect("write");
        mem.jump_to(16).expect("jump");
        mem.switch_to(new_file, new_path.clone(), 16).expect("switch");
        assert_eq!(16, std::fs::metadata(&old_path).expect("stat").len());
        assert_eq!(3, mem.read_i64(8).expect("read"));
        mem.put_i64(4).expect("append");
        mem.close(true).expect("close");
        assert_eq!(24, std::fs::metadata(&new_path).expect("stat").len());
    }
}
