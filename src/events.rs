use std::io::{Cursor, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc64fast_nvme::Digest;

use crate::error::{WalError, WalResult};
use crate::fs;
use crate::mem::AppendMemory;

const EVENT_MAGIC: u32 = 0x5457_4556; // "TWEV"
const EVENT_FORMAT_VERSION: u16 = 1;
const EVENT_HEADER_LEN: u64 = 8;

const KIND_DATA: u8 = 0;
const KIND_SQL: u8 = 1;
const KIND_TRUNCATE: u8 = 2;

/// One record of a segment's event log.
///
/// The record's segment-local txn index is implicit in its position within
/// the file.
#[derive(Debug, Clone, PartialEq)]
pub enum WalEvent {
    /// A block of committed rows `[row_lo, row_hi)`.
    Data {
        row_lo: i64,
        row_hi: i64,
        min_timestamp: i64,
        max_timestamp: i64,
        out_of_order: bool,
    },
    /// A non-structural SQL operation replayed against the base table.
    Sql {
        command_type: i32,
        sql: String,
        execution_context: Vec<u8>,
    },
    /// Truncation of the base table.
    Truncate,
}

/// Appender over a segment's `_event` file.
///
/// Records are `[payload_len: u32][kind: u8][payload][crc64]` with the digest
/// covering kind and payload. The writer remembers the start of the last
/// record until it is confirmed by a sequencer txn, so an in-flight record
/// can be withdrawn when uncommitted rows roll to a new segment.
#[derive(Debug)]
pub struct WalEventWriter {
    mem: AppendMemory,
    page_size: u64,
    next_txn: i64,
    pending_record: Option<u64>,
}

impl WalEventWriter {
    pub fn open(segment_dir: &Path, page_size: u64) -> WalResult<Self> {
        let mem = Self::open_mem(segment_dir, page_size)?;
        Ok(Self {
            mem,
            page_size,
            next_txn: 0,
            pending_record: None,
        })
    }

    fn open_mem(segment_dir: &Path, page_size: u64) -> WalResult<AppendMemory> {
        let mut mem = AppendMemory::create(&segment_dir.join(fs::EVENT_FILE), page_size)?;
        let mut header = Vec::with_capacity(EVENT_HEADER_LEN as usize);
        header.write_u32::<LittleEndian>(EVENT_MAGIC)?;
        header.write_u16::<LittleEndian>(EVENT_FORMAT_VERSION)?;
        header.write_u16::<LittleEndian>(0)?;
        mem.put_bytes(&header)?;
        Ok(mem)
    }

    /// Appends a DATA record; returns its segment-local txn index.
    pub fn data(
        &mut self,
        row_lo: i64,
        row_hi: i64,
        min_timestamp: i64,
        max_timestamp: i64,
        out_of_order: bool,
    ) -> WalResult<i64> {
        let mut payload = Vec::with_capacity(33);
        payload.write_i64::<LittleEndian>(row_lo)?;
        payload.write_i64::<LittleEndian>(row_hi)?;
        payload.write_i64::<LittleEndian>(min_timestamp)?;
        payload.write_i64::<LittleEndian>(max_timestamp)?;
        payload.write_u8(out_of_order as u8)?;
        self.append_record(KIND_DATA, &payload)
    }

    /// Appends an SQL record; returns its segment-local txn index.
    pub fn sql(&mut self, command_type: i32, sql: &str, execution_context: &[u8]) -> WalResult<i64> {
        let mut payload = Vec::with_capacity(12 + sql.len() + execution_context.len());
        payload.write_i32::<LittleEndian>(command_type)?;
        payload.write_u32::<LittleEndian>(sql.len() as u32)?;
        payload.extend_from_slice(sql.as_bytes());
        payload.write_u32::<LittleEndian>(execution_context.len() as u32)?;
        payload.extend_from_slice(execution_context);
        self.append_record(KIND_SQL, &payload)
    }

    /// Appends a TRUNCATE record; returns its segment-local txn index.
    pub fn truncate(&mut self) -> WalResult<i64> {
        self.append_record(KIND_TRUNCATE, &[])
    }

    fn append_record(&mut self, kind: u8, payload: &[u8]) -> WalResult<i64> {
        let start = self.mem.pos();
        let mut digest = Digest::new();
        digest.write(&[kind]);
        digest.write(payload);

        self.mem.put_bytes(&(payload.len() as u32).to_le_bytes())?;
        self.mem.put_u8(kind)?;
        self.mem.put_bytes(payload)?;
        self.mem.put_bytes(&digest.sum64().to_le_bytes())?;

        let txn = self.next_txn;
        self.next_txn += 1;
        self.pending_record = Some(start);
        Ok(txn)
    }

    /// Marks the last record as owned by a granted sequencer txn; it can no
    /// longer be withdrawn.
    pub fn confirm_last(&mut self) {
        self.pending_record = None;
    }

    /// Withdraws the last record when it has not been confirmed yet.
    pub fn rollback_last(&mut self) -> WalResult<()> {
        if let Some(start) = self.pending_record.take() {
            self.mem.jump_to(start)?;
            self.next_txn -= 1;
        }
        Ok(())
    }

    /// Closes the current event file (truncating it) and starts a fresh one
    /// in `segment_dir`, resetting the txn index.
    pub fn switch_to(&mut self, segment_dir: &Path) -> WalResult<()> {
        let fresh = Self::open_mem(segment_dir, self.page_size)?;
        let old = std::mem::replace(&mut self.mem, fresh);
        old.close(true)?;
        self.next_txn = 0;
        self.pending_record = None;
        Ok(())
    }

    pub fn close(self, truncate: bool) -> WalResult<()> {
        self.mem.close(truncate)
    }
}

/// Reads a segment's event log back; used by the WAL apply job and tests.
pub struct WalEventReader;

impl WalEventReader {
    pub fn read(path: &Path) -> WalResult<Vec<WalEvent>> {
        let bytes = std::fs::read(path)?;
        let mut cursor = Cursor::new(bytes.as_slice());
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != EVENT_MAGIC {
            return Err(WalError::corrupted(format!(
                "bad event file magic in {}: {magic:#x}",
                path.display()
            )));
        }
        let version = cursor.read_u16::<LittleEndian>()?;
        if version != EVENT_FORMAT_VERSION {
            return Err(WalError::corrupted(format!(
                "unsupported event file version: {version}"
            )));
        }
        cursor.read_u16::<LittleEndian>()?;

        let mut events = Vec::new();
        loop {
            let remaining = bytes.len() as u64 - cursor.position();
            if remaining < 4 {
                break;
            }
            let payload_len = cursor.read_u32::<LittleEndian>()? as u64;
            if payload_len == 0 || remaining < 4 + 1 + payload_len + 8 {
                // Zero length marks the tail of a file that was not truncated
                // on close; a short record means the same.
                break;
            }
            let kind = cursor.read_u8()?;
            let mut payload = vec![0_u8; payload_len as usize];
            cursor.read_exact(&mut payload)?;
            let stored_crc = cursor.read_u64::<LittleEndian>()?;
            let mut digest = Digest::new();
            digest.write(&[kind]);
            digest.write(&payload);
            if digest.sum64() != stored_crc {
                return Err(WalError::corrupted(format!(
                    "event record checksum mismatch in {} at txn {}",
                    path.display(),
                    events.len()
                )));
            }
            events.push(Self::decode(kind, &payload)?);
        }
        Ok(events)
    }

    fn decode(kind: u8, payload: &[u8]) -> WalResult<WalEvent> {
        let mut cursor = Cursor::new(payload);
        match kind {
            KIND_DATA => Ok(WalEvent::Data {
                row_lo: cursor.read_i64::<LittleEndian>()?,
                row_hi: cursor.read_i64::<LittleEndian>()?,
                min_timestamp: cursor.read_i64::<LittleEndian>()?,
                max_timestamp: cursor.read_i64::<LittleEndian>()?,
                out_of_order: cursor.read_u8()? != 0,
            }),
            KIND_SQL => {
                let command_type = cursor.read_i32::<LittleEndian>()?;
                let sql_len = cursor.read_u32::<LittleEndian>()? as usize;
                let mut sql = vec![0_u8; sql_len];
                cursor.read_exact(&mut sql)?;
                let ctx_len = cursor.read_u32::<LittleEndian>()? as usize;
                let mut execution_context = vec![0_u8; ctx_len];
                cursor.read_exact(&mut execution_context)?;
                Ok(WalEvent::Sql {
                    command_type,
                    sql: String::from_utf8(sql)
                        .map_err(|e| WalError::corrupted(format!("sql record not utf-8: {e}")))?,
                    execution_context,
                })
            }
            KIND_TRUNCATE => Ok(WalEvent::Truncate),
            other => Err(WalError::corrupted(format!(
                "unknown event record kind: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 64 * 1024;

    #[test]
    fn record_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = WalEventWriter::open(dir.path(), PAGE).expect("open");
        assert_eq!(0, writer.data(0, 2, 100, 200, false).expect("data"));
        assert_eq!(1, writer.sql(3, "update x set a = 1", b"ctx").expect("sql"));
        assert_eq!(2, writer.truncate().expect("truncate"));
        writer.close(true).expect("close");

        let events = WalEventReader::read(&dir.path().join(fs::EVENT_FILE)).expect("read");
        assert_eq!(
            vec![
                WalEvent::Data {
                    row_lo: 0,
                    row_hi: 2,
                    min_timestamp: 100,
                    max_timestamp: 200,
                    out_of_order: false
                },
                WalEvent::Sql {
                    command_type: 3,
                    sql: "update x set a = 1".into(),
                    execution_context: b"ctx".to_vec()
                },
                WalEvent::Truncate,
            ],
            events
        );
    }

    #[test]
    fn unconfirmed_record_can_be_withdrawn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = WalEventWriter::open(dir.path(), PAGE).expect("open");
        writer.data(0, 1, 5, 5, false).expect("data");
        writer.confirm_last();
        writer.data(1, 4, 6, 9, false).expect("data");
        writer.rollback_last().expect("rollback");
        // Withdrawing twice is a no-op.
        writer.rollback_last().expect("rollback again");
        assert_eq!(1, writer.data(1, 3, 6, 8, true).expect("data"));
        writer.close(true).expect("close");

        let events = WalEventReader::read(&dir.path().join(fs::EVENT_FILE)).expect("read");
        assert_eq!(2, events.len());
        assert_eq!(
            WalEvent::Data {
                row_lo: 1,
                row_hi: 3,
                min_timestamp: 6,
                max_timestamp: 8,
                out_of_order: true
            },
            events[1]
        );
    }

    #[test]
    fn reader_stops_at_untruncated_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = WalEventWriter::open(dir.path(), PAGE).expect("open");
        writer.data(0, 1, 1, 1, false).expect("data");
        // Close without truncation leaves mapped zero padding behind.
        writer.close(false).expect("close");
        let events = WalEventReader::read(&dir.path().join(fs::EVENT_FILE)).expect("read");
        assert_eq!(1, events.len());
    }
}
