use parking_lot::{Condvar, Mutex};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, mpsc};

use thiserror::Error;

/// Byte offset of a record in the log.
pub type Lsn = u64;
pub type PageId = u64;

const INVALID_LSN: Lsn = u64::MAX;
const DEFAULT_LOG_BUFFER_SIZE: usize = 1024 * 1024;
const LOG_MAGIC: u64 = 0x5A45_524F_4C4F_4731;
/// The log starts with a magic header so that no record has LSN 0, which
/// pages use to mean "never logged".
pub const LOG_HEADER_SIZE: u64 = 8;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wal corruption: {0}")]
    Corrupt(String),
    #[error("wal channel closed")]
    ChannelClosed,
    #[error("wal is closed")]
    Closed,
}

pub type WalResult<T> = Result<T, WalError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecordType {
    PageUpdate,
    /// A page image reached the volume; everything up to `clean_lsn` is on it.
    PageWrite,
    /// A parent page recorded a new end-mark LSN for one of its children.
    UpdateEmlsn,
    /// A frame was reclaimed by the evictor.
    EvictPage,
}

impl LogRecordType {
    fn to_byte(self) -> u8 {
        match self {
            LogRecordType::PageUpdate => 1,
            LogRecordType::PageWrite => 2,
            LogRecordType::UpdateEmlsn => 3,
            LogRecordType::EvictPage => 4,
        }
    }

    fn from_byte(value: u8) -> WalResult<Self> {
        match value {
            1 => Ok(LogRecordType::PageUpdate),
            2 => Ok(LogRecordType::PageWrite),
            3 => Ok(LogRecordType::UpdateEmlsn),
            4 => Ok(LogRecordType::EvictPage),
            _ => Err(WalError::Corrupt(format!(
                "invalid log record type {}",
                value
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    PageUpdate {
        page_id: PageId,
        offset: u32,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    PageWrite {
        page_id: PageId,
        clean_lsn: Lsn,
    },
    UpdateEmlsn {
        parent: PageId,
        slot: u16,
        child: PageId,
        emlsn: Lsn,
    },
    EvictPage {
        page_id: PageId,
        was_dirty: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    /// Previous record touching the same page, if the writer tracked it.
    pub page_prev_lsn: Option<Lsn>,
    pub payload: LogPayload,
}

impl LogRecord {
    pub fn page_update(page_id: PageId, offset: u32, before: Vec<u8>, after: Vec<u8>) -> Self {
        Self::new(LogPayload::PageUpdate {
            page_id,
            offset,
            before,
            after,
        })
    }

    pub fn page_write(page_id: PageId, clean_lsn: Lsn) -> Self {
        Self::new(LogPayload::PageWrite { page_id, clean_lsn })
    }

    pub fn update_emlsn(parent: PageId, slot: u16, child: PageId, emlsn: Lsn) -> Self {
        Self::new(LogPayload::UpdateEmlsn {
            parent,
            slot,
            child,
            emlsn,
        })
    }

    pub fn evict_page(page_id: PageId, was_dirty: bool) -> Self {
        Self::new(LogPayload::EvictPage { page_id, was_dirty })
    }

    fn new(payload: LogPayload) -> Self {
        Self {
            lsn: 0,
            page_prev_lsn: None,
            payload,
        }
    }

    pub fn with_page_prev_lsn(mut self, lsn: Option<Lsn>) -> Self {
        self.page_prev_lsn = lsn;
        self
    }

    pub fn record_type(&self) -> LogRecordType {
        match self.payload {
            LogPayload::PageUpdate { .. } => LogRecordType::PageUpdate,
            LogPayload::PageWrite { .. } => LogRecordType::PageWrite,
            LogPayload::UpdateEmlsn { .. } => LogRecordType::UpdateEmlsn,
            LogPayload::EvictPage { .. } => LogRecordType::EvictPage,
        }
    }

    /// The page this record is about.
    pub fn page_id(&self) -> PageId {
        match self.payload {
            LogPayload::PageUpdate { page_id, .. }
            | LogPayload::PageWrite { page_id, .. }
            | LogPayload::EvictPage { page_id, .. } => page_id,
            LogPayload::UpdateEmlsn { parent, .. } => parent,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&0u32.to_le_bytes());
        buffer.push(self.record_type().to_byte());
        buffer.extend_from_slice(&self.lsn.to_le_bytes());
        let prev = self.page_prev_lsn.unwrap_or(INVALID_LSN);
        buffer.extend_from_slice(&prev.to_le_bytes());
        match &self.payload {
            LogPayload::PageUpdate {
                page_id,
                offset,
                before,
                after,
            } => {
                buffer.extend_from_slice(&page_id.to_le_bytes());
                buffer.extend_from_slice(&offset.to_le_bytes());
                buffer.extend_from_slice(&(before.len() as u32).to_le_bytes());
                buffer.extend_from_slice(&(after.len() as u32).to_le_bytes());
                buffer.extend_from_slice(before);
                buffer.extend_from_slice(after);
            }
            LogPayload::PageWrite { page_id, clean_lsn } => {
                buffer.extend_from_slice(&page_id.to_le_bytes());
                buffer.extend_from_slice(&clean_lsn.to_le_bytes());
            }
            LogPayload::UpdateEmlsn {
                parent,
                slot,
                child,
                emlsn,
            } => {
                buffer.extend_from_slice(&parent.to_le_bytes());
                buffer.extend_from_slice(&slot.to_le_bytes());
                buffer.extend_from_slice(&child.to_le_bytes());
                buffer.extend_from_slice(&emlsn.to_le_bytes());
            }
            LogPayload::EvictPage { page_id, was_dirty } => {
                buffer.extend_from_slice(&page_id.to_le_bytes());
                buffer.push(u8::from(*was_dirty));
            }
        }
        let len = buffer.len() as u32;
        buffer[0..4].copy_from_slice(&len.to_le_bytes());
        buffer
    }

    pub fn from_bytes(bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < 1 + 8 + 8 {
            return Err(WalError::Corrupt("log record too small".to_string()));
        }
        let record_type = LogRecordType::from_byte(bytes[0])?;
        let lsn = read_u64(&bytes[1..9]);
        let prev_raw = read_u64(&bytes[9..17]);
        let page_prev_lsn = if prev_raw == INVALID_LSN {
            None
        } else {
            Some(prev_raw)
        };
        let body = &bytes[17..];
        let truncated = |what: &str| WalError::Corrupt(format!("{} record truncated", what));
        let payload = match record_type {
            LogRecordType::PageUpdate => {
                if body.len() < 8 + 4 + 4 + 4 {
                    return Err(truncated("page update"));
                }
                let page_id = read_u64(&body[0..8]);
                let offset = read_u32(&body[8..12]);
                let before_len = read_u32(&body[12..16]) as usize;
                let after_len = read_u32(&body[16..20]) as usize;
                if body.len() < 20 + before_len + after_len {
                    return Err(truncated("page update"));
                }
                let before = body[20..20 + before_len].to_vec();
                let after = body[20 + before_len..20 + before_len + after_len].to_vec();
                LogPayload::PageUpdate {
                    page_id,
                    offset,
                    before,
                    after,
                }
            }
            LogRecordType::PageWrite => {
                if body.len() < 16 {
                    return Err(truncated("page write"));
                }
                LogPayload::PageWrite {
                    page_id: read_u64(&body[0..8]),
                    clean_lsn: read_u64(&body[8..16]),
                }
            }
            LogRecordType::UpdateEmlsn => {
                if body.len() < 8 + 2 + 8 + 8 {
                    return Err(truncated("emlsn"));
                }
                let mut slot = [0u8; 2];
                slot.copy_from_slice(&body[8..10]);
                LogPayload::UpdateEmlsn {
                    parent: read_u64(&body[0..8]),
                    slot: u16::from_le_bytes(slot),
                    child: read_u64(&body[10..18]),
                    emlsn: read_u64(&body[18..26]),
                }
            }
            LogRecordType::EvictPage => {
                if body.len() < 9 {
                    return Err(truncated("evict"));
                }
                LogPayload::EvictPage {
                    page_id: read_u64(&body[0..8]),
                    was_dirty: body[8] != 0,
                }
            }
        };
        Ok(LogRecord {
            lsn,
            page_prev_lsn,
            payload,
        })
    }
}

/// Append-only log with a background flusher. `flush(lsn)` returns once the
/// record starting at `lsn` is durable.
#[derive(Clone)]
pub struct LogManager {
    state: Arc<Mutex<LogState>>,
    condvar: Arc<Condvar>,
    sender: mpsc::Sender<FlushRequest>,
}

struct FlushRequest {
    start_lsn: Lsn,
    end_lsn: Lsn,
    bytes: Vec<u8>,
}

struct LogState {
    active: Vec<u8>,
    flushing: Vec<u8>,
    active_start_lsn: Lsn,
    next_lsn: Lsn,
    flushed_lsn: Lsn,
    flushing_in_progress: bool,
    buffer_size: usize,
    last_error: Option<WalError>,
    closed: bool,
}

impl LogManager {
    pub fn open(path: impl AsRef<Path>) -> WalResult<Self> {
        Self::open_with_buffer(path, DEFAULT_LOG_BUFFER_SIZE)
    }

    pub fn open_with_buffer(path: impl AsRef<Path>, buffer_size: usize) -> WalResult<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path.as_ref())?;
        let mut len = file.metadata()?.len();
        if len < LOG_HEADER_SIZE {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&LOG_MAGIC.to_le_bytes())?;
            file.sync_data()?;
            len = LOG_HEADER_SIZE;
        }
        file.seek(SeekFrom::End(0))?;
        let state = Arc::new(Mutex::new(LogState {
            active: Vec::with_capacity(buffer_size),
            flushing: Vec::with_capacity(buffer_size),
            active_start_lsn: len,
            next_lsn: len,
            flushed_lsn: len,
            flushing_in_progress: false,
            buffer_size,
            last_error: None,
            closed: false,
        }));
        let condvar = Arc::new(Condvar::new());
        let (sender, receiver) = mpsc::channel();
        let state_clone = Arc::clone(&state);
        let condvar_clone = Arc::clone(&condvar);
        std::thread::spawn(move || {
            for request in receiver {
                let result = write_flush_request(&mut file, &request);
                let mut state = state_clone.lock();
                if let Err(error) = result {
                    state.last_error = Some(error);
                } else {
                    state.flushed_lsn = state.flushed_lsn.max(request.end_lsn);
                }
                state.flushing.clear();
                state.flushing_in_progress = false;
                condvar_clone.notify_all();
            }
        });
        Ok(Self {
            state,
            condvar,
            sender,
        })
    }

    /// Appends a record and returns the LSN assigned to it.
    pub fn append(&self, mut record: LogRecord) -> WalResult<Lsn> {
        let mut state = self.state.lock();
        state.ensure_ok()?;
        if state.closed {
            return Err(WalError::Closed);
        }
        record.lsn = state.next_lsn;
        let bytes = record.to_bytes();
        if state.active.len() + bytes.len() > state.buffer_size {
            self.flush_active_locked(&mut state)?;
        }
        let lsn = record.lsn;
        state.active.extend_from_slice(&bytes);
        state.next_lsn += bytes.len() as u64;
        Ok(lsn)
    }

    /// Makes the record at `lsn` (and everything before it) durable.
    pub fn flush(&self, lsn: Lsn) -> WalResult<()> {
        let mut state = self.state.lock();
        state.ensure_ok()?;
        if lsn < state.flushed_lsn {
            return Ok(());
        }
        if lsn >= state.next_lsn {
            // nothing was ever logged at or beyond this point
            if state.active.is_empty() && !state.flushing_in_progress {
                return Ok(());
            }
        }
        while state.flushed_lsn <= lsn && state.flushed_lsn < state.next_lsn {
            if lsn >= state.active_start_lsn && !state.flushing_in_progress {
                self.flush_active_locked(&mut state)?;
            }
            self.condvar.wait(&mut state);
            state.ensure_ok()?;
        }
        Ok(())
    }

    /// Makes everything appended so far durable.
    pub fn flush_all(&self) -> WalResult<()> {
        let last = {
            let state = self.state.lock();
            if state.next_lsn == state.flushed_lsn {
                return Ok(());
            }
            state.next_lsn - 1
        };
        self.flush(last)
    }

    /// Flushes what was appended and refuses any further appends, on every
    /// clone of this manager.
    pub fn close(&self) -> WalResult<()> {
        self.flush_all()?;
        self.state.lock().closed = true;
        Ok(())
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.state.lock().flushed_lsn
    }

    /// LSN the next appended record will receive.
    pub fn curr_lsn(&self) -> Lsn {
        self.state.lock().next_lsn
    }

    fn flush_active_locked(
        &self,
        state: &mut parking_lot::MutexGuard<'_, LogState>,
    ) -> WalResult<()> {
        if state.active.is_empty() {
            return Ok(());
        }
        while state.flushing_in_progress {
            self.condvar.wait(state);
            state.ensure_ok()?;
        }
        let start_lsn = state.active_start_lsn;
        let mut flush_buffer = std::mem::take(&mut state.active);
        std::mem::swap(&mut flush_buffer, &mut state.flushing);
        flush_buffer.clear();
        state.active = flush_buffer;
        let end_lsn = start_lsn + state.flushing.len() as u64;

        state.active_start_lsn = end_lsn;
        state.flushing_in_progress = true;
        let bytes = state.flushing.clone();
        self.sender
            .send(FlushRequest {
                start_lsn,
                end_lsn,
                bytes,
            })
            .map_err(|_| WalError::ChannelClosed)?;
        Ok(())
    }
}

impl LogState {
    fn ensure_ok(&self) -> WalResult<()> {
        if let Some(error) = &self.last_error {
            return Err(WalError::Corrupt(error.to_string()));
        }
        Ok(())
    }
}

pub struct LogReader {
    file: File,
    offset: u64,
}

impl LogReader {
    pub fn open(path: impl AsRef<Path>) -> WalResult<Self> {
        let mut file = OpenOptions::new().read(true).open(path)?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if u64::from_le_bytes(magic) != LOG_MAGIC {
            return Err(WalError::Corrupt("bad log header".to_string()));
        }
        Ok(Self {
            file,
            offset: LOG_HEADER_SIZE,
        })
    }

    pub fn seek(&mut self, lsn: Lsn) -> WalResult<()> {
        self.offset = lsn.max(LOG_HEADER_SIZE);
        self.file.seek(SeekFrom::Start(self.offset))?;
        Ok(())
    }

    pub fn next_record(&mut self) -> WalResult<Option<LogRecord>> {
        let mut len_bytes = [0u8; 4];
        let bytes_read = self.file.read(&mut len_bytes)?;
        if bytes_read == 0 {
            return Ok(None);
        }
        if bytes_read < 4 {
            return Err(WalError::Corrupt("log record length truncated".to_string()));
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len < 4 {
            return Err(WalError::Corrupt("invalid log record length".to_string()));
        }
        let mut payload = vec![0u8; len - 4];
        self.file.read_exact(&mut payload)?;
        self.offset += len as u64;
        let record = LogRecord::from_bytes(&payload)?;
        Ok(Some(record))
    }

    /// Reads every remaining record.
    pub fn read_all(&mut self) -> WalResult<Vec<LogRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }
}

fn write_flush_request(file: &mut File, request: &FlushRequest) -> WalResult<()> {
    file.seek(SeekFrom::Start(request.start_lsn))?;
    file.write_all(&request.bytes)?;
    file.sync_data()?;
    Ok(())
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut array = [0u8; 8];
    array.copy_from_slice(bytes);
    u64::from_le_bytes(array)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut array = [0u8; 4];
    array.copy_from_slice(bytes);
    u32::from_le_bytes(array)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let manager = LogManager::open_with_buffer(&path, 128).unwrap();
        let update = manager
            .append(LogRecord::page_update(42, 12, vec![1, 2], vec![3, 4]))
            .unwrap();
        assert_eq!(update, LOG_HEADER_SIZE, "first record follows the header");
        let write = manager
            .append(LogRecord::page_write(42, update).with_page_prev_lsn(Some(update)))
            .unwrap();
        manager.append(LogRecord::update_emlsn(7, 3, 42, update)).unwrap();
        let evict = manager.append(LogRecord::evict_page(42, true)).unwrap();
        manager.flush(evict).unwrap();
        assert!(manager.flushed_lsn() > evict);

        let mut reader = LogReader::open(&path).unwrap();
        let records = reader.read_all().unwrap();
        let kinds: Vec<_> = records.iter().map(LogRecord::record_type).collect();
        assert_eq!(
            kinds,
            vec![
                LogRecordType::PageUpdate,
                LogRecordType::PageWrite,
                LogRecordType::UpdateEmlsn,
                LogRecordType::EvictPage
            ]
        );
        assert_eq!(records[1].lsn, write);
        assert_eq!(records[1].page_prev_lsn, Some(update));
        assert_eq!(
            records[2].payload,
            LogPayload::UpdateEmlsn {
                parent: 7,
                slot: 3,
                child: 42,
                emlsn: update
            }
        );
        assert_eq!(records[3].page_id(), 42);
    }

    #[test]
    fn flush_waits_for_the_record_itself() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LogManager::open(dir.path().join("wal.log")).unwrap();
        let before = manager.flushed_lsn();
        let lsn = manager.append(LogRecord::page_write(1, 0)).unwrap();
        assert_eq!(lsn, before, "record starts where the durable log ends");
        manager.flush(lsn).unwrap();
        assert!(manager.flushed_lsn() > lsn);
        assert_eq!(manager.flushed_lsn(), manager.curr_lsn());
    }

    #[test]
    fn flush_of_unlogged_lsn_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LogManager::open(dir.path().join("wal.log")).unwrap();
        manager.flush(0).unwrap();
        manager.flush(10_000).unwrap();
        manager.flush_all().unwrap();
    }

    #[test]
    fn closed_log_refuses_appends() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LogManager::open(dir.path().join("wal.log")).unwrap();
        let lsn = manager.append(LogRecord::evict_page(1, false)).unwrap();
        let other = manager.clone();
        manager.close().unwrap();
        assert!(manager.flushed_lsn() > lsn);
        assert!(matches!(
            other.append(LogRecord::evict_page(2, false)),
            Err(WalError::Closed)
        ));
        manager.flush(lsn).unwrap();
    }

    #[test]
    fn reopen_continues_after_existing_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let end = {
            let manager = LogManager::open(&path).unwrap();
            manager.append(LogRecord::evict_page(5, false)).unwrap();
            manager.flush_all().unwrap();
            manager.curr_lsn()
        };
        let manager = LogManager::open(&path).unwrap();
        assert_eq!(manager.curr_lsn(), end);
        assert_eq!(manager.append(LogRecord::evict_page(6, false)).unwrap(), end);
    }
}
