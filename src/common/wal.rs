//! Write-Ahead Log (WAL) of transaction records
//!
//! Ensures a role (coordinator or participant) can reconstruct the status of every
//! in-flight request after a crash.
//! Record format: [STATUS:1][ID:4 LE][NEXT_ID:4 LE], fixed 9 bytes.
//!
//! The file is append-only. On open it is replayed front to back into an
//! `id -> Record` map keeping the latest record per id; records that reached a
//! DONE status are evicted from the map (their bytes stay on disk).

use crate::common::{Error, Result, WalSyncPolicy};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Size of one encoded record.
pub const RECORD_SIZE: usize = 9;

/// Status of a request in the log.
///
/// `Unresolved` is only written by the coordinator and `Prepared` only by
/// participants; the rest are shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordStatus {
    /// coordinator has not decided yet
    Unresolved = 0,
    Commit = 1,
    Abort = 2,
    CommitDone = 3,
    AbortDone = 4,
    /// participant has durably staged the command
    Prepared = 5,
}

impl RecordStatus {
    pub fn is_done(self) -> bool {
        matches!(self, RecordStatus::CommitDone | RecordStatus::AbortDone)
    }
}

impl TryFrom<u8> for RecordStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => RecordStatus::Unresolved,
            1 => RecordStatus::Commit,
            2 => RecordStatus::Abort,
            3 => RecordStatus::CommitDone,
            4 => RecordStatus::AbortDone,
            5 => RecordStatus::Prepared,
            other => return Err(Error::Wal(format!("unknown record status {}", other))),
        })
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecordStatus::Unresolved => "UNRESOLVED",
            RecordStatus::Commit => "COMMIT",
            RecordStatus::Abort => "ABORT",
            RecordStatus::CommitDone => "COMMIT_DONE",
            RecordStatus::AbortDone => "ABORT_DONE",
            RecordStatus::Prepared => "PREPARED",
        };
        f.write_str(s)
    }
}

/// One log entry.
///
/// `next_id` is the writer's sequence high-water mark at the time of writing,
/// which lets a restarted role recover its counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub status: RecordStatus,
    pub id: u32,
    pub next_id: u32,
}

impl Record {
    pub fn new(status: RecordStatus, id: u32, next_id: u32) -> Self {
        Self {
            status,
            id,
            next_id,
        }
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[0] = self.status as u8;
        out[1..5].copy_from_slice(&self.id.to_le_bytes());
        out[5..9].copy_from_slice(&self.next_id.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RECORD_SIZE {
            return Err(Error::Wal(format!(
                "short record: {} of {} bytes",
                bytes.len(),
                RECORD_SIZE
            )));
        }
        let status = RecordStatus::try_from(bytes[0])?;
        let id = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let next_id = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        Ok(Self::new(status, id, next_id))
    }
}

/// Append-only file handle shared by the record log and the command log.
///
/// The first failed append poisons it: the buffered bytes are thrown away without
/// being flushed and every later append is refused. A torn tail left behind is cut
/// off by replay on the next open.
pub(crate) struct LogWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    sync_policy: WalSyncPolicy,
}

impl LogWriter {
    pub(crate) fn new(path: PathBuf, file: File, sync_policy: WalSyncPolicy) -> Self {
        Self {
            path,
            writer: Some(BufWriter::new(file)),
            sync_policy,
        }
    }

    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            Error::Wal(format!("{:?} failed earlier, refusing to append", self.path))
        })?;

        let result = writer
            .write_all(bytes)
            .and_then(|_| sync(writer, self.sync_policy));
        if let Err(e) = result {
            if let Some(writer) = self.writer.take() {
                let (_file, _unflushed) = writer.into_parts();
            }
            tracing::error!("Log {:?} failed, no further appends: {}", self.path, e);
            return Err(Error::Wal(format!("append to {:?}: {}", self.path, e)));
        }
        Ok(())
    }

    /// Swap in a freshly opened file, e.g. after a compaction rewrote the log.
    pub(crate) fn reopen(&mut self, file: File) {
        self.writer = Some(BufWriter::new(file));
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.writer.is_none()
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Point further appends at another file. Tests use `/dev/full` to fail writes.
    #[cfg(test)]
    pub(crate) fn redirect(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }
}

fn sync(writer: &mut BufWriter<File>, policy: WalSyncPolicy) -> std::io::Result<()> {
    match policy {
        WalSyncPolicy::Always => {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        WalSyncPolicy::Interval => {
            writer.flush()?;
        }
        WalSyncPolicy::Never => {}
    }
    Ok(())
}

/// Write-Ahead Log
/// Appends records and keeps the unresolved ones indexed in memory.
pub struct Wal {
    writer: LogWriter,
    records: BTreeMap<u32, Record>,
    next_id: Option<u32>,
}

impl Wal {
    /// Open or create the log and replay it.
    /// A torn record at the tail (crash mid-append) is cut off.
    pub fn open(path: impl AsRef<Path>, sync_policy: WalSyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut records = BTreeMap::new();
        let mut next_id = None;
        let mut valid_len = 0usize;

        for chunk in data.chunks(RECORD_SIZE) {
            let record = match Record::decode(chunk) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("WAL replay stopped at {:?} offset {}: {}", path, valid_len, e);
                    break;
                }
            };
            Self::apply(&mut records, &record);
            next_id = Some(record.next_id);
            valid_len += RECORD_SIZE;
        }

        if valid_len < data.len() {
            tracing::warn!(
                "Truncating {} trailing bytes from {:?}",
                data.len() - valid_len,
                path
            );
            file.set_len(valid_len as u64)?;
        }

        tracing::debug!(
            "WAL {:?} replayed: {} live records, next_id {:?}",
            path,
            records.len(),
            next_id
        );

        Ok(Self {
            writer: LogWriter::new(path, file, sync_policy),
            records,
            next_id,
        })
    }

    fn apply(records: &mut BTreeMap<u32, Record>, record: &Record) {
        if record.status.is_done() {
            records.remove(&record.id);
        } else {
            records.insert(record.id, *record);
        }
    }

    /// Append a record. Returns only after the bytes are pushed out per the sync policy.
    /// Once an append fails the log refuses all further records.
    pub fn log(&mut self, record: Record) -> Result<()> {
        self.writer.append(&record.encode())?;

        tracing::trace!(
            "logged {} id={} next_id={}",
            record.status,
            record.id,
            record.next_id
        );
        Self::apply(&mut self.records, &record);
        self.next_id = Some(record.next_id);
        Ok(())
    }

    /// True once an append has failed.
    pub fn is_failed(&self) -> bool {
        self.writer.is_failed()
    }

    /// Unresolved records, ordered by id.
    pub fn records(&self) -> &BTreeMap<u32, Record> {
        &self.records
    }

    pub fn get(&self, id: u32) -> Option<&Record> {
        self.records.get(&id)
    }

    /// High-water mark carried by the most recent record, `None` for an empty log.
    pub fn next_id(&self) -> Option<u32> {
        self.next_id
    }

    pub fn path(&self) -> &Path {
        self.writer.path()
    }

    #[cfg(test)]
    pub(crate) fn fail_writes(&mut self) {
        if let Err(e) = self.writer.redirect("/dev/full") {
            panic!("cannot open /dev/full: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_layout() {
        let rec = Record::new(RecordStatus::Prepared, 0x0102_0304, 7);
        let bytes = rec.encode();
        assert_eq!(bytes, [5, 4, 3, 2, 1, 7, 0, 0, 0]);
        assert_eq!(Record::decode(&bytes).unwrap(), rec);
        assert!(Record::decode(&bytes[..8]).is_err());
        assert!(Record::decode(&[9, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_wal_replay_keeps_latest_unresolved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coord.wal");

        {
            let mut wal = Wal::open(&path, WalSyncPolicy::Always).unwrap();
            assert_eq!(wal.next_id(), None);

            wal.log(Record::new(RecordStatus::Unresolved, 10, 11)).unwrap();
            wal.log(Record::new(RecordStatus::Commit, 10, 11)).unwrap();
            wal.log(Record::new(RecordStatus::CommitDone, 10, 11)).unwrap();
            wal.log(Record::new(RecordStatus::Unresolved, 11, 12)).unwrap();
            wal.log(Record::new(RecordStatus::Abort, 11, 12)).unwrap();
            wal.log(Record::new(RecordStatus::Unresolved, 12, 13)).unwrap();

            assert_eq!(wal.records().len(), 2);
            assert!(wal.get(10).is_none());
        }

        let wal = Wal::open(&path, WalSyncPolicy::Always).unwrap();
        assert_eq!(wal.next_id(), Some(13));
        let live: Vec<_> = wal
            .records()
            .values()
            .map(|r| (r.id, r.status))
            .collect();
        assert_eq!(
            live,
            vec![(11, RecordStatus::Abort), (12, RecordStatus::Unresolved)]
        );
    }

    #[test]
    fn test_wal_replay_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.wal");
        {
            let mut wal = Wal::open(&path, WalSyncPolicy::Interval).unwrap();
            wal.log(Record::new(RecordStatus::Prepared, 0, 0)).unwrap();
            wal.log(Record::new(RecordStatus::Prepared, 1, 0)).unwrap();
            wal.log(Record::new(RecordStatus::CommitDone, 0, 1)).unwrap();
        }

        let first: Vec<Record> = Wal::open(&path, WalSyncPolicy::Always)
            .unwrap()
            .records()
            .values()
            .copied()
            .collect();
        let second: Vec<Record> = Wal::open(&path, WalSyncPolicy::Always)
            .unwrap()
            .records()
            .values()
            .copied()
            .collect();
        assert_eq!(first, second);
        assert_eq!(first, vec![Record::new(RecordStatus::Prepared, 1, 0)]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.wal");
        {
            let mut wal = Wal::open(&path, WalSyncPolicy::Always).unwrap();
            wal.log(Record::new(RecordStatus::Unresolved, 4, 5)).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[1, 4, 0]).unwrap();
        }

        {
            let mut wal = Wal::open(&path, WalSyncPolicy::Always).unwrap();
            assert_eq!(std::fs::metadata(&path).unwrap().len(), RECORD_SIZE as u64);
            wal.log(Record::new(RecordStatus::Abort, 4, 5)).unwrap();
        }

        let wal = Wal::open(&path, WalSyncPolicy::Always).unwrap();
        assert_eq!(wal.get(4).unwrap().status, RecordStatus::Abort);
    }

    #[test]
    fn test_failed_append_poisons_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("full.wal");
        let mut wal = Wal::open(&path, WalSyncPolicy::Always).unwrap();
        wal.log(Record::new(RecordStatus::Unresolved, 1, 2)).unwrap();

        wal.fail_writes();
        assert!(matches!(
            wal.log(Record::new(RecordStatus::Commit, 1, 2)),
            Err(Error::Wal(_))
        ));
        assert!(wal.is_failed());
        assert_eq!(wal.get(1).unwrap().status, RecordStatus::Unresolved);
        assert_eq!(wal.next_id(), Some(2));

        // refused without touching any file
        assert!(matches!(
            wal.log(Record::new(RecordStatus::Abort, 1, 2)),
            Err(Error::Wal(_))
        ));
        drop(wal);

        let wal = Wal::open(&path, WalSyncPolicy::Always).unwrap();
        assert!(!wal.is_failed());
        assert_eq!(wal.records().len(), 1);
        assert_eq!(wal.get(1).unwrap().status, RecordStatus::Unresolved);
    }
}
