use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::LedgerEvent;

/// Encode a single record as `[len][bincode][crc32]`. Returns the bytes written.
fn encode_record(writer: &mut impl Write, event: &LedgerEvent) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "ledger record too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(8 + u64::from(len))
}

/// Result of reading a log back from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<LedgerEvent>,
    /// Byte length of the valid prefix. Anything past it is a torn or corrupt tail.
    pub valid_len: u64,
    /// True if bytes past `valid_len` were discarded.
    pub discarded_tail: bool,
}

/// The file under the log's `BufWriter`. Tests can cap how many more bytes
/// it accepts to simulate a disk filling up mid-record.
struct LogFile {
    file: File,
    #[cfg(test)]
    write_budget: Option<u64>,
}

impl LogFile {
    fn new(file: File) -> Self {
        Self {
            file,
            #[cfg(test)]
            write_budget: None,
        }
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        #[cfg(test)]
        if let Some(budget) = self.write_budget.as_mut() {
            if *budget == 0 {
                return Err(io::Error::other("no space left on device"));
            }
            let take = buf.len().min(usize::try_from(*budget).unwrap_or(usize::MAX));
            let written = self.file.write(&buf[..take])?;
            *budget -= written as u64;
            return Ok(written);
        }
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Append-only ledger log.
///
/// Format per record: `[u32: len][bincode: LedgerEvent][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn last record (crash mid-write) fails the length or CRC check and is
///   cut off when the log is reopened, so later appends stay reachable.
/// - A batch that fails to commit is cut off by [`Wal::rollback`] before the
///   next one is written, so no acknowledged record ever sits behind garbage.
pub struct Wal {
    writer: BufWriter<LogFile>,
    path: PathBuf,
    /// File length as of the last successful `flush_sync`.
    committed_len: u64,
    pending_len: u64,
    pending_records: u64,
    appends_since_compact: u64,
}

fn open_append(path: &Path) -> io::Result<BufWriter<LogFile>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(LogFile::new(file)))
}

impl Wal {
    /// Open (or create) the log at `path`, truncating it to `valid_len` first.
    pub fn open(path: &Path, valid_len: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        if file.metadata()?.len() > valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let committed_len = file.metadata()?.len();
        drop(file);
        Ok(Self {
            writer: open_append(path)?,
            path: path.to_path_buf(),
            committed_len,
            pending_len: 0,
            pending_records: 0,
            appends_since_compact: 0,
        })
    }

    /// Append one record and fsync. Production writes go through
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &LedgerEvent) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer a record without flushing. `flush_sync` commits the batch.
    pub fn append_buffered(&mut self, event: &LedgerEvent) -> io::Result<()> {
        self.pending_len += encode_record(&mut self.writer, event)?;
        self.pending_records += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().file.sync_all()?;
        self.committed_len += self.pending_len;
        self.pending_len = 0;
        self.pending_records = 0;
        Ok(())
    }

    /// Discard everything written since the last successful `flush_sync`:
    /// drop the buffer unflushed and cut the file back to the committed
    /// length. If this fails the log must not be appended to again.
    pub fn rollback(&mut self) -> io::Result<()> {
        let fresh = open_append(&self.path)?;
        let (_, _unflushed) = std::mem::replace(&mut self.writer, fresh).into_parts();
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(self.committed_len)?;
        file.sync_all()?;
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_records);
        self.pending_len = 0;
        self.pending_records = 0;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_write_budget(&mut self, budget: Option<u64>) {
        self.writer.get_mut().write_budget = budget;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write a snapshot to `<path>.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[LedgerEvent]) -> io::Result<()> {
        let tmp_path = path.with_extension("log.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the snapshot over the log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        // Drain buffered bytes into the old file before it is replaced.
        self.writer.flush()?;
        let tmp_path = self.path.with_extension("log.tmp");
        fs::rename(&tmp_path, &self.path)?;
        self.writer = open_append(&self.path)?;
        self.committed_len = fs::metadata(&self.path)?.len();
        self.pending_len = 0;
        self.pending_records = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[LedgerEvent]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every valid record. Stops at the first torn or corrupt record.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as u64;
            if replay.valid_len + 8 + len > file_len {
                break; // torn
            }

            let mut payload = vec![0u8; len as usize];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<LedgerEvent>(&payload) {
                Ok(event) => replay.events.push(event),
                Err(_) => break,
            }
            replay.valid_len += 8 + len;
        }

        replay.discarded_tail = replay.valid_len < file_len;
        Ok(replay)
    }
}
