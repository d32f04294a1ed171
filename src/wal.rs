use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Written once at the top of every log file.
const MAGIC_LEN: usize = 8;
const MAGIC: &[u8; MAGIC_LEN] = b"RSVDLOG1";

/// No single event comes close; a larger length prefix means a damaged frame.
const MAX_FRAME_LEN: u32 = 1 << 20;

/// Append one `[u32 len][bincode event][u32 crc32]` frame.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "event too large for one frame"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Reads frames until the end of the file or the first damaged frame.
struct FrameReader<R> {
    inner: R,
    /// End offset of the last intact frame.
    intact_len: u64,
}

impl<R: Read> FrameReader<R> {
    /// `Ok(None)` at a clean end, a truncated tail, an oversized length or a
    /// checksum mismatch.
    fn next_event(&mut self) -> io::Result<Option<Event>> {
        let mut len_buf = [0u8; 4];
        if !read_or_eof(&mut self.inner, &mut len_buf)? {
            return Ok(None);
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Ok(None);
        }
        let mut payload = vec![0u8; len as usize];
        if !read_or_eof(&mut self.inner, &mut payload)? {
            return Ok(None);
        }
        let mut crc_buf = [0u8; 4];
        if !read_or_eof(&mut self.inner, &mut crc_buf)? {
            return Ok(None);
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            return Ok(None);
        }
        let Ok(event) = bincode::deserialize(&payload) else {
            return Ok(None);
        };
        self.intact_len += 8 + u64::from(len);
        Ok(Some(event))
    }
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only booking log of one organization.
///
/// Layout: `MAGIC` followed by frames. A torn last frame (crash mid-write)
/// is dropped at replay; everything before it survives.
///
/// A batch is either fully on disk or not at all: a failed write is cut off
/// again with `set_len`. If even that fails the log refuses further appends
/// until a snapshot replaces the file.
pub struct Wal {
    file: File,
    path: PathBuf,
    appends_since_compact: u64,
    poisoned: bool,
}

impl Wal {
    /// Open the log at `path`, creating it (with header) if missing.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() < MAGIC_LEN as u64 {
            // Fresh file, or a crash while the header was being written.
            file.set_len(0)?;
            (&file).write_all(MAGIC)?;
            file.sync_all()?;
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            appends_since_compact: 0,
            poisoned: false,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_batch(std::slice::from_ref(event))
    }

    /// Write and fsync `events` as one unit.
    pub fn append_batch(&mut self, events: &[Event]) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other(format!(
                "{} is disabled after a failed rollback",
                self.path.display()
            )));
        }
        let mut buf = Vec::new();
        for event in events {
            write_frame(&mut buf, event)?;
        }

        let committed_len = self.file.metadata()?.len();
        let written = (&self.file)
            .write_all(&buf)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            if let Err(undo) = self.truncate_to(committed_len) {
                tracing::error!("cannot roll back {}: {undo}", self.path.display());
                self.poisoned = true;
            }
            return Err(e);
        }
        self.appends_since_compact += events.len() as u64;
        Ok(())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)?;
        self.file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn snapshot_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a full snapshot next to the log and fsync it.
    pub fn write_snapshot(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::snapshot_path(path))?);
        writer.write_all(MAGIC)?;
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and continue appending to it.
    pub fn install_snapshot(&mut self) -> io::Result<()> {
        fs::rename(Self::snapshot_path(&self.path), &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.appends_since_compact = 0;
        self.poisoned = false;
        Ok(())
    }

    /// Read every intact event. A missing file is an empty log; a file with a
    /// foreign header is an error rather than silently ignored.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::read_intact(path).map(|(events, _)| events)
    }

    /// Replay `path`, cut off any damaged tail so new frames follow the last
    /// intact one, and open it for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, intact_len) = Self::read_intact(path)?;
        let wal = Self::open(path)?;
        if let Some(len) = intact_len {
            if wal.file.metadata()?.len() > len {
                tracing::warn!("dropping damaged tail of {} after byte {len}", path.display());
                wal.file.set_len(len)?;
                wal.file.sync_all()?;
            }
        }
        Ok((wal, events))
    }

    /// Events plus the length of the intact prefix, which is `None` when
    /// there is no complete header yet.
    fn read_intact(path: &Path) -> io::Result<(Vec<Event>, Option<u64>)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), None)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut header = [0u8; MAGIC_LEN];
        if !read_or_eof(&mut reader, &mut header)? {
            return Ok((Vec::new(), None));
        }
        if &header != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a reservd log", path.display()),
            ));
        }

        let mut frames = FrameReader {
            inner: reader,
            intact_len: MAGIC_LEN as u64,
        };
        let mut events = Vec::new();
        while let Some(event) = frames.next_event()? {
            events.push(event);
        }
        Ok((events, Some(frames.intact_len)))
    }

    /// Log over a read-only handle: every write fails, and so does the
    /// rollback.
    #[cfg(test)]
    pub(crate) fn open_read_only(path: &Path) -> io::Result<Self> {
        Wal::open(path)?;
        Ok(Self {
            file: File::open(path)?,
            path: path.to_path_buf(),
            appends_since_compact: 0,
            poisoned: false,
        })
    }
}
