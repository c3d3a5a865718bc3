use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// One committed operation: every event it produced, applied together on replay.
pub type Frame = Vec<Event>;

fn encode_frame(writer: &mut impl Write, frame: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL frame too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Reads exactly `buf.len()` bytes. `Ok(false)` means the log ended mid-read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only write-ahead log of operation frames.
///
/// On-disk entry: `[u32 le: len][bincode: Vec<Event>][u32 le: crc32]`.
/// A torn tail from a crash fails the length or CRC check and is cut off on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, frame: &[Event]) -> io::Result<()> {
        self.append_buffered(frame)?;
        self.flush_sync()
    }

    /// Buffer a frame. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, frame: &[Event]) -> io::Result<()> {
        encode_frame(&mut self.writer, frame)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the snapshot frames to `<path>.wal.tmp` and fsync. Runs without the WAL lock.
    pub fn write_compact_file(path: &Path, frames: &[Frame]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for frame in frames {
            encode_frame(&mut writer, frame)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the snapshot over the log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, frames: &[Frame]) -> io::Result<()> {
        Self::write_compact_file(&self.path, frames)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact frame. Stops at the first truncated or corrupt entry
    /// and cuts the file back to the end of the last intact frame, so frames
    /// appended after recovery are not hidden behind the damaged tail.
    pub fn replay(path: &Path) -> io::Result<Vec<Frame>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut frames = Vec::new();
        let mut intact: u64 = 0;

        loop {
            let mut len_buf = [0u8; 4];
            if !read_full(&mut reader, &mut len_buf)? {
                break;
            }
            let len = u64::from(u32::from_le_bytes(len_buf));
            if intact + 8 + len > file_len {
                break;
            }

            let mut payload = vec![0u8; len as usize];
            if !read_full(&mut reader, &mut payload)? {
                break;
            }

            let mut crc_buf = [0u8; 4];
            if !read_full(&mut reader, &mut crc_buf)? {
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                tracing::warn!(path = %path.display(), frames = frames.len(), "WAL checksum mismatch, discarding tail");
                break;
            }

            match bincode::deserialize::<Frame>(&payload) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "undecodable WAL frame, discarding tail: {e}");
                    break;
                }
            }
            intact += 8 + len;
        }

        if intact < file_len {
            tracing::warn!(
                path = %path.display(),
                kept = intact,
                dropped = file_len - intact,
                "truncating damaged WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(intact)?;
            file.sync_all()?;
        }

        Ok(frames)
    }
}
