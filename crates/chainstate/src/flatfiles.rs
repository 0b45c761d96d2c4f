//! Append-only record files holding serialized blocks (`blk00000.dat`, ...)
//! and their undo data (`rev00000.dat`, ...).
//!
//! Each record is a little-endian `u32` payload length followed by the
//! payload. A file is closed to new records once the next one would push it
//! past the configured size; the first record of a file is always accepted.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 128 * 1024 * 1024;

const LENGTH_PREFIX_LEN: u64 = 4;

/// Position of one record: file number, byte offset of its length prefix, payload length.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub const ENCODED_LEN: usize = 16;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            file_id: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            offset: u64::from_le_bytes(bytes[4..12].try_into().ok()?),
            len: u32::from_le_bytes(bytes[12..16].try_into().ok()?),
        })
    }

    fn record_end(&self) -> u64 {
        self.offset + LENGTH_PREFIX_LEN + u64::from(self.len)
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(std::io::Error),
    /// Payload does not fit a `u32` length prefix.
    OversizedRecord(usize),
    /// Location is empty or points past the end of its file.
    BadLocation(FileLocation),
    /// Length prefix on disk disagrees with the indexed record length.
    LengthPrefix { expected: u32, found: u32 },
    /// Undo record too short to carry its checksum.
    TruncatedUndo,
    UndoChecksum,
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "block file io: {err}"),
            FlatFileError::OversizedRecord(len) => {
                write!(f, "record of {len} bytes is too large for a block file")
            }
            FlatFileError::BadLocation(loc) => write!(
                f,
                "block file location out of range (file {}, offset {}, len {})",
                loc.file_id, loc.offset, loc.len
            ),
            FlatFileError::LengthPrefix { expected, found } => write!(
                f,
                "record length prefix does not match: index says {expected}, file says {found}"
            ),
            FlatFileError::TruncatedUndo => write!(f, "undo record shorter than its checksum"),
            FlatFileError::UndoChecksum => write!(f, "undo checksum mismatch"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

/// Where the next record goes.
#[derive(Debug)]
struct AppendCursor {
    file_id: u32,
    file_len: u64,
}

impl AppendCursor {
    /// Moves to a fresh file when `record_len` more bytes would overflow the current one.
    fn reserve(&mut self, record_len: u64, max_file_size: u64) -> u64 {
        if self.file_len > 0 && self.file_len + record_len > max_file_size {
            self.file_id += 1;
            self.file_len = 0;
        }
        self.file_len
    }
}

pub struct FlatFileStore {
    dir: PathBuf,
    prefix: String,
    max_file_size: u64,
    cursor: Mutex<AppendCursor>,
}

impl FlatFileStore {
    /// Opens (or creates) `dir` and resumes appending after the last record of the newest file.
    pub fn open(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        let dir = dir.into();
        let prefix = prefix.into();
        std::fs::create_dir_all(&dir)?;
        let cursor = resume_cursor(&dir, &prefix, max_file_size)?;
        Ok(Self {
            dir,
            prefix,
            max_file_size,
            cursor: Mutex::new(cursor),
        })
    }

    pub fn append(&self, payload: &[u8]) -> Result<FileLocation, FlatFileError> {
        let len = u32::try_from(payload.len())
            .map_err(|_| FlatFileError::OversizedRecord(payload.len()))?;
        let record_len = LENGTH_PREFIX_LEN + u64::from(len);

        let mut cursor = self.cursor.lock().expect("flatfile lock");
        let offset = cursor.reserve(record_len, self.max_file_size);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_of(cursor.file_id))?;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(payload)?;
        file.flush()?;
        cursor.file_len += record_len;

        Ok(FileLocation {
            file_id: cursor.file_id,
            offset,
            len,
        })
    }

    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        let mut file = File::open(self.path_of(location.file_id))?;
        if location.len == 0 || location.record_end() > file.metadata()?.len() {
            return Err(FlatFileError::BadLocation(location));
        }
        file.seek(SeekFrom::Start(location.offset))?;

        let mut prefix = [0u8; LENGTH_PREFIX_LEN as usize];
        file.read_exact(&mut prefix)?;
        let found = u32::from_le_bytes(prefix);
        if found != location.len {
            return Err(FlatFileError::LengthPrefix {
                expected: location.len,
                found,
            });
        }

        let mut payload = vec![0u8; location.len as usize];
        file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// fsyncs the file currently being appended to.
    pub fn sync(&self) -> Result<(), FlatFileError> {
        let cursor = self.cursor.lock().expect("flatfile lock");
        match File::open(self.path_of(cursor.file_id)) {
            Ok(file) => Ok(file.sync_all()?),
            // Nothing appended to it yet.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn current_file(&self) -> u32 {
        self.cursor.lock().expect("flatfile lock").file_id
    }

    fn path_of(&self, file_id: u32) -> PathBuf {
        file_path(&self.dir, &self.prefix, file_id)
    }
}

fn file_path(dir: &Path, prefix: &str, file_id: u32) -> PathBuf {
    dir.join(format!("{prefix}{file_id:05}.dat"))
}

/// Files are numbered without gaps, so the newest is the last one that exists.
fn resume_cursor(dir: &Path, prefix: &str, max_file_size: u64) -> Result<AppendCursor, FlatFileError> {
    let Some(newest) = (0u32..)
        .take_while(|id| file_path(dir, prefix, *id).exists())
        .last()
    else {
        return Ok(AppendCursor { file_id: 0, file_len: 0 });
    };
    let file_len = std::fs::metadata(file_path(dir, prefix, newest))?.len();
    Ok(if file_len >= max_file_size {
        AppendCursor { file_id: newest + 1, file_len: 0 }
    } else {
        AppendCursor { file_id: newest, file_len }
    })
}
