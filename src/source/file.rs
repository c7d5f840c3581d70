//! Tailing a growing regular file.
//!
//! The reader keeps its own logical offset (bytes handed out so far) rather
//! than trusting the descriptor position, carries at most one unterminated
//! line between calls, and persists `(device, inode, offset)` through a
//! [`PositionFile`] so a restart resumes exactly where the previous run
//! stopped. Rotation and truncation are detected by statting the *path* and
//! comparing against the identity of the descriptor that is actually open.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::position::{PositionFile, position_path};
use crate::source::Line;

/// Tails one regular file.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    position: PositionFile,
    reader: Option<BufReader<File>>,
    /// `(device, inode)` of the descriptor currently open.
    identity: Option<(u64, u64)>,
    /// Bytes consumed from the current file, including a pending partial.
    offset: u64,
    /// At most one unterminated line, waiting for the writer to finish it.
    partial: Option<Vec<u8>>,
    closed: bool,
    warned: bool,
}

impl FileSource {
    /// Create a source tailing `path`, with its cursor kept in `state_dir`.
    ///
    /// Only opening the position file can fail here; the tailed file itself
    /// may appear later.
    pub fn new(path: &Path, state_dir: &Path) -> io::Result<FileSource> {
        let path = std::path::absolute(path)?;
        let position = PositionFile::open(&position_path(state_dir, &path))?;
        Ok(FileSource {
            path,
            position,
            reader: None,
            identity: None,
            offset: 0,
            partial: None,
            closed: false,
            warned: false,
        })
    }

    pub(crate) fn open(&mut self) {
        if self.closed || self.reader.is_some() {
            return;
        }
        match File::open(&self.path) {
            Ok(file) => {
                if let Err(err) = self.resume(file) {
                    self.report_open_failure(err);
                }
            }
            Err(err) => self.report_open_failure(err),
        }
    }

    /// Seek to the stored position if it belongs to this very file and is
    /// still within it; otherwise start from the top and say so in the
    /// position store.
    fn resume(&mut self, file: File) -> io::Result<()> {
        let meta = file.metadata()?;
        let (device, inode, size) = (meta.dev(), meta.ino(), meta.len());
        let mut reader = BufReader::new(file);
        self.offset = 0;
        match self.position.read()? {
            Some(stored)
                if (stored.device, stored.inode) == (device, inode) && stored.offset <= size =>
            {
                reader.seek(SeekFrom::Start(stored.offset))?;
                self.offset = stored.offset;
            }
            _ => self.position.update(device, inode, 0)?,
        }
        self.identity = Some((device, inode));
        self.partial = None;
        self.reader = Some(reader);
        self.warned = false;
        debug!("tailing {} from offset {}", self.path.display(), self.offset);
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.flush() {
            warn!("cannot persist position of {}: {}", self, err);
        }
        self.reader = None;
        self.identity = None;
        self.partial = None;
        self.closed = true;
    }

    pub(crate) fn fileno(&self) -> Option<RawFd> {
        self.reader.as_ref().map(|reader| reader.get_ref().as_raw_fd())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn next_line(&mut self) -> io::Result<Option<Line>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let mut chunk = Vec::new();
        let read = reader.read_until(b'\n', &mut chunk)?;
        if read == 0 {
            return Ok(None);
        }
        self.offset += read as u64;
        if chunk.last() == Some(&b'\n') {
            chunk.pop();
            let line = match self.partial.take() {
                Some(mut pending) => {
                    pending.extend_from_slice(&chunk);
                    pending
                }
                None => chunk,
            };
            return Ok(Some(line));
        }
        // No newline, so end-of-file landed mid-line. Hold the bytes back
        // until the writer finishes the line.
        match self.partial.as_mut() {
            Some(pending) => pending.extend_from_slice(&chunk),
            None => self.partial = Some(chunk),
        }
        Ok(None)
    }

    /// Whether the path now denotes a different file than the open
    /// descriptor: removed, truncated, or atomically replaced.
    pub(crate) fn rotation_needed(&mut self) -> bool {
        if self.reader.is_none() {
            return false;
        }
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(_) => {
                self.forget_file();
                return true;
            }
        };
        if meta.len() < self.offset {
            // The file shrank under us: truncated in place, or replaced by
            // a shorter one with the same identity.
            self.forget_file();
            return true;
        }
        Some((meta.dev(), meta.ino())) != self.identity
    }

    fn forget_file(&mut self) {
        self.identity = None;
        if let Err(err) = self.position.truncate() {
            warn!("cannot clear position of {}: {}", self, err);
        }
    }

    /// Cycle the descriptor after a rotation. The new file is read from
    /// offset 0 regardless of any stored cursor.
    pub(crate) fn reopen(&mut self) {
        if self.closed {
            return;
        }
        if let Some(pending) = self.partial.take() {
            debug!(
                "{}: dropping {} bytes of an unterminated line across a rotation",
                self,
                pending.len()
            );
        }
        self.reader = None;
        self.identity = None;
        self.offset = 0;
        match File::open(&self.path) {
            Ok(file) => {
                if let Err(err) = self.restart(file) {
                    self.report_open_failure(err);
                }
            }
            Err(err) => self.report_open_failure(err),
        }
    }

    fn restart(&mut self, file: File) -> io::Result<()> {
        let meta = file.metadata()?;
        let (device, inode) = (meta.dev(), meta.ino());
        self.position.update(device, inode, 0)?;
        self.identity = Some((device, inode));
        self.reader = Some(BufReader::new(file));
        self.warned = false;
        Ok(())
    }

    /// Persist the durable offset: everything consumed minus the pending
    /// partial line, so an unterminated line is re-read whole next start.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        if self.reader.is_none() {
            return Ok(());
        }
        let Some((device, inode)) = self.identity else {
            return Ok(());
        };
        let pending = self.partial.as_ref().map_or(0, |p| p.len() as u64);
        self.position.update(device, inode, self.offset - pending)
    }

    fn report_open_failure(&mut self, err: io::Error) {
        self.reader = None;
        if self.warned {
            debug!("still cannot open {}: {}", self.path.display(), err);
        } else {
            warn!("cannot open {}: {}", self.path.display(), err);
            self.warned = true;
        }
    }
}

impl fmt::Display for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}
