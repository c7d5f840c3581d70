//! Persistent read cursors for tailed files.
//!
//! Every tailed file gets one position file in the state directory holding a
//! single record: `"0x%08x 0x%08x %d\n"` (device and inode in hex, byte
//! offset in decimal). A record without its terminating newline, or with
//! fields that fail to parse, counts as "no known position" and the tailed
//! file is read from the start. Because of that policy the store never needs
//! an fsync: a torn write degrades to a rescan, not to corruption.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

/// A parsed position record: which file, and how far into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionRecord {
    /// Device number of the file the offset refers to.
    pub device: u64,
    /// Inode number of the file the offset refers to.
    pub inode: u64,
    /// Byte position of the next unread byte, excluding any pending
    /// partial line.
    pub offset: u64,
}

/// Location of the position file for `tailed` inside `state_dir`.
///
/// The name is the SHA-1 hex digest of the tailed path plus a `.pos`
/// suffix, so any absolute path maps to a flat, collision-free file name.
pub fn position_path(state_dir: &Path, tailed: &Path) -> PathBuf {
    let digest = Sha1::digest(tailed.as_os_str().as_bytes());
    let mut name = String::with_capacity(digest.len() * 2 + 4);
    for byte in digest {
        let _ = write!(name, "{byte:02x}");
    }
    name.push_str(".pos");
    state_dir.join(name)
}

/// Handle on one position file.
#[derive(Debug)]
pub struct PositionFile {
    file: File,
}

impl PositionFile {
    /// Open (or create) the position file at `path`.
    ///
    /// The file is never truncated here: if a concurrent writer crashed
    /// mid-update, the previous record must stay readable.
    pub fn open(path: &Path) -> io::Result<PositionFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(PositionFile { file })
    }

    /// Read the stored record, if there is a well-formed one.
    ///
    /// Malformed content is not an error; it means "no known position".
    pub fn read(&mut self) -> io::Result<Option<PositionRecord>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut raw = Vec::new();
        self.file.read_to_end(&mut raw)?;
        Ok(parse_record(&raw))
    }

    /// Overwrite the stored record, trimming any leftover from a longer one.
    pub fn update(&mut self, device: u64, inode: u64, offset: u64) -> io::Result<()> {
        let record = format!("0x{device:08x} 0x{inode:08x} {offset}\n");
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(record.as_bytes())?;
        self.file.set_len(record.len() as u64)?;
        self.file.flush()
    }

    /// Clear the stored record (the tailed file is gone).
    pub fn truncate(&mut self) -> io::Result<()> {
        self.file.set_len(0)
    }
}

fn parse_record(raw: &[u8]) -> Option<PositionRecord> {
    // Only a newline-terminated first line counts; anything else is a
    // record that was still being written when the previous run died.
    let end = memchr::memchr(b'\n', raw)?;
    let line = std::str::from_utf8(&raw[..end]).ok()?;
    let mut fields = line.split(' ');
    let device = parse_hex(fields.next()?)?;
    let inode = parse_hex(fields.next()?)?;
    let offset = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(PositionRecord {
        device,
        inode,
        offset,
    })
}

fn parse_hex(field: &str) -> Option<u64> {
    u64::from_str_radix(field.strip_prefix("0x")?, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn store(dir: &tempfile::TempDir) -> PositionFile {
        PositionFile::open(&dir.path().join("cursor.pos")).unwrap()
    }

    #[test]
    fn update_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut position = store(&dir);
        position.update(0x801, 42, 1234).unwrap();
        assert_eq!(
            position.read().unwrap(),
            Some(PositionRecord {
                device: 0x801,
                inode: 42,
                offset: 1234,
            })
        );
    }

    #[test]
    fn empty_file_means_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let mut position = store(&dir);
        assert_eq!(position.read().unwrap(), None);
    }

    #[test]
    fn missing_newline_means_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.pos");
        fs::write(&path, "0x00000801 0x0000002a 12").unwrap();
        let mut position = PositionFile::open(&path).unwrap();
        assert_eq!(position.read().unwrap(), None);
    }

    #[test]
    fn garbage_fields_mean_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.pos");
        for garbage in [
            "not a record at all\n",
            "0x00000801 0x0000002a\n",
            "0x00000801 0x0000002a twelve\n",
            "0x00000801 0x0000002a 12 extra\n",
            "00000801 0000002a 12\n",
        ] {
            fs::write(&path, garbage).unwrap();
            let mut position = PositionFile::open(&path).unwrap();
            assert_eq!(position.read().unwrap(), None, "accepted {garbage:?}");
        }
    }

    #[test]
    fn update_trims_longer_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.pos");
        let mut position = PositionFile::open(&path).unwrap();
        position.update(0x801, 42, 123_456_789).unwrap();
        position.update(0x801, 42, 7).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "0x00000801 0x0000002a 7\n");
    }

    #[test]
    fn open_preserves_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.pos");
        fs::write(&path, "half a reco").unwrap();
        let _position = PositionFile::open(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "half a reco");
    }

    #[test]
    fn truncate_clears() {
        let dir = tempfile::tempdir().unwrap();
        let mut position = store(&dir);
        position.update(1, 2, 3).unwrap();
        position.truncate().unwrap();
        assert_eq!(position.read().unwrap(), None);
    }

    #[test]
    fn path_is_stable_and_flat() {
        let state = Path::new("/var/lib/logdevd");
        let first = position_path(state, Path::new("/var/log/messages"));
        let second = position_path(state, Path::new("/var/log/messages"));
        assert_eq!(first, second);
        assert_eq!(first.parent(), Some(state));
        let name = first.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), 40 + ".pos".len());
        assert!(name.ends_with(".pos"));
    }
}
