//! Append-only WAL segment files.
//!
//! A segment holds a contiguous run of raft entries starting at a fixed
//! index. Layout: an 8-byte magic header followed by length-prefixed
//! frames (`u32` little-endian length + payload). Entry positions are
//! rebuilt by a forward scan on open, so a truncated tail self-heals to
//! the last complete frame.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"TVLTWAL\x01";
const FRAME_HEADER: u64 = 4;

#[derive(Debug)]
pub struct Segment {
    file: File,
    path: PathBuf,
    start_index: u64,
    next_index: u64,
    positions: BTreeMap<u64, u64>,
}

impl Segment {
    pub fn open<P: AsRef<Path>>(path: P, start_index: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut segment = Segment {
            file,
            path: path.as_ref().to_path_buf(),
            start_index,
            next_index: start_index,
            positions: BTreeMap::new(),
        };

        if segment.file.metadata()?.len() == 0 {
            segment.file.write_all(MAGIC)?;
        } else {
            segment.check_magic()?;
            segment.scan()?;
        }
        Ok(segment)
    }

    fn check_magic(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 8];
        self.file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad segment magic in {}", self.path.display()),
            ));
        }
        Ok(())
    }

    /// Walks the frames, indexing each entry position. A torn final
    /// frame is dropped by truncating the file to the last good frame.
    fn scan(&mut self) -> io::Result<()> {
        self.positions.clear();
        self.next_index = self.start_index;
        let len = self.file.metadata()?.len();
        let mut pos = MAGIC.len() as u64;

        while pos + FRAME_HEADER <= len {
            self.file.seek(SeekFrom::Start(pos))?;
            let mut header = [0u8; 4];
            self.file.read_exact(&mut header)?;
            let frame_len = u32::from_le_bytes(header) as u64;
            if pos + FRAME_HEADER + frame_len > len {
                break;
            }
            self.positions.insert(self.next_index, pos);
            self.next_index += 1;
            pos += FRAME_HEADER + frame_len;
        }

        if pos < len {
            log::warn!(
                "wal: truncating torn tail of {} at byte {pos}",
                self.path.display()
            );
            self.file.set_len(pos)?;
        }
        Ok(())
    }

    pub fn append(&mut self, entries: &[Vec<u8>]) -> io::Result<()> {
        let mut pos = self.file.seek(SeekFrom::End(0))?;
        for entry in entries {
            let header = (entry.len() as u32).to_le_bytes();
            self.file.write_all(&header)?;
            self.file.write_all(entry)?;
            self.positions.insert(self.next_index, pos);
            self.next_index += 1;
            pos += FRAME_HEADER + entry.len() as u64;
        }
        self.file.sync_data()?;
        Ok(())
    }

    pub fn read(&mut self, index: u64) -> io::Result<Vec<u8>> {
        let pos = *self.positions.get(&index).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("entry {index} not in segment starting at {}", self.start_index),
            )
        })?;
        self.file.seek(SeekFrom::Start(pos))?;
        let mut header = [0u8; 4];
        self.file.read_exact(&mut header)?;
        let mut entry = vec![0u8; u32::from_le_bytes(header) as usize];
        self.file.read_exact(&mut entry)?;
        Ok(entry)
    }

    /// Drops `index` and everything after it; used when a new leader
    /// overwrites an uncommitted suffix.
    pub fn truncate_from(&mut self, index: u64) -> io::Result<()> {
        if index >= self.next_index {
            return Ok(());
        }
        let cut = index.max(self.start_index);
        let pos = self
            .positions
            .get(&cut)
            .copied()
            .unwrap_or(MAGIC.len() as u64);
        self.file.set_len(pos)?;
        self.file.sync_data()?;
        self.positions.split_off(&cut);
        self.next_index = cut;
        Ok(())
    }

    pub fn remove(self) -> io::Result<()> {
        std::fs::remove_file(&self.path)
    }

    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    /// Index one past the last stored entry.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn last_index(&self) -> Option<u64> {
        if self.next_index > self.start_index {
            Some(self.next_index - 1)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.next_index == self.start_index
    }
}
