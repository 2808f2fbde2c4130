use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::SystemTime;

use sha2::{Digest, Sha256};

use crate::error::{BackupError, Result};

/// Default block size for every streaming read/write in the engine.
pub const BLOCK_SIZE: usize = 1 << 16;

/// A scoped handle around one file, or an anonymous scratch buffer when no
/// path is given. Mirrors the "open once, read or write block-wise, ask for
/// the running digest" contract described for the streaming I/O iterator.
pub struct StreamHandle {
    state: RefCell<State>,
}

struct State {
    path: Option<PathBuf>,
    file: Option<File>,
    in_use: bool,
    check_mtime: bool,
    entry_mtime: Option<SystemTime>,
    sha: Sha256,
}

#[derive(Debug, Clone)]
pub struct Stat {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub mtime: SystemTime,
    pub size: u64,
}

impl StreamHandle {
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        StreamHandle {
            state: RefCell::new(State {
                path: Some(path.into()),
                file: None,
                in_use: false,
                check_mtime: true,
                entry_mtime: None,
                sha: Sha256::new(),
            }),
        }
    }

    /// An anonymous scratch buffer with no backing path. Always realised as
    /// a real temp file, so it "spills to disk" unconditionally rather than
    /// starting in memory and growing into one past a size threshold.
    pub fn anonymous() -> Self {
        StreamHandle {
            state: RefCell::new(State {
                path: None,
                file: None,
                in_use: false,
                check_mtime: false,
                entry_mtime: None,
                sha: Sha256::new(),
            }),
        }
    }

    /// Disable the mtime-changed check for this handle. Used for the
    /// manifest's own working copy, which is rewritten continuously during a
    /// backup run.
    pub fn without_mtime_check(self) -> Self {
        self.state.borrow_mut().check_mtime = false;
        self
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.state.borrow().path.clone()
    }

    /// Enter the scope. Fails with `DoubleBuffer` if a previous scope on
    /// this same handle is still open.
    pub fn open(&self) -> Result<StreamScope<'_>> {
        let mut state = self.state.borrow_mut();
        if state.in_use {
            return Err(BackupError::DoubleBuffer { path: state.path.clone() });
        }
        if state.file.is_none() {
            let file = match &state.path {
                Some(p) => OpenOptions::new().read(true).write(true).create(true).open(p)?,
                None => tempfile::tempfile()?,
            };
            state.file = Some(file);
        }
        state.entry_mtime = if state.check_mtime {
            state.path.as_ref().map(entry_mtime).transpose()?
        } else {
            None
        };
        state.in_use = true;
        state.sha = Sha256::new();
        Ok(StreamScope { handle: self })
    }
}

fn entry_mtime(path: &PathBuf) -> Result<SystemTime> {
    Ok(std::fs::metadata(path)?.modified()?)
}

pub struct StreamScope<'a> {
    handle: &'a StreamHandle,
}

impl<'a> Drop for StreamScope<'a> {
    fn drop(&mut self) {
        self.handle.state.borrow_mut().in_use = false;
    }
}

impl<'a> StreamScope<'a> {
    pub fn reader(&self, end: Option<u64>, reset_pos: bool) -> Result<Reader<'a>> {
        let mut state = self.handle.state.borrow_mut();
        let file = state.file.as_mut().expect("scope holds an open file");
        if reset_pos {
            file.seek(SeekFrom::Start(0))?;
        }
        let pos = file.stream_position()?;
        let remaining = end.map(|e| e.saturating_sub(pos));
        drop(state);
        Ok(Reader { handle: self.handle, remaining, reset_pos, finished: false })
    }

    pub fn writer(&self) -> Writer<'a> {
        Writer { handle: self.handle, truncated: false }
    }

    pub fn sha(&self) -> String {
        hex::encode(self.handle.state.borrow().sha.clone().finalize())
    }

    /// Current size in bytes, read straight off the open file descriptor so
    /// it works for anonymous buffers too (which have no path to `stat()`).
    pub fn len(&self) -> Result<u64> {
        let state = self.handle.state.borrow();
        let file = state.file.as_ref().expect("scope holds an open file");
        Ok(file.metadata()?.len())
    }

    pub fn stat(&self) -> Result<Stat> {
        let state = self.handle.state.borrow();
        let path = state
            .path
            .as_ref()
            .ok_or_else(|| BackupError::InputParseError("stat() on an anonymous buffer".into()))?;
        let meta = std::fs::metadata(path)?;
        let (uid, gid, mode) = platform_owner(&meta);
        Ok(Stat { uid, gid, mode, mtime: meta.modified()?, size: meta.len() })
    }
}

#[cfg(unix)]
fn platform_owner(meta: &std::fs::Metadata) -> (u32, u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (meta.uid(), meta.gid(), meta.mode())
}

#[cfg(windows)]
fn platform_owner(_meta: &std::fs::Metadata) -> (u32, u32, u32) {
    (0, 0, 0)
}

/// Lazy, finite sequence of byte blocks. Each call to `next()` re-stats the
/// underlying path (when mtime checking is on) and fails the whole sequence
/// with `FileChanged` the moment it no longer matches the mtime captured at
/// scope entry.
pub struct Reader<'a> {
    handle: &'a StreamHandle,
    remaining: Option<u64>,
    reset_pos: bool,
    finished: bool,
}

impl<'a> Iterator for Reader<'a> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if let Some(0) = self.remaining {
            self.finished = true;
            return None;
        }

        let mut state = self.handle.state.borrow_mut();
        if state.check_mtime {
            if let Some(path) = state.path.clone() {
                match entry_mtime(&path) {
                    Ok(mtime) if Some(mtime) == state.entry_mtime => {}
                    Ok(_) => {
                        self.finished = true;
                        return Some(Err(BackupError::FileChanged { path }));
                    }
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
            }
        }

        let want = match self.remaining {
            Some(r) => std::cmp::min(r, BLOCK_SIZE as u64) as usize,
            None => BLOCK_SIZE,
        };
        let file = state.file.as_mut().expect("scope holds an open file");
        let mut buf = vec![0u8; want];
        let n = match file.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                self.finished = true;
                return Some(Err(e.into()));
            }
        };
        if n == 0 {
            self.finished = true;
            return None;
        }
        buf.truncate(n);
        state.sha.update(&buf);
        if let Some(r) = self.remaining.as_mut() {
            *r -= n as u64;
        }
        Some(Ok(buf))
    }
}

impl<'a> Drop for Reader<'a> {
    fn drop(&mut self) {
        if self.reset_pos {
            if let Some(file) = self.handle.state.borrow_mut().file.as_mut() {
                let _ = file.seek(SeekFrom::Start(0));
            }
        }
    }
}

/// Sink side: truncates the file on the first block pushed through it,
/// updates the running digest, and flushes after every block.
pub struct Writer<'a> {
    handle: &'a StreamHandle,
    truncated: bool,
}

impl<'a> Writer<'a> {
    pub fn write_block(&mut self, block: &[u8]) -> Result<()> {
        let mut state = self.handle.state.borrow_mut();
        let file = state.file.as_mut().expect("scope holds an open file");
        if !self.truncated {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            self.truncated = true;
        }
        file.write_all(block)?;
        file.flush()?;
        state.sha.update(block);
        Ok(())
    }
}

/// Drain `handle` once and return the hex SHA-256 digest of its contents.
pub fn compute_sha(handle: &StreamHandle) -> Result<String> {
    let scope = handle.open()?;
    for block in scope.reader(None, true)? {
        block?;
    }
    Ok(scope.sha())
}

/// Copy all of `src`'s bytes into `dest`, returning the hex SHA-256 of the
/// copied content.
pub fn io_copy(src: &StreamHandle, dest: &StreamHandle) -> Result<String> {
    let src_scope = src.open()?;
    let dest_scope = dest.open()?;
    let mut writer = dest_scope.writer();
    let reader = src_scope.reader(None, true)?;
    for block in reader {
        writer.write_block(&block?)?;
    }
    Ok(dest_scope.sha())
}
