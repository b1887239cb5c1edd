//! In-memory backend (`mem://name`)
//!
//! Resources live in a concurrent map. `Ref` creates a resource lazily and counts holders;
//! the last `Unref` drops it. Resources created by writing are not reference counted and
//! stay until [`MemoryIo::remove`].

use dashmap::DashMap;
use parking_lot::RwLock;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{IoHandle, IoMode, IoOpened, VirtualIo};
use crate::error::{Error, Result};

const SCHEME_PREFIX: &str = "mem://";

#[derive(Debug, Default)]
struct MemoryEntry {
    data: RwLock<Vec<u8>>,
    refs: AtomicUsize,
}

/// Named byte buffers addressed as `mem://name`
#[derive(Debug, Default)]
pub struct MemoryIo {
    entries: DashMap<String, Arc<MemoryEntry>>,
}

impl MemoryIo {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(url: &str) -> Result<String> {
        let lower = url.to_ascii_lowercase();
        if !lower.starts_with(SCHEME_PREFIX) {
            return Err(Error::BadParam(format!("not a mem:// URL: '{}'", url)));
        }
        let key = &url[SCHEME_PREFIX.len()..];
        if key.is_empty() {
            return Err(Error::BadParam("empty mem:// resource name".into()));
        }
        Ok(key.to_string())
    }

    /// Stores `data` under `name`, replacing any previous content
    pub fn insert(&self, name: &str, data: impl Into<Vec<u8>>) {
        let entry = self.entries.entry(name.to_string()).or_default().clone();
        *entry.data.write() = data.into();
    }

    /// Copy of the content stored under `name`
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.entries.get(name).map(|e| e.data.read().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<Vec<u8>> {
        self.entries
            .remove(name)
            .map(|(_, e)| std::mem::take(&mut *e.data.write()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl VirtualIo for MemoryIo {
    fn name(&self) -> &str {
        "memory"
    }

    fn schemes(&self) -> Vec<String> {
        vec!["mem".to_string()]
    }

    fn open(&self, url: &str, mode: IoMode) -> Result<IoOpened> {
        let key = Self::key(url)?;
        let entry = match mode {
            IoMode::Read => self
                .entries
                .get(&key)
                .map(|e| e.clone())
                .ok_or_else(|| {
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no memory resource '{}'", key),
                    ))
                })?,
            IoMode::Write => {
                let entry = self.entries.entry(key).or_default().clone();
                entry.data.write().clear();
                entry
            }
            IoMode::Append | IoMode::Update => self.entries.entry(key).or_default().clone(),
            IoMode::Probe => return Ok(IoOpened::Exists(self.entries.contains_key(&key))),
            IoMode::Url => return Ok(IoOpened::Url(format!("{}{}", SCHEME_PREFIX, key))),
            IoMode::Ref => {
                let entry = self.entries.entry(key).or_default().clone();
                return Ok(IoOpened::Refs(entry.refs.fetch_add(1, Ordering::AcqRel) + 1));
            }
            IoMode::Unref => {
                // remove_if keeps the decrement and the removal atomic against a concurrent Ref
                let mut remaining = 0;
                let removed = self.entries.remove_if(&key, |_, e| {
                    remaining = e.refs.load(Ordering::Acquire).saturating_sub(1);
                    e.refs.store(remaining, Ordering::Release);
                    remaining == 0
                });
                if removed.is_some() {
                    tracing::trace!(resource = %key, "memory resource released");
                }
                return Ok(IoOpened::Refs(remaining));
            }
        };
        let pos = match mode {
            IoMode::Append => entry.data.read().len() as u64,
            _ => 0,
        };
        Ok(IoOpened::Handle(Box::new(MemoryHandle {
            entry,
            pos,
            writable: mode != IoMode::Read,
            append: mode == IoMode::Append,
        })))
    }
}

struct MemoryHandle {
    entry: Arc<MemoryEntry>,
    pos: u64,
    writable: bool,
    append: bool,
}

impl IoHandle for MemoryHandle {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = self.entry.data.read().len() as i64;
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(d) => len + d,
            SeekFrom::Current(d) => self.pos as i64 + d,
        };
        if target < 0 {
            return Err(Error::BadParam(format!("seek before start ({})", target)));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let data = self.entry.data.read();
        let start = (self.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(Error::NotSupported("memory resource opened read-only".into()));
        }
        let mut data = self.entry.data.write();
        if self.append {
            self.pos = data.len() as u64;
        }
        let start = self.pos as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.pos)
    }

    fn eof(&mut self) -> bool {
        self.pos >= self.entry.data.read().len() as u64
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
