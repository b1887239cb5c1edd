//! Filesystem backend

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use super::{IoHandle, IoMode, IoOpened, VirtualIo};
use crate::error::{Error, Result};

/// `file://` URLs and plain paths
#[derive(Debug, Default)]
pub struct FileIo;

impl FileIo {
    pub fn new() -> Self {
        Self
    }

    fn path(url: &str) -> Result<PathBuf> {
        if url.starts_with("file://") {
            let parsed = url::Url::parse(url)
                .map_err(|e| Error::BadParam(format!("invalid file URL '{}': {}", url, e)))?;
            parsed
                .to_file_path()
                .map_err(|_| Error::BadParam(format!("not a local file URL: '{}'", url)))
        } else {
            Ok(PathBuf::from(url))
        }
    }
}

impl VirtualIo for FileIo {
    fn name(&self) -> &str {
        "file"
    }

    fn schemes(&self) -> Vec<String> {
        vec!["file".to_string()]
    }

    fn open(&self, url: &str, mode: IoMode) -> Result<IoOpened> {
        let path = Self::path(url)?;
        let file = match mode {
            IoMode::Read => File::open(&path)?,
            IoMode::Write => File::create(&path)?,
            IoMode::Append => OpenOptions::new().create(true).append(true).open(&path)?,
            IoMode::Update => OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)?,
            IoMode::Probe => return Ok(IoOpened::Exists(path.is_file())),
            IoMode::Url => {
                let abs = std::fs::canonicalize(&path).unwrap_or(path);
                return Ok(IoOpened::Url(abs.display().to_string()));
            }
            // files are not reference counted
            IoMode::Ref | IoMode::Unref => return Ok(IoOpened::Refs(1)),
        };
        tracing::trace!(path = %path.display(), ?mode, "file opened");
        Ok(IoOpened::Handle(Box::new(FileHandle { file })))
    }
}

struct FileHandle {
    file: File,
}

impl IoHandle for FileHandle {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.file.seek(pos)?)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.file.write(buf)?)
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.file.stream_position()?)
    }

    fn eof(&mut self) -> bool {
        match (self.file.stream_position(), self.file.metadata()) {
            (Ok(pos), Ok(meta)) => pos >= meta.len(),
            _ => true,
        }
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}
