//! Virtual file I/O
//!
//! Filters reading or writing resources go through an [`IoRegistry`] instead of the
//! filesystem, so storage backends can be swapped without touching the filters. A backend
//! serves one or more URL schemes; bare paths belong to the `file` scheme.
//!
//! Besides the data modes, [`IoMode`] carries lifecycle signals: `Ref`/`Unref` for backends
//! managing reference-counted, lazily created resources, `Probe` to test existence and `Url`
//! to derive the canonical URL of a resource.

pub mod file;
pub mod memory;

pub use file::FileIo;
pub use memory::MemoryIo;

use std::io::SeekFrom;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// How a resource is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Read,
    /// Create or truncate
    Write,
    Append,
    /// Read and write without truncating
    Update,
    /// Take a reference on the resource, creating it lazily
    Ref,
    /// Release a reference taken with `Ref`
    Unref,
    /// Test for existence without opening
    Probe,
    /// Resolve the canonical URL
    Url,
}

impl IoMode {
    pub fn is_data_mode(&self) -> bool {
        matches!(
            self,
            IoMode::Read | IoMode::Write | IoMode::Append | IoMode::Update
        )
    }
}

/// Open resource
pub trait IoHandle: Send {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn tell(&mut self) -> Result<u64>;
    fn eof(&mut self) -> bool;
    fn close(self: Box<Self>) -> Result<()>;
}

/// Result of [`VirtualIo::open`], depending on the mode
pub enum IoOpened {
    Handle(Box<dyn IoHandle>),
    /// `Ref`/`Unref` acknowledged; the value is the remaining reference count
    Refs(usize),
    Exists(bool),
    Url(String),
}

impl std::fmt::Debug for IoOpened {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoOpened::Handle(_) => f.write_str("IoOpened::Handle"),
            IoOpened::Refs(n) => write!(f, "IoOpened::Refs({})", n),
            IoOpened::Exists(e) => write!(f, "IoOpened::Exists({})", e),
            IoOpened::Url(u) => write!(f, "IoOpened::Url({})", u),
        }
    }
}

/// Storage backend
pub trait VirtualIo: Send + Sync {
    fn name(&self) -> &str;

    /// URL schemes served, lowercase
    fn schemes(&self) -> Vec<String>;

    fn open(&self, url: &str, mode: IoMode) -> Result<IoOpened>;
}

/// Scheme of `url`, `file` for plain paths (including Windows drive letters)
pub fn url_scheme(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) if parsed.scheme().len() > 1 => parsed.scheme().to_ascii_lowercase(),
        _ => "file".to_string(),
    }
}

/// Backends by scheme
///
/// Uses `RwLock` internally: registration is write-locked, lookups are read-locked.
pub struct IoRegistry {
    backends: RwLock<Vec<Arc<dyn VirtualIo>>>,
    memory: Arc<MemoryIo>,
}

impl Default for IoRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IoRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

impl IoRegistry {
    /// Registry with the `file` and `mem` backends
    pub fn new() -> Self {
        let memory = Arc::new(MemoryIo::new());
        let backends: Vec<Arc<dyn VirtualIo>> = vec![Arc::new(FileIo::new()), memory.clone()];
        Self {
            backends: RwLock::new(backends),
            memory,
        }
    }

    /// Adds a backend
    ///
    /// # Errors
    ///
    /// Returns `Config` if one of its schemes is already served.
    pub fn register(&self, backend: Arc<dyn VirtualIo>) -> Result<()> {
        let mut backends = self
            .backends
            .write()
            .map_err(|e| Error::Other(format!("Failed to acquire I/O registry lock: {}", e)))?;
        for scheme in backend.schemes() {
            if backends.iter().any(|b| b.schemes().contains(&scheme)) {
                return Err(Error::Config(format!(
                    "I/O scheme '{}' is already registered",
                    scheme
                )));
            }
        }
        tracing::debug!(backend = backend.name(), schemes = ?backend.schemes(), "I/O backend registered");
        backends.push(backend);
        Ok(())
    }

    pub fn schemes(&self) -> Vec<String> {
        self.backends
            .read()
            .map(|b| b.iter().flat_map(|b| b.schemes()).collect())
            .unwrap_or_default()
    }

    /// Built-in in-memory backend
    pub fn memory(&self) -> &Arc<MemoryIo> {
        &self.memory
    }

    /// Backend serving `url`
    pub fn resolve(&self, url: &str) -> Result<Arc<dyn VirtualIo>> {
        let scheme = url_scheme(url);
        let backends = self
            .backends
            .read()
            .map_err(|e| Error::Other(format!("Failed to acquire I/O registry lock: {}", e)))?;
        backends
            .iter()
            .find(|b| b.schemes().contains(&scheme))
            .cloned()
            .ok_or_else(|| Error::NotSupported(format!("no I/O backend for scheme '{}'", scheme)))
    }

    /// Opens `url` in a data mode
    pub fn open(&self, url: &str, mode: IoMode) -> Result<Box<dyn IoHandle>> {
        if !mode.is_data_mode() {
            return Err(Error::BadParam(format!("{:?} is not a data mode", mode)));
        }
        match self.resolve(url)?.open(url, mode)? {
            IoOpened::Handle(handle) => Ok(handle),
            other => Err(Error::ServiceError(format!(
                "backend answered {:?} to an open of '{}'",
                other, url
            ))),
        }
    }

    /// True when a backend serves `url` and the resource exists
    pub fn probe(&self, url: &str) -> bool {
        match self.resolve(url).and_then(|b| b.open(url, IoMode::Probe)) {
            Ok(IoOpened::Exists(exists)) => exists,
            _ => false,
        }
    }

    /// True when a backend serves the scheme of `url`
    pub fn handles(&self, url: &str) -> bool {
        self.resolve(url).is_ok()
    }

    pub fn canonical_url(&self, url: &str) -> Result<String> {
        match self.resolve(url)?.open(url, IoMode::Url)? {
            IoOpened::Url(resolved) => Ok(resolved),
            _ => Ok(url.to_string()),
        }
    }

    /// Takes a reference on `url`, returns the new count
    pub fn reference(&self, url: &str) -> Result<usize> {
        self.refs(url, IoMode::Ref)
    }

    /// Releases a reference on `url`, returns the remaining count
    pub fn unreference(&self, url: &str) -> Result<usize> {
        self.refs(url, IoMode::Unref)
    }

    fn refs(&self, url: &str, mode: IoMode) -> Result<usize> {
        match self.resolve(url)?.open(url, mode)? {
            IoOpened::Refs(n) => Ok(n),
            other => Err(Error::ServiceError(format!(
                "backend answered {:?} to {:?} of '{}'",
                other, mode, url
            ))),
        }
    }

    /// Reads a whole resource
    pub fn read_all(&self, url: &str) -> Result<Vec<u8>> {
        let mut handle = self.open(url, IoMode::Read)?;
        let mut out = Vec::new();
        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = handle.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        handle.close()?;
        Ok(out)
    }
}
