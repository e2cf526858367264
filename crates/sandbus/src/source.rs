//! # Source store
//!
//! Persists the most recently loaded guest source so a session can resume it.
//! A store holds a single text blob under a fixed key.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use sandrpc::lock;

/// File name the file store keeps its blob under.
pub const SOURCE_KEY: &str = "source.wat";

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait SourceStore: Send + Sync {
    /// The saved source, or `None` if nothing was saved yet.
    fn load(&self) -> Result<Option<String>>;

    fn save(&self, source: &str) -> Result<()>;
}

/// Keeps the source in a file under a state directory.
pub struct FileSourceStore {
    dir: PathBuf,
}

impl FileSourceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(SOURCE_KEY)
    }
}

impl SourceStore for FileSourceStore {
    fn load(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path()) {
            Ok(source) => Ok(Some(source)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, source: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        // staged write, renamed into place
        let staging = self.dir.join(format!("{}.tmp", SOURCE_KEY));
        std::fs::write(&staging, source)?;
        std::fs::rename(&staging, self.path())?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySourceStore {
    source: Mutex<Option<String>>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SourceStore for MemorySourceStore {
    fn load(&self) -> Result<Option<String>> {
        Ok(lock(&self.source).clone())
    }

    fn save(&self, source: &str) -> Result<()> {
        *lock(&self.source) = Some(source.to_string());
        Ok(())
    }
}
