//! Primary dataset storages.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;

use crate::data::frame::DataFrame;
use crate::data::schema::Schema;
use crate::data::text::TextFormat;
use crate::traits::model::ModelError;

/// UTC last-modified time used for staleness comparisons.
/// `UNIX_EPOCH` means "never written".
pub trait Timestamped {
    fn timestamp(&self) -> SystemTime;
}

/// Loads and saves a dataset
pub trait DataStorage: Timestamped + Send + Sync {
    /// Load the stored rows, interpreted with `schema`
    fn load_data(&self, schema: &Arc<Schema>, format: &TextFormat) -> Result<DataFrame, ModelError>;

    /// Replace the stored rows with `data`
    fn save_data(&self, data: &DataFrame, format: &TextFormat) -> Result<(), ModelError>;

    /// Raw text lines, used by duplicate detection
    fn text_rows(&self) -> Result<Vec<String>, ModelError>;
}

/// Text rows held in memory
#[derive(Debug)]
pub struct MemoryDataStorage {
    text: Mutex<String>,
    timestamp: AtomicCell<SystemTime>,
}

impl MemoryDataStorage {
    pub fn new() -> Self {
        Self {
            text: Mutex::new(String::new()),
            timestamp: AtomicCell::new(SystemTime::UNIX_EPOCH),
        }
    }

    /// Storage pre-filled with text rows; stamped now
    pub fn with_text(text: impl Into<String>) -> Self {
        let storage = Self::new();
        storage.set_text(text);
        storage
    }

    pub fn text(&self) -> String {
        self.text.lock().clone()
    }

    pub fn set_text(&self, text: impl Into<String>) {
        *self.text.lock() = text.into();
        self.timestamp.store(SystemTime::now());
    }
}

impl Default for MemoryDataStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Timestamped for MemoryDataStorage {
    fn timestamp(&self) -> SystemTime {
        self.timestamp.load()
    }
}

impl DataStorage for MemoryDataStorage {
    fn load_data(&self, schema: &Arc<Schema>, format: &TextFormat) -> Result<DataFrame, ModelError> {
        let text = self.text.lock().clone();
        format.parse(&text, schema)
    }

    fn save_data(&self, data: &DataFrame, format: &TextFormat) -> Result<(), ModelError> {
        let text = format.write(data)?;
        self.set_text(text);
        Ok(())
    }

    fn text_rows(&self) -> Result<Vec<String>, ModelError> {
        Ok(self.text.lock().lines().map(str::to_string).collect())
    }
}

/// Text rows stored in a file
#[derive(Debug, Clone)]
pub struct FileDataStorage {
    path: PathBuf,
}

impl FileDataStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_text(&self) -> Result<String, ModelError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Timestamped for FileDataStorage {
    fn timestamp(&self) -> SystemTime {
        fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }
}

impl DataStorage for FileDataStorage {
    fn load_data(&self, schema: &Arc<Schema>, format: &TextFormat) -> Result<DataFrame, ModelError> {
        format.parse(&self.read_text()?, schema)
    }

    fn save_data(&self, data: &DataFrame, format: &TextFormat) -> Result<(), ModelError> {
        let text = format.write(data)?;
        // write beside the target then rename, so readers never see a partial file
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn text_rows(&self) -> Result<Vec<String>, ModelError> {
        Ok(self.read_text()?.lines().map(str::to_string).collect())
    }
}
