//! Trained-model persistence.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::data::schema::Schema;
use crate::storage::data::Timestamped;
use crate::traits::model::ModelError;
use crate::traits::transform::{Transformer, TransformerState};

/// Loads and saves a trained transformer together with its input schema
pub trait ModelStorage: Timestamped + Send + Sync {
    /// `None` when nothing has been stored yet
    fn load_model(&self) -> Result<Option<(Arc<dyn Transformer>, Schema)>, ModelError>;

    fn save_model(&self, model: &Arc<dyn Transformer>, schema: &Schema) -> Result<(), ModelError>;
}

/// Keeps the live transformer in memory
#[derive(Debug)]
pub struct MemoryModelStorage {
    slot: Mutex<Option<(Arc<dyn Transformer>, Schema)>>,
    timestamp: AtomicCell<SystemTime>,
}

impl MemoryModelStorage {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            timestamp: AtomicCell::new(SystemTime::UNIX_EPOCH),
        }
    }
}

impl Default for MemoryModelStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Timestamped for MemoryModelStorage {
    fn timestamp(&self) -> SystemTime {
        self.timestamp.load()
    }
}

impl ModelStorage for MemoryModelStorage {
    fn load_model(&self) -> Result<Option<(Arc<dyn Transformer>, Schema)>, ModelError> {
        Ok(self.slot.lock().clone())
    }

    fn save_model(&self, model: &Arc<dyn Transformer>, schema: &Schema) -> Result<(), ModelError> {
        *self.slot.lock() = Some((Arc::clone(model), schema.clone()));
        self.timestamp.store(SystemTime::now());
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredModel {
    schema: Schema,
    model: TransformerState,
}

/// JSON document holding the transformer state and its input schema
#[derive(Debug, Clone)]
pub struct FileModelStorage {
    path: PathBuf,
}

impl FileModelStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Timestamped for FileModelStorage {
    fn timestamp(&self) -> SystemTime {
        fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }
}

impl ModelStorage for FileModelStorage {
    fn load_model(&self) -> Result<Option<(Arc<dyn Transformer>, Schema)>, ModelError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let stored: StoredModel = serde_json::from_str(&text)?;
        Ok(Some((stored.model.restore()?, stored.schema)))
    }

    fn save_model(&self, model: &Arc<dyn Transformer>, schema: &Schema) -> Result<(), ModelError> {
        let stored = StoredModel {
            schema: schema.clone(),
            model: model.state()?,
        };
        let json = serde_json::to_string_pretty(&stored)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
