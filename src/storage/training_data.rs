use std::sync::Arc;
use std::time::SystemTime;

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;

use crate::data::frame::DataFrame;
use crate::data::schema::Schema;
use crate::data::text::TextFormat;
use crate::storage::data::{DataStorage, Timestamped};
use crate::traits::model::ModelError;

/// Buffer accumulating training rows not yet committed to the primary storage.
///
/// Rows are kept bare: the format's header option is ignored both ways.
#[derive(Debug)]
pub struct TrainingData {
    /// Text rows, one per line
    text: Mutex<String>,
    /// Last time the buffer changed
    timestamp: AtomicCell<SystemTime>,
}

impl TrainingData {
    /// Create an empty buffer that has never been written
    pub fn new() -> Self {
        Self {
            text: Mutex::new(String::new()),
            timestamp: AtomicCell::new(SystemTime::UNIX_EPOCH),
        }
    }

    /// Append text rows; a line separator is inserted when needed
    pub fn append(&self, rows: &str) {
        let rows = rows.trim_end_matches(['\r', '\n']);
        if rows.is_empty() {
            return;
        }
        let mut text = self.text.lock();
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(rows);
        self.timestamp.store(SystemTime::now());
    }

    /// Drop every pending row
    pub fn clear(&self) {
        let mut text = self.text.lock();
        text.clear();
        self.timestamp.store(SystemTime::now());
    }

    pub fn is_empty(&self) -> bool {
        self.text.lock().trim().is_empty()
    }

    pub fn text(&self) -> String {
        self.text.lock().clone()
    }

    /// Number of non-blank pending rows
    pub fn len(&self) -> usize {
        self.text.lock().lines().filter(|line| !line.trim().is_empty()).count()
    }
}

impl Default for TrainingData {
    fn default() -> Self {
        Self::new()
    }
}

impl Timestamped for TrainingData {
    fn timestamp(&self) -> SystemTime {
        self.timestamp.load()
    }
}

impl DataStorage for TrainingData {
    fn load_data(&self, schema: &Arc<Schema>, format: &TextFormat) -> Result<DataFrame, ModelError> {
        let text = self.text.lock().clone();
        format.rows_only().parse(&text, schema)
    }

    fn save_data(&self, data: &DataFrame, format: &TextFormat) -> Result<(), ModelError> {
        let rendered = format.rows_only().write(data)?;
        *self.text.lock() = rendered;
        self.timestamp.store(SystemTime::now());
        Ok(())
    }

    fn text_rows(&self) -> Result<Vec<String>, ModelError> {
        Ok(self.text.lock().lines().map(str::to_string).collect())
    }
}
