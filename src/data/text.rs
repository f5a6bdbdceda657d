use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::data::frame::DataFrame;
use crate::data::schema::Schema;
use crate::data::value::DataValue;
use crate::traits::model::ModelError;

/// Text loader options shared by the text storages and the prediction input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextFormat {
    /// Column separator
    pub separator: char,
    /// Whether the first line is a header
    pub has_header: bool,
    /// Whether fields may be wrapped in double quotes
    pub allow_quoting: bool,
    /// Trim whitespace around fields
    pub trim_whitespace: bool,
}

impl Default for TextFormat {
    fn default() -> Self {
        Self {
            separator: ',',
            has_header: false,
            allow_quoting: true,
            trim_whitespace: true,
        }
    }
}

impl TextFormat {
    /// Tab separated, no quoting
    pub fn tsv() -> Self {
        Self {
            separator: '\t',
            allow_quoting: false,
            ..Default::default()
        }
    }

    /// The same options without a header line. Pending training rows and
    /// prediction input are always bare rows.
    pub fn rows_only(&self) -> TextFormat {
        TextFormat {
            has_header: false,
            ..self.clone()
        }
    }

    fn delimiter(&self) -> Result<u8, ModelError> {
        u8::try_from(self.separator)
            .map_err(|_| ModelError::InvalidParameter(format!("separator {:?} is not a single byte", self.separator)))
    }

    /// Parse text rows against `schema`. Short rows are padded with `Missing`,
    /// blank lines are skipped.
    pub fn parse(&self, text: &str, schema: &Arc<Schema>) -> Result<DataFrame, ModelError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter()?)
            .has_headers(self.has_header)
            .quoting(self.allow_quoting)
            .flexible(true)
            .trim(if self.trim_whitespace { csv::Trim::All } else { csv::Trim::None })
            .from_reader(text.as_bytes());

        let mut frame = DataFrame::new(Arc::clone(schema));
        for record in reader.records() {
            let record = record?;
            if record.len() > schema.len() {
                return Err(ModelError::Schema(format!(
                    "row has {} fields but the schema has {} columns",
                    record.len(),
                    schema.len()
                )));
            }
            let mut row = Vec::with_capacity(schema.len());
            for (index, column) in schema.columns().iter().enumerate() {
                let value = match record.get(index) {
                    Some(field) => DataValue::parse(field, column.kind).map_err(|err| match err {
                        ModelError::Schema(msg) => ModelError::Schema(format!("column '{}': {}", column.name, msg)),
                        other => other,
                    })?,
                    None => DataValue::Missing,
                };
                row.push(value);
            }
            frame.push_row(row)?;
        }
        Ok(frame)
    }

    /// Render a frame as text rows (plus header when configured)
    pub fn write(&self, frame: &DataFrame) -> Result<String, ModelError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter()?)
            .has_headers(false)
            .quote_style(if self.allow_quoting {
                csv::QuoteStyle::Necessary
            } else {
                csv::QuoteStyle::Never
            })
            .from_writer(Vec::new());

        if self.has_header {
            writer.write_record(frame.schema().columns().iter().map(|c| c.name.as_str()))?;
        }
        for row in frame.rows() {
            writer.write_record(row.iter().map(|value| value.render()))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| ModelError::Storage(err.to_string()))?;
        String::from_utf8(bytes).map_err(|err| ModelError::Serialization(err.to_string()))
    }

    /// Join raw field values into one text row. Fields are quoted when
    /// quoting is allowed, unless the caller already quoted them.
    pub fn format_row<S: AsRef<str>>(&self, values: &[S]) -> String {
        let quote = if self.allow_quoting { "\"" } else { "" };
        let mut line = String::new();
        for (index, value) in values.iter().enumerate() {
            if index > 0 {
                line.push(self.separator);
            }
            let text = value.as_ref();
            let trimmed = text.trim();
            let already_quoted = !quote.is_empty() && trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote);
            let quoting = if already_quoted { "" } else { quote };
            line.push_str(quoting);
            line.push_str(text);
            line.push_str(quoting);
        }
        line
    }
}
