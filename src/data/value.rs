use serde::{Deserialize, Serialize};

use crate::data::schema::ColumnKind;
use crate::traits::model::ModelError;

/// A single cell of a [`DataFrame`](crate::data::frame::DataFrame).
///
/// Column getters dispatch over this closed set of variants instead of
/// resolving a typed getter per column at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    Missing,
    Number(f32),
    Text(String),
    Boolean(bool),
    Vector(Vec<f32>),
}

impl DataValue {
    /// Parse a text field into the value kind expected by a column.
    /// Empty fields become `Missing`.
    pub fn parse(field: &str, kind: ColumnKind) -> Result<Self, ModelError> {
        let field = field.trim();
        if field.is_empty() {
            return Ok(DataValue::Missing);
        }
        match kind {
            ColumnKind::Number => field
                .parse::<f32>()
                .map(DataValue::Number)
                .map_err(|_| ModelError::Schema(format!("'{}' is not a number", field))),
            ColumnKind::Text => Ok(DataValue::Text(field.to_string())),
            ColumnKind::Boolean => match field.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(DataValue::Boolean(true)),
                "false" | "0" | "no" => Ok(DataValue::Boolean(false)),
                _ => Err(ModelError::Schema(format!("'{}' is not a boolean", field))),
            },
            ColumnKind::Vector => field
                .split_whitespace()
                .map(|item| {
                    item.parse::<f32>()
                        .map_err(|_| ModelError::Schema(format!("'{}' is not a number", item)))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(DataValue::Vector),
        }
    }

    /// Text rendering used by the text storages; inverse of [`DataValue::parse`].
    pub fn render(&self) -> String {
        match self {
            DataValue::Missing => String::new(),
            DataValue::Number(value) => value.to_string(),
            DataValue::Text(text) => text.clone(),
            DataValue::Boolean(flag) => flag.to_string(),
            DataValue::Vector(values) => values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Numeric view: numbers as-is, booleans as 0/1.
    pub fn as_number(&self) -> Option<f32> {
        match self {
            DataValue::Number(value) => Some(*value),
            DataValue::Boolean(flag) => Some(if *flag { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            DataValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            DataValue::Vector(values) => Some(values),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, DataValue::Missing)
    }

    /// Whether this value may be stored in a column of `kind`
    pub fn fits(&self, kind: ColumnKind) -> bool {
        matches!(
            (self, kind),
            (DataValue::Missing, _)
                | (DataValue::Number(_), ColumnKind::Number)
                | (DataValue::Text(_), ColumnKind::Text)
                | (DataValue::Boolean(_), ColumnKind::Boolean)
                | (DataValue::Vector(_), ColumnKind::Vector)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_by_kind() {
        assert_eq!(DataValue::parse(" 2.5 ", ColumnKind::Number).unwrap(), DataValue::Number(2.5));
        assert_eq!(DataValue::parse("A", ColumnKind::Text).unwrap(), DataValue::Text("A".into()));
        assert_eq!(DataValue::parse("yes", ColumnKind::Boolean).unwrap(), DataValue::Boolean(true));
        assert_eq!(
            DataValue::parse("1 2 3", ColumnKind::Vector).unwrap(),
            DataValue::Vector(vec![1.0, 2.0, 3.0])
        );
        assert_eq!(DataValue::parse("", ColumnKind::Number).unwrap(), DataValue::Missing);
        assert!(matches!(
            DataValue::parse("abc", ColumnKind::Number),
            Err(ModelError::Schema(_))
        ));
    }

    #[test]
    fn test_render_and_accessors() {
        assert_eq!(DataValue::Vector(vec![0.5, 1.0]).render(), "0.5 1");
        assert_eq!(DataValue::Boolean(true).as_number(), Some(1.0));
        assert_eq!(DataValue::Text("x".into()).as_number(), None);
        assert!(DataValue::Missing.fits(ColumnKind::Vector));
        assert!(!DataValue::Number(1.0).fits(ColumnKind::Text));
    }
}
