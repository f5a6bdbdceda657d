use serde::{Deserialize, Serialize};

use crate::traits::model::ModelError;

/// Column carrying the training target
pub const LABEL_COLUMN: &str = "Label";
/// Column added by the featurizer
pub const FEATURES_COLUMN: &str = "Features";
/// Regression output
pub const SCORE_COLUMN: &str = "Score";
/// Classification outputs
pub const PROBABILITIES_COLUMN: &str = "Probabilities";
pub const PREDICTED_LABEL_COLUMN: &str = "PredictedLabel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Number,
    Text,
    Boolean,
    Vector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    /// Class of each slot of a probability vector column
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes: Option<Vec<usize>>,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            classes: None,
        }
    }
}

/// Ordered set of named, typed columns
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Builder style append
    pub fn with(mut self, name: impl Into<String>, kind: ColumnKind) -> Self {
        self.columns.push(Column::new(name, kind));
        self
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Copy of this schema with `name` appended, or retyped when already present
    pub fn with_column(&self, name: &str, kind: ColumnKind) -> Schema {
        let mut schema = self.clone();
        match schema.index_of(name) {
            Some(index) => schema.columns[index].kind = kind,
            None => schema.columns.push(Column::new(name, kind)),
        }
        schema
    }

    /// Copy of this schema recording the slot classes of column `name`
    pub fn with_classes(&self, name: &str, classes: Vec<usize>) -> Result<Schema, ModelError> {
        let mut schema = self.clone();
        let index = schema
            .index_of(name)
            .ok_or_else(|| ModelError::Schema(format!("column '{}' not found", name)))?;
        schema.columns[index].classes = Some(classes);
        Ok(schema)
    }

    /// Both schemas must have identical column names and kinds, in order.
    pub fn check_consistent(&self, other: &Schema, context: &str) -> Result<(), ModelError> {
        if self.columns.len() != other.columns.len() {
            return Err(ModelError::Schema(format!(
                "{}: expected {} columns, got {}",
                context,
                self.columns.len(),
                other.columns.len()
            )));
        }
        for (left, right) in self.columns.iter().zip(other.columns.iter()) {
            if left.name != right.name || left.kind != right.kind {
                return Err(ModelError::Schema(format!(
                    "{}: column '{}' ({:?}) does not match '{}' ({:?})",
                    context, left.name, left.kind, right.name, right.kind
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::default()
            .with("Category", ColumnKind::Text)
            .with(LABEL_COLUMN, ColumnKind::Number)
    }

    #[test]
    fn test_lookup() {
        let schema = schema();
        assert_eq!(schema.len(), 2);
        assert_eq!(schema.index_of(LABEL_COLUMN), Some(1));
        assert_eq!(schema.column("Category").map(|c| c.kind), Some(ColumnKind::Text));
        assert!(schema.column("Other").is_none());
    }

    #[test]
    fn test_with_column_appends_or_retypes() {
        let schema = schema().with_column(SCORE_COLUMN, ColumnKind::Number);
        assert_eq!(schema.len(), 3);
        let retyped = schema.with_column("Category", ColumnKind::Number);
        assert_eq!(retyped.len(), 3);
        assert_eq!(retyped.column("Category").map(|c| c.kind), Some(ColumnKind::Number));
    }

    #[test]
    fn test_slot_classes() {
        let schema = schema().with_classes(LABEL_COLUMN, vec![3, 7]).unwrap();
        assert_eq!(schema.column(LABEL_COLUMN).and_then(|c| c.classes.clone()), Some(vec![3, 7]));
        assert!(schema.column("Category").is_some_and(|c| c.classes.is_none()));
        assert!(matches!(schema.with_classes("Other", vec![0]), Err(ModelError::Schema(_))));
    }

    #[test]
    fn test_consistency() {
        assert!(schema().check_consistent(&schema(), "merge").is_ok());
        let other = Schema::default().with("Category", ColumnKind::Text);
        assert!(matches!(
            schema().check_consistent(&other, "merge"),
            Err(ModelError::Schema(_))
        ));
        let renamed = Schema::default()
            .with("Kind", ColumnKind::Text)
            .with(LABEL_COLUMN, ColumnKind::Number);
        let err = schema().check_consistent(&renamed, "merge").unwrap_err();
        assert!(err.to_string().contains("Category"));
    }
}
