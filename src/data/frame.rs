//! Row-oriented tabular data handle passed between storages, estimators and
//! transformers.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::data::schema::{ColumnKind, Schema};
use crate::data::value::DataValue;
use crate::traits::model::ModelError;

#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    schema: Arc<Schema>,
    rows: Vec<Vec<DataValue>>,
}

impl DataFrame {
    /// Empty frame with the given schema
    pub fn new(schema: Arc<Schema>) -> Self {
        Self { schema, rows: Vec::new() }
    }

    pub fn from_rows(schema: Arc<Schema>, rows: Vec<Vec<DataValue>>) -> Result<Self, ModelError> {
        let mut frame = Self::new(schema);
        for row in rows {
            frame.push_row(row)?;
        }
        Ok(frame)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn rows(&self) -> &[Vec<DataValue>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push_row(&mut self, row: Vec<DataValue>) -> Result<(), ModelError> {
        if row.len() != self.schema.len() {
            return Err(ModelError::DimensionMismatch {
                expected: self.schema.len(),
                actual: row.len(),
                context: "row width vs schema".to_string(),
            });
        }
        for (value, column) in row.iter().zip(self.schema.columns()) {
            if !value.fits(column.kind) {
                return Err(ModelError::Schema(format!(
                    "value {:?} does not fit column '{}' ({:?})",
                    value, column.name, column.kind
                )));
            }
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&DataValue> {
        let index = self.schema.index_of(column)?;
        self.rows.get(row).map(|r| &r[index])
    }

    /// All values of one column
    pub fn column(&self, name: &str) -> Result<Vec<&DataValue>, ModelError> {
        let index = self
            .schema
            .index_of(name)
            .ok_or_else(|| ModelError::Schema(format!("column '{}' not found", name)))?;
        Ok(self.rows.iter().map(|row| &row[index]).collect())
    }

    /// Numeric column; missing or non-numeric cells are an error
    pub fn numbers(&self, name: &str) -> Result<Vec<f32>, ModelError> {
        self.column(name)?
            .into_iter()
            .map(|value| {
                value.as_number().ok_or_else(|| {
                    ModelError::Validation(format!("column '{}' holds non-numeric value {:?}", name, value))
                })
            })
            .collect()
    }

    /// Vector column; missing or scalar cells are an error
    pub fn vectors(&self, name: &str) -> Result<Vec<Vec<f32>>, ModelError> {
        self.column(name)?
            .into_iter()
            .map(|value| {
                value.as_vector().map(|v| v.to_vec()).ok_or_else(|| {
                    ModelError::Validation(format!("column '{}' holds non-vector value {:?}", name, value))
                })
            })
            .collect()
    }

    /// Rows of `other` appended after the rows of `self`; schemas must match.
    pub fn merge(&self, other: &DataFrame) -> Result<DataFrame, ModelError> {
        self.schema
            .check_consistent(&other.schema, "Inconsistent schema: all merged data must have identical columns")?;
        let mut rows = self.rows.clone();
        rows.extend(other.rows.iter().cloned());
        Ok(DataFrame { schema: Arc::clone(&self.schema), rows })
    }

    /// Row-shuffled copy; the same seed always yields the same order
    pub fn shuffle(&self, seed: u64) -> DataFrame {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut rows = self.rows.clone();
        rows.shuffle(&mut rng);
        DataFrame { schema: Arc::clone(&self.schema), rows }
    }

    /// `(train, test)` pairs for k-fold cross-validation over a seeded shuffle.
    pub fn folds(&self, k: usize, seed: u64) -> Result<Vec<(DataFrame, DataFrame)>, ModelError> {
        if k < 2 {
            return Err(ModelError::InvalidParameter(format!("number of folds must be at least 2, got {}", k)));
        }
        if self.rows.len() < k {
            return Err(ModelError::InvalidParameter(format!(
                "cannot split {} rows into {} folds",
                self.rows.len(),
                k
            )));
        }
        let shuffled = self.shuffle(seed);
        let mut folds = Vec::with_capacity(k);
        for fold in 0..k {
            let mut train = DataFrame::new(Arc::clone(&self.schema));
            let mut test = DataFrame::new(Arc::clone(&self.schema));
            for (index, row) in shuffled.rows.iter().enumerate() {
                if index % k == fold {
                    test.rows.push(row.clone());
                } else {
                    train.rows.push(row.clone());
                }
            }
            folds.push((train, test));
        }
        Ok(folds)
    }

    /// View with only the rows for which `predicate(position, row)` holds
    pub fn filter<F>(&self, predicate: F) -> DataFrame
    where
        F: Fn(usize, &[DataValue]) -> bool,
    {
        let rows = self
            .rows
            .iter()
            .enumerate()
            .filter(|(index, row)| predicate(*index, row))
            .map(|(_, row)| row.clone())
            .collect();
        DataFrame { schema: Arc::clone(&self.schema), rows }
    }

    /// Same rows, with the slot classes of column `name` recorded
    pub fn with_classes(&self, name: &str, classes: Vec<usize>) -> Result<DataFrame, ModelError> {
        Ok(DataFrame {
            schema: Arc::new(self.schema.with_classes(name, classes)?),
            rows: self.rows.clone(),
        })
    }

    pub fn first_row(&self) -> DataFrame {
        self.filter(|position, _| position == 0)
    }

    /// Copy with a column appended (or replaced when the name exists)
    pub fn with_column(&self, name: &str, kind: ColumnKind, values: Vec<DataValue>) -> Result<DataFrame, ModelError> {
        if values.len() != self.rows.len() {
            return Err(ModelError::DimensionMismatch {
                expected: self.rows.len(),
                actual: values.len(),
                context: format!("values for column '{}'", name),
            });
        }
        let schema = Arc::new(self.schema.with_column(name, kind));
        let existing = self.schema.index_of(name);
        let mut frame = DataFrame::new(schema);
        for (row, value) in self.rows.iter().zip(values) {
            let mut row = row.clone();
            match existing {
                Some(index) => row[index] = value,
                None => row.push(value),
            }
            frame.push_row(row)?;
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::schema::LABEL_COLUMN;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::default()
                .with("Category", ColumnKind::Text)
                .with(LABEL_COLUMN, ColumnKind::Number),
        )
    }

    fn frame(n: usize) -> DataFrame {
        let rows = (0..n)
            .map(|i| vec![DataValue::Text(format!("c{}", i)), DataValue::Number(i as f32)])
            .collect();
        DataFrame::from_rows(schema(), rows).unwrap()
    }

    #[test]
    fn test_push_row_validates_width_and_kind() {
        let mut frame = DataFrame::new(schema());
        assert!(matches!(
            frame.push_row(vec![DataValue::Missing]),
            Err(ModelError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            frame.push_row(vec![DataValue::Number(1.0), DataValue::Number(1.0)]),
            Err(ModelError::Schema(_))
        ));
        frame.push_row(vec![DataValue::Text("A".into()), DataValue::Missing]).unwrap();
        assert_eq!(frame.len(), 1);
    }

    #[test]
    fn test_merge() {
        let merged = frame(2).merge(&frame(3)).unwrap();
        assert_eq!(merged.len(), 5);
        assert_eq!(merged.numbers(LABEL_COLUMN).unwrap(), vec![0.0, 1.0, 0.0, 1.0, 2.0]);

        let other = DataFrame::new(Arc::new(Schema::default().with("X", ColumnKind::Number)));
        assert!(matches!(frame(1).merge(&other), Err(ModelError::Schema(_))));
    }

    #[test]
    fn test_shuffle_is_seeded_permutation() {
        let data = frame(20);
        let a = data.shuffle(7);
        let b = data.shuffle(7);
        assert_eq!(a, b);
        let mut labels = a.numbers(LABEL_COLUMN).unwrap();
        labels.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert_eq!(labels, data.numbers(LABEL_COLUMN).unwrap());
        assert_ne!(data.shuffle(1).rows(), data.shuffle(2).rows());
    }

    #[test]
    fn test_folds_partition_rows() {
        let folds = frame(10).folds(5, 3).unwrap();
        assert_eq!(folds.len(), 5);
        for (train, test) in &folds {
            assert_eq!(train.len(), 8);
            assert_eq!(test.len(), 2);
        }
        assert!(frame(3).folds(5, 0).is_err());
        assert!(frame(3).folds(1, 0).is_err());
    }

    #[test]
    fn test_filter_returns_matching_rows() {
        let data = frame(5);
        let odd = data.filter(|_, row| row[1].as_number().map(|v| v as i32 % 2 == 1).unwrap_or(false));
        assert_eq!(odd.numbers(LABEL_COLUMN).unwrap(), vec![1.0, 3.0]);
        let first = data.first_row();
        assert_eq!(first.len(), 1);
        assert_eq!(first.value(0, "Category"), Some(&DataValue::Text("c0".into())));
    }

    #[test]
    fn test_with_column() {
        let data = frame(2);
        let scored = data
            .with_column("Score", ColumnKind::Number, vec![DataValue::Number(0.5), DataValue::Number(1.5)])
            .unwrap();
        assert_eq!(scored.schema().len(), 3);
        assert_eq!(scored.numbers("Score").unwrap(), vec![0.5, 1.5]);

        let replaced = scored
            .with_column("Score", ColumnKind::Number, vec![DataValue::Number(9.0), DataValue::Number(9.0)])
            .unwrap();
        assert_eq!(replaced.schema().len(), 3);
        assert!(data.with_column("Score", ColumnKind::Number, vec![]).is_err());
    }
}
