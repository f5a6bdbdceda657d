use ndarray::Array1;

#[derive(Clone, Debug, PartialEq)]
pub struct FeatureVector {
    values: Array1<f32>,
}

impl FeatureVector {
    // Create new feature vector
    pub fn new(values: Vec<f32>) -> Self {
        Self { values: Array1::from(values) }
    }

    pub fn zeros(dimension: usize) -> Self {
        Self { values: Array1::zeros(dimension) }
    }

    // number of features
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn as_array(&self) -> &Array1<f32> {
        &self.values
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.values.to_vec()
    }

    /// Squared euclidean distance; `None` when dimensions differ
    pub fn squared_distance(&self, other: &FeatureVector) -> Option<f32> {
        if self.dimension() != other.dimension() {
            return None;
        }
        let diff = &self.values - &other.values;
        Some(diff.dot(&diff))
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}
