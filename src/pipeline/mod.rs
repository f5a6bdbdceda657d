pub mod featurizer;
pub mod learner;
pub mod pipes;
