pub mod evaluator;
pub mod metrics;
pub mod policy;
