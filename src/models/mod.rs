pub mod centroid;
pub mod linears;
pub mod ridge;
