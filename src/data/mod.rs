pub mod frame;
pub mod schema;
pub mod text;
pub mod value;
