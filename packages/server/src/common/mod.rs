// Common types and utilities shared across the application

pub mod field;
pub mod hash;

pub use field::Field;
pub use hash::url_key;
