pub mod build;
pub mod cache;
pub mod common;
pub mod patch;
pub mod tools;
pub mod validate;
