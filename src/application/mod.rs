//! Application layer: error reporting and the formula rendering core.

pub mod error;
pub mod render;
