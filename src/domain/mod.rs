//! Domain layer: formula input, request options, capability signatures and the error taxonomy.

pub mod capability;
pub mod error;
pub mod formula;
pub mod options;
