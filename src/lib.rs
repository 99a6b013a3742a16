//! mathgate: a formula rendering service.
//!
//! TeX, MathML and AsciiMath formulas are rendered to SVG, PNG or speech
//! text through a shared, non-reentrant engine, with artifact and response
//! caching in front of it.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
