//! Output generation.
//!
//! # Submodules
//!
//! - [`json`]: URL-list interchange files and the per-URL record sink

pub mod json;
