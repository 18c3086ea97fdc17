//! Extraction engine for player statistics pages.
//!
//! Extraction is a pure function of the page markup: no I/O and no state
//! carried between pages, so it can run anywhere the caller likes.
//!
//! # Submodules
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`columns`] | Header-label → column-index map and cell parsing |
//! | [`player`] | Profile fields, role resolution, season rows and totals |

pub mod columns;
pub mod player;

pub use player::{extract_player_profile, extract_player_statistics};
