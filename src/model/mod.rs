//! Core data types shared across the index, history and session layers.

pub mod group;
pub mod place;

pub use group::{Bitmap, GroupFlags, GroupRecord, SubState};
pub use place::{ArtNo, GroupId, Place};
