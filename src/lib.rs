//! `newspool`: a netnews message store and reader core.
//!
//! This crate provides the storage and traversal layers a news reader or
//! posting agent builds on: the active index of newsgroups, the
//! message-ID history database, per-user read state with range-list
//! encoding, the article spool, and a session engine with trail
//! logging, backtracking and thread following.

pub mod active;
pub mod bitmap;
pub mod config;
pub mod error;
pub mod history;
pub mod model;
pub mod newsrc;
pub mod pattern;
pub mod session;
pub mod spool;
