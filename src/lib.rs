//! An online, incremental, content-addressed backup engine.
//!
//! A device watches one or more filesystem roots and uploads consistent
//! snapshots to a remote object store over HTTPS. Objects are named by the
//! SHA-256 of their contents, so unchanged file data and unchanged directory
//! subtrees are never re-sent. See the [`walk`] module for the engine core.

pub mod cache;
pub mod cdp;
pub mod client;
pub mod config;
pub mod counters;
pub mod error;
pub mod filter;
pub mod hashing;
pub mod manager;
pub mod object;
pub mod progress;
pub mod store;
pub mod walk;
pub mod watch;
