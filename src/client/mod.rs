//! Snapshot sources.
//!
//! - [`rest`] - HTTP depth-snapshot client, usable as a [`crate::orderbook::BookSync`]

pub mod rest;

pub use rest::{DepthSnapshot, RestSnapshotClient};
