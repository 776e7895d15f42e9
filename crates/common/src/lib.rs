//! Shared types and utilities for the dxfuse crates.
//!
//! This crate provides functionality used across the workspace:
//! - Constants (on-disk locations, pool sizes, transfer tuning)
//! - The shared error type with errno mapping
//! - Path helpers for the namespace tree
//! - The mount manifest model

pub mod constants;
pub mod error;
pub mod manifest;
pub mod path;

// Re-export commonly used items at crate root
pub use constants::*;
pub use error::{Error, Result};
pub use manifest::{Manifest, ManifestDirectory, ManifestFile};
pub use path::{join_path, split_path};
