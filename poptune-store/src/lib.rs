//! # poptune-store — filesystem persistence for poptune checkpoints
//!
//! [`FileCheckpointStore`] implements [`poptune_core::CheckpointStore`] with one
//! directory per trial, a JSON manifest, and SHA-256 verified blobs.

pub mod fs_store;
pub mod persistence;

pub use fs_store::{FileCheckpointStore, ManifestEntry};
