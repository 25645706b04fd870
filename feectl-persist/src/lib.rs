#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Durable storage for the fee policy control plane.

/// A document store kept as one JSON file per document
pub mod file_store;

pub use file_store::FileStore;
