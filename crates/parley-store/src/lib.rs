//! # parley-store
//!
//! Durable file registry for the Parley gateway.
//!
//! Uploaded content lives in a storage directory under names derived solely
//! from each file's generated id. Metadata is held in an in-memory index that
//! mirrors a single JSON snapshot on disk; the snapshot is rewritten
//! atomically on every registration and is treated as ground truth at startup.

pub mod models;
pub mod registry;

mod error;

pub use error::RegistryError;
pub use models::*;
pub use registry::FileRegistry;
