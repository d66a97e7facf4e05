//! Persisto - tiered-storage service for embedded SQL databases
//!
//! Manages many independent SQLite databases across a hierarchy of storage
//! stages (volatile memory, local disk, S3-compatible remote storage) and
//! transparently migrates each database between stages based on access
//! patterns. Hot databases move closer to the client; cold ones drain
//! toward durable remote storage.

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod object_store;
pub mod observability;
pub mod registry;
pub mod server;
pub mod stages;
pub mod utils;
pub mod vfs;

// Re-export main types for convenience
pub use config::Config;
pub use context::ServiceContext;
pub use registry::{Database, Registry};
