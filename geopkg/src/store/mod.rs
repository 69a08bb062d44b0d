//! SQLite plumbing: connections, spatial SQL functions, metadata tables and
//! the resource tracker.

mod connection;
mod functions;
pub(crate) mod metadata;
mod resources;

pub(crate) use connection::{
    open_primary, open_read_only, open_staging, page_size, remove_staging, staging_path,
};
pub use resources::{ResourceSnapshot, ResourceTracker, SecondaryConnection};
