//! Remote object access for the tempo version index.
//!
//! The index never talks to a destination directly. It consumes a listing
//! ([`StorageBackend::list_stream`]) and reads small objects such as reference
//! marker payloads ([`StorageBackend::read`]). Deleting objects is left to
//! whoever executes a retention plan.

pub mod backend;
pub mod error;
mod models;
mod path;

pub use crate::backend::StorageBackend;
pub use crate::models::{Hashes, RemoteEntry};
pub use crate::path::{to_key, validate as validate_path};
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
