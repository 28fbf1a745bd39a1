//! Cache Generation Store.
//!
//! Durable key/value storage partitioned into per-generation regions:
//!
//! - `precache:<generation>`: bootstrap assets fetched at install time
//! - `runtime:<generation>`: responses cached while serving requests
//!
//! Two backends implement [`CacheStore`]: [`MemoryStore`] and the durable
//! [`DiskStore`]. Which one is used is chosen in `sideline.toml`:
//!
//! ```toml
//! [storage]
//! backend = "disk"
//! directory = ".sideline-cache"
//! ```

mod disk;
mod keys;
pub(crate) mod lock;
mod store;

pub use disk::DiskStore;
pub use keys::{Generation, RegionKind, RegionName, RequestKey};
pub use store::{CacheStore, MemoryStore, Snapshot, StoreError};
