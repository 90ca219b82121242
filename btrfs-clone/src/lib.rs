//! btrfs-clone library
//!
//! One-way replication of read-only btrfs snapshots to another volume with
//! `btrfs send | pv | btrfs receive`, keeping parent/child lineage so later
//! runs only send deltas.

pub mod btrfs;
pub mod cleaner;
pub mod command;
pub mod config;
pub mod driver;
pub mod inventory;
pub mod misc_sync;
pub mod prompt;
pub mod reconcile;
pub mod shutdown;
pub mod stats;
pub mod transfer;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, RunOptions};
pub use driver::{Driver, RunSummary};
pub use utils::errors::CloneError;
pub type Result<T> = std::result::Result<T, CloneError>;
