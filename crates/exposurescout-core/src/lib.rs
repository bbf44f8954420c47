//! exposurescout-core - host state integrity auditing.
//!
//! Provides:
//! - `codec` - varint and length-prefixed binary primitives
//! - `digest` - 128-bit BLAKE3 digests of file content and metadata
//! - `collector` - filesystem and identity collectors, tree and flat diffs
//! - `report` - diff reports, their file format and filters
//! - `storage` - snapshot files and the SQLite store
//! - `manager` - snapshot runs, diffs and persistence in one place
//!
//! With `json` feature:
//! - `DiffReport::to_json` - pretty JSON rendering of a report

pub mod codec;
pub mod collectible;
pub mod collector;
pub mod digest;
pub mod manager;
pub mod report;
pub mod storage;

pub use collectible::Collectible;
pub use manager::{AnalysisManager, ManagerConfig, ManagerError};
pub use report::DiffReport;
