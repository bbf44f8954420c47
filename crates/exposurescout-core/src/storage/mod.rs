//! Persistence: snapshot files and the SQLite relational store.

pub mod db;
pub mod snapshot_file;

pub use db::Database;
pub use snapshot_file::{decode_blocks, encode_snapshot, write_atomic};
