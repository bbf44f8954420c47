//! Mock filesystem implementations for testing.
//!
//! This module provides `MockFs` and pre-built host scenarios for testing
//! collectors without touching the real machine.

mod filesystem;
mod scenarios;

pub use filesystem::MockFs;
pub use scenarios::{GROUP, PASSWD, SUDOERS};
