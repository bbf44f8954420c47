//! Collectors gather one kind of host state per snapshot run.
//!
//! Every collector implements [`Collector`]; [`CollectorKind`] dispatches the
//! per-type operations (diff, report decoding, report tables) that do not
//! need an instance.

mod collector;
pub mod filesystem;
pub mod identity;
pub mod mock;
mod registry;
pub mod traits;

pub use collector::{CollectError, Collector, CollectorKind, CollectorState, DiffError};
pub use filesystem::FileSystemCollector;
pub use identity::IdentityCollector;
pub use mock::MockFs;
pub use registry::CollectorRegistry;
pub use traits::{EntryMetadata, EntryType, FileSystem, RealFs};
