//! Explicit set of collector types available to a manager.

use super::{Collector, CollectorKind, FileSystemCollector, IdentityCollector};

type Factory = Box<dyn Fn() -> Box<dyn Collector> + Send + Sync>;

/// Ordered collector types with a factory for empty instances.
///
/// Order decides the order of diff sections and snapshot blocks.
pub struct CollectorRegistry {
    entries: Vec<(CollectorKind, Factory)>,
}

impl CollectorRegistry {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers `kind`, replacing an earlier factory for it.
    pub fn register<F>(&mut self, kind: CollectorKind, factory: F)
    where
        F: Fn() -> Box<dyn Collector> + Send + Sync + 'static,
    {
        match self.entries.iter_mut().find(|(k, _)| *k == kind) {
            Some(entry) => entry.1 = Box::new(factory),
            None => self.entries.push((kind, Box::new(factory))),
        }
    }

    pub fn kinds(&self) -> impl Iterator<Item = CollectorKind> + '_ {
        self.entries.iter().map(|(k, _)| *k)
    }

    pub fn contains(&self, kind: CollectorKind) -> bool {
        self.entries.iter().any(|(k, _)| *k == kind)
    }

    /// Fresh idle collector of `kind`, ready for `import_bin`/`import_db`.
    pub fn create(&self, kind: CollectorKind) -> Option<Box<dyn Collector>> {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, factory)| factory())
    }
}

impl Default for CollectorRegistry {
    /// Both built-in collectors, identity first.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(CollectorKind::Users, || Box::new(IdentityCollector::new()));
        registry.register(CollectorKind::FileSystem, || Box::new(FileSystemCollector::new()));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorState;

    #[test]
    fn test_default_registry() {
        let registry = CollectorRegistry::default();
        assert_eq!(
            registry.kinds().collect::<Vec<_>>(),
            vec![CollectorKind::Users, CollectorKind::FileSystem]
        );
        let collector = registry.create(CollectorKind::FileSystem).unwrap();
        assert_eq!(collector.kind(), CollectorKind::FileSystem);
        assert_eq!(collector.state(), CollectorState::Idle);
    }

    #[test]
    fn test_register_replaces_and_empty() {
        let mut registry = CollectorRegistry::empty();
        assert!(registry.create(CollectorKind::Users).is_none());

        registry.register(CollectorKind::Users, || Box::new(IdentityCollector::new()));
        registry.register(CollectorKind::Users, || Box::new(IdentityCollector::new()));
        assert_eq!(registry.kinds().count(), 1);
        assert!(registry.contains(CollectorKind::Users));
        assert!(!registry.contains(CollectorKind::FileSystem));
    }
}
