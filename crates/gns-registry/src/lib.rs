//! Type-indexed service registry.
//!
//! Handlers obtain every collaborator through this registry; no component
//! reaches for process globals. Three lifetimes:
//!
//! - **singleton** — factory runs at most once, result is memoised
//! - **transient** — factory runs on every lookup
//! - **instance** — a pre-constructed value registered directly
//!
//! Registration requires `&mut self`; wrapping the registry in `Arc` at
//! lifespan start makes the registration set immutable from then on. Looking
//! up an unregistered interface panics: a missing registration is a
//! programming bug, not a runtime condition.

#![forbid(unsafe_code)]

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

type Service = Arc<dyn Any + Send + Sync>;
type Factory = Box<dyn Fn() -> Service + Send + Sync>;

enum Entry {
    Singleton {
        factory: Factory,
        // OnceLock gives double-checked creation and lock-free reads
        // once the value is published.
        cell: OnceLock<Service>,
    },
    Transient(Factory),
    Instance(Service),
}

#[derive(Default)]
pub struct ServiceRegistry {
    entries: HashMap<TypeId, Entry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a lazily-created, memoised service.
    pub fn register_singleton<T, F>(&mut self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        debug!(service = type_name::<T>(), "registered singleton");
        self.entries.insert(
            TypeId::of::<T>(),
            Entry::Singleton {
                factory: Box::new(move || Arc::new(factory())),
                cell: OnceLock::new(),
            },
        );
    }

    /// Register a service constructed fresh on every lookup.
    pub fn register_transient<T, F>(&mut self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        debug!(service = type_name::<T>(), "registered transient");
        self.entries.insert(
            TypeId::of::<T>(),
            Entry::Transient(Box::new(move || Arc::new(factory()))),
        );
    }

    /// Register a pre-constructed value.
    pub fn register_instance<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        debug!(service = type_name::<T>(), "registered instance");
        self.entries
            .insert(TypeId::of::<T>(), Entry::Instance(Arc::new(value)));
    }

    /// Resolve a service.
    ///
    /// # Panics
    ///
    /// Panics if `T` was never registered. Callers must wire every interface
    /// at startup; hitting this in production is a bug in the composition
    /// root, not a recoverable error.
    pub fn get<T: Send + Sync + 'static>(&self) -> Arc<T> {
        self.try_get::<T>().unwrap_or_else(|| {
            panic!(
                "service not registered: {} (registered interfaces: {})",
                type_name::<T>(),
                self.entries.len()
            )
        })
    }

    /// Resolve a service, returning `None` when unregistered.
    pub fn try_get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let entry = self.entries.get(&TypeId::of::<T>())?;
        let service = match entry {
            Entry::Singleton { factory, cell } => cell.get_or_init(|| factory()).clone(),
            Entry::Transient(factory) => factory(),
            Entry::Instance(value) => value.clone(),
        };
        // The entry was stored under TypeId::of::<T>, so the downcast
        // cannot fail.
        service.downcast::<T>().ok()
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        value: usize,
    }

    #[test]
    fn test_instance_returns_registered_value() {
        let mut registry = ServiceRegistry::new();
        registry.register_instance(Counter { value: 7 });
        let c = registry.get::<Counter>();
        assert_eq!(c.value, 7);
    }

    #[test]
    fn test_singleton_identity_across_callers() {
        let mut registry = ServiceRegistry::new();
        registry.register_singleton(|| Counter { value: 1 });
        let a = registry.get::<Counter>();
        let b = registry.get::<Counter>();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_singleton_factory_runs_once_under_contention() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let mut registry = ServiceRegistry::new();
        registry.register_singleton(|| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Counter { value: 42 }
        });
        let registry = Arc::new(registry);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = registry.clone();
                std::thread::spawn(move || r.get::<Counter>().value)
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().expect("join"), 42);
        }
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transient_is_fresh_each_lookup() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let mut registry = ServiceRegistry::new();
        registry.register_transient(|| Counter {
            value: CALLS.fetch_add(1, Ordering::SeqCst),
        });
        let a = registry.get::<Counter>();
        let b = registry.get::<Counter>();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_ne!(a.value, b.value);
    }

    #[test]
    #[should_panic(expected = "service not registered")]
    fn test_missing_registration_is_fatal() {
        let registry = ServiceRegistry::new();
        let _ = registry.get::<Counter>();
    }

    #[test]
    fn test_try_get_missing_is_none() {
        let registry = ServiceRegistry::new();
        assert!(registry.try_get::<Counter>().is_none());
        assert!(!registry.contains::<Counter>());
    }

    #[test]
    fn test_reregistration_before_freeze_replaces() {
        let mut registry = ServiceRegistry::new();
        registry.register_instance(Counter { value: 1 });
        registry.register_instance(Counter { value: 2 });
        assert_eq!(registry.get::<Counter>().value, 2);
        assert_eq!(registry.len(), 1);
    }
}
