use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;

type Factory<T> = Box<dyn Fn(&str) -> T + Send + Sync>;

/// A registry of independent limiters or breakers, one per key.
///
/// Typically keyed by endpoint or method name. Each entry is built lazily by the
/// factory on first access and never shares state with other entries.
///
/// ```rust
/// use shed_limit::{CircuitBreaker, Group, SreBreaker, SreOptions};
///
/// let breakers = Group::new(|_key| SreBreaker::new(SreOptions::default()));
///
/// let breaker = breakers.get("/helloworld.Greeter/SayHello");
/// if breaker.allow().is_ok() {
///     breaker.mark_success();
/// }
/// ```
pub struct Group<T> {
    entries: RwLock<HashMap<String, Arc<T>>>,
    factory: Factory<T>,
}

impl<T> Debug for Group<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("keys", &self.keys())
            .finish_non_exhaustive()
    }
}

impl<T> Group<T> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&str) -> T + Send + Sync + 'static,
    {
        Self {
            entries: RwLock::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    /// Returns the entry for `key`, building it if this is the first access.
    ///
    /// Concurrent first accesses to the same key construct the entry exactly once.
    pub fn get(&self, key: &str) -> Arc<T> {
        if let Some(entry) = self.entries.read().get(key) {
            return Arc::clone(entry);
        }

        let mut entries = self.entries.write();
        // Another caller may have won the race for the write lock
        if let Some(entry) = entries.get(key) {
            return Arc::clone(entry);
        }
        let entry = Arc::new((self.factory)(key));
        entries.insert(key.to_string(), Arc::clone(&entry));
        entry
    }

    /// Forget the entry for `key`. Outstanding handles keep working.
    pub fn remove(&self, key: &str) -> Option<Arc<T>> {
        self.entries.write().remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
