//! Per-dispatch state shared by every interceptor of one chain traversal.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

/// Lives for exactly one Send, Handle or Notify call.
///
/// Interceptors that need a per-dispatch object (a unit of work, a
/// stopwatch...) fetch it with [`DispatchScope::get_or_insert_with`]; every
/// participant of the same traversal sees the same instance.
pub struct DispatchScope {
    id: Uuid,
    started: Instant,
    instances: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl DispatchScope {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started: Instant::now(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The scope's instance of `T`, created by `create` on first use.
    pub fn get_or_insert_with<T, F>(&self, create: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut instances = self.instances.lock();
        if let Some(existing) = instances
            .get(&TypeId::of::<T>())
            .and_then(|instance| instance.clone().downcast::<T>().ok())
        {
            return existing;
        }

        let instance = Arc::new(create());
        instances.insert(TypeId::of::<T>(), instance.clone());
        instance
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let instance = self.instances.lock().get(&TypeId::of::<T>())?.clone();
        instance.downcast::<T>().ok()
    }
}

impl Default for DispatchScope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DispatchScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchScope")
            .field("id", &self.id)
            .field("elapsed", &self.elapsed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct UnitOfWork {
        writes: AtomicUsize,
    }

    #[test]
    fn same_instance_within_a_scope() {
        let scope = DispatchScope::new();
        scope
            .get_or_insert_with(UnitOfWork::default)
            .writes
            .fetch_add(1, Ordering::SeqCst);
        let again = scope.get_or_insert_with(UnitOfWork::default);
        assert_eq!(again.writes.load(Ordering::SeqCst), 1);

        let other = DispatchScope::new();
        assert!(other.get::<UnitOfWork>().is_none());
    }
}
