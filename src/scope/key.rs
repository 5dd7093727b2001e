use std::{
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    sync::atomic::{AtomicU64, Ordering},
};

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// Typed key for values carried by a cancellation scope.
///
/// Every call to [`Key::new`] yields a distinct key, even for the same name,
/// and a value stored under a `Key<T>` can only ever be read back as `T`.
pub struct Key<T> {
    id: u64,
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub fn new(name: &'static str) -> Self {
        Key {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Key<T> {}

impl<T> Hash for Key<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}
