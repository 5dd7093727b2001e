use std::{any::Any, error::Error, future::Future, time::Instant};

mod context;
mod key;
pub use context::*;
pub use key::*;

/// A cancellation scope: a deadline, a one-shot done signal, the reason it
/// finished and a typed key space of ambient values.
///
/// `err` is `None` until the future returned by `done` has resolved.
pub trait CancellationScope {
    type Error: Error + Clone;
    type Done: Future<Output = ()>;

    /// When the scope will finish on its own, if ever.
    fn deadline(&self) -> Option<Instant>;

    /// Resolves once the scope is canceled or its deadline passes.
    fn done(&self) -> Self::Done;

    fn err(&self) -> Option<Self::Error>;

    /// Look up the value stored under `key` by this scope or an ancestor.
    fn value<T>(&self, key: &Key<T>) -> Option<&T>
    where
        T: Any + Send + Sync;
}
