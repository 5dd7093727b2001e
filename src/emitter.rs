use std::{
    any::Any,
    error::Error as StdError,
    fmt,
    sync::Arc,
    time::{Instant, SystemTime},
};

use crate::{CancellationScope, EmitError, Key, OverrideError};

/// The operations a stream runtime drives on a subscription: everything a
/// [`CancellationScope`] offers, plus recording the subscription and
/// overriding the reported error.
pub trait Emit: CancellationScope {
    /// Record the current wall-clock time as the start of the subscription.
    /// A later call overwrites the earlier time.
    fn subscribe(&mut self);

    /// When [`subscribe`](Emit::subscribe) was last called, or `None` if it
    /// never was.
    fn subscribe_at(&self) -> Option<SystemTime>;

    /// Report `error` from [`err`](CancellationScope::err) from now on,
    /// instead of the scope's own error. The override can be replaced by a
    /// later call but never cleared.
    fn set_shared_error(&mut self, error: OverrideError);
}

/// One subscription's view of an upstream cancellation scope.
///
/// The emitter borrows its scope and forwards `deadline`, `done` and `value`
/// to it unchanged. It adds two things: an override error that, once set,
/// shadows whatever the scope reports from `err`, and the wall-clock time at
/// which [`subscribe`](Emit::subscribe) was last called.
///
/// An emitter is itself a [`CancellationScope`], so it can be handed to
/// anything that expects one, including another emitter.
pub struct Emitter<'a, S>
where
    S: CancellationScope,
{
    scope: &'a S,
    override_error: Option<OverrideError>,
    subscription_time: Option<SystemTime>,
}

impl<'a, S> Emitter<'a, S>
where
    S: CancellationScope,
{
    pub fn new(scope: &'a S) -> Self {
        Emitter {
            scope,
            override_error: None,
            subscription_time: None,
        }
    }

    /// The scope this emitter observes.
    pub fn scope(&self) -> &'a S {
        self.scope
    }

    /// Shorthand for [`Emit::set_shared_error`] with an owned error.
    pub fn set_error<E>(&mut self, error: E)
    where
        E: StdError + Send + Sync + 'static,
    {
        self.set_shared_error(Arc::new(error));
    }

}

impl<'a, S> Emit for Emitter<'a, S>
where
    S: CancellationScope,
{
    fn subscribe(&mut self) {
        let now = SystemTime::now();

        if self.subscription_time.is_some() {
            log::debug!("emitter subscribed again, overwriting subscription time");
        }

        self.subscription_time = Some(now);
    }

    fn subscribe_at(&self) -> Option<SystemTime> {
        self.subscription_time
    }

    fn set_shared_error(&mut self, error: OverrideError) {
        log::debug!("emitter error overridden: {}", error);

        self.override_error = Some(error);
    }
}

impl<'a, S> CancellationScope for Emitter<'a, S>
where
    S: CancellationScope,
{
    type Error = EmitError<S::Error>;
    type Done = S::Done;

    fn deadline(&self) -> Option<Instant> {
        self.scope.deadline()
    }

    fn done(&self) -> S::Done {
        self.scope.done()
    }

    /// The override error if one was set, otherwise the scope's error.
    ///
    /// Only meaningful once [`done`](CancellationScope::done) has resolved.
    fn err(&self) -> Option<Self::Error> {
        match &self.override_error {
            Some(error) => Some(EmitError::Override(error.clone())),
            None => self.scope.err().map(EmitError::Scope),
        }
    }

    fn value<T>(&self, key: &Key<T>) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        self.scope.value(key)
    }
}

impl<'a, S> fmt::Debug for Emitter<'a, S>
where
    S: CancellationScope,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("overridden", &self.override_error.is_some())
            .field("subscription_time", &self.subscription_time)
            .finish()
    }
}
