use std::{
    any::Any,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use futures::{
    channel::oneshot,
    future::{self, Either},
};

use super::{CancellationScope, Key};
use crate::ScopeError;

/// A node in a tree of cancellation scopes.
///
/// Scopes are cheap to clone; clones share the same cancellation state. A
/// scope finishes when its [`CancelHandle`] is used, when its deadline
/// passes, or when any ancestor finishes, and every descendant then reports
/// the same error.
#[derive(Clone)]
pub struct Scope {
    node: Arc<Node>,
}

enum Node {
    Background,
    Cancel {
        parent: Scope,
        signal: Arc<Signal>,
    },
    Value {
        parent: Scope,
        key: u64,
        value: Box<dyn Any + Send + Sync>,
    },
}

impl Scope {
    /// Root scope: never finishes, has no deadline and carries no values.
    pub fn background() -> Self {
        Scope {
            node: Arc::new(Node::Background),
        }
    }

    pub fn with_cancel(parent: &Scope) -> (Scope, CancelHandle) {
        Self::with_signal(parent, parent.deadline())
    }

    /// Child scope that finishes with [`ScopeError::DeadlineExceeded`] at
    /// `deadline`, unless the parent's deadline comes first.
    pub fn with_deadline(parent: &Scope, deadline: Instant) -> (Scope, CancelHandle) {
        if let Some(current) = parent.deadline() {
            if current <= deadline {
                return Self::with_cancel(parent);
            }
        }

        let (scope, handle) = Self::with_signal(parent, Some(deadline));

        if deadline <= Instant::now() {
            handle.signal.finish(ScopeError::DeadlineExceeded);
        } else {
            spawn_timer(&handle.signal, deadline);
        }

        (scope, handle)
    }

    pub fn with_timeout(parent: &Scope, timeout: Duration) -> (Scope, CancelHandle) {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(parent, deadline),
            None => Self::with_cancel(parent),
        }
    }

    /// Child scope carrying `value` under `key`. Shares the parent's
    /// cancellation.
    pub fn with_value<T>(parent: &Scope, key: &Key<T>, value: T) -> Scope
    where
        T: Any + Send + Sync,
    {
        Scope {
            node: Arc::new(Node::Value {
                parent: parent.clone(),
                key: key.id(),
                value: Box::new(value),
            }),
        }
    }

    fn with_signal(parent: &Scope, deadline: Option<Instant>) -> (Scope, CancelHandle) {
        let signal = Arc::new(Signal::new(deadline));

        if let Some(parent_signal) = parent.signal() {
            if let Some(error) = parent_signal.adopt(&signal) {
                signal.finish(error);
            }
        }

        let scope = Scope {
            node: Arc::new(Node::Cancel {
                parent: parent.clone(),
                signal: signal.clone(),
            }),
        };

        (scope, CancelHandle { signal })
    }

    /// Nearest cancellation state on the path to the root.
    fn signal(&self) -> Option<&Arc<Signal>> {
        let mut scope = self;

        loop {
            match scope.node.as_ref() {
                Node::Background => return None,
                Node::Cancel { signal, .. } => return Some(signal),
                Node::Value { parent, .. } => scope = parent,
            }
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::background()
    }
}

impl CancellationScope for Scope {
    type Error = ScopeError;
    type Done = Done;

    fn deadline(&self) -> Option<Instant> {
        self.signal().and_then(|signal| signal.deadline)
    }

    fn done(&self) -> Done {
        Done {
            signal: self.signal().cloned(),
            waiter: None,
        }
    }

    fn err(&self) -> Option<ScopeError> {
        self.signal().and_then(|signal| signal.error())
    }

    fn value<T>(&self, key: &Key<T>) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        let mut scope = self;

        loop {
            match scope.node.as_ref() {
                Node::Background => return None,
                Node::Cancel { parent, .. } => scope = parent,
                Node::Value { parent, key: id, value } => {
                    if *id == key.id() {
                        return (**value).downcast_ref::<T>();
                    }

                    scope = parent;
                }
            }
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.node.as_ref() {
            Node::Background => "background",
            Node::Cancel { .. } => "cancel",
            Node::Value { .. } => "value",
        };

        f.debug_struct("Scope")
            .field("kind", &kind)
            .field("deadline", &self.deadline())
            .field("err", &self.err())
            .finish()
    }
}

/// Cancels the scope it was created with, and all of that scope's
/// descendants. Dropping the handle does not cancel.
#[derive(Clone)]
pub struct CancelHandle {
    signal: Arc<Signal>,
}

impl CancelHandle {
    /// Finish the scope with [`ScopeError::Canceled`]. No-op if it already
    /// finished.
    pub fn cancel(&self) {
        self.signal.finish(ScopeError::Canceled);
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("err", &self.signal.lock().error)
            .finish()
    }
}

/// Future returned by [`Scope::done`](CancellationScope::done).
///
/// Stays ready once the scope has finished. For the background scope it
/// never resolves. A pending `Done` that is dropped removes its waker from
/// the scope.
pub struct Done {
    signal: Option<Arc<Signal>>,
    waiter: Option<u64>,
}

impl Clone for Done {
    fn clone(&self) -> Self {
        Done {
            signal: self.signal.clone(),
            waiter: None,
        }
    }
}

impl Future for Done {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match &this.signal {
            Some(signal) => signal.poll_done(&mut this.waiter, cx.waker()),
            None => Poll::Pending,
        }
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        if let (Some(signal), Some(waiter)) = (&self.signal, self.waiter) {
            signal.forget_waiter(waiter);
        }
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let finished = self
            .signal
            .as_ref()
            .map(|signal| signal.lock().error.is_some());

        f.debug_struct("Done").field("finished", &finished).finish()
    }
}

struct Signal {
    deadline: Option<Instant>,
    state: Mutex<SignalState>,
}

#[derive(Default)]
struct SignalState {
    error: Option<ScopeError>,
    next_waiter: u64,
    wakers: Vec<(u64, Waker)>,
    children: Vec<Weak<Signal>>,
    stop_timer: Option<oneshot::Sender<()>>,
}

impl Signal {
    fn new(deadline: Option<Instant>) -> Self {
        Signal {
            deadline,
            state: Mutex::new(SignalState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// First error wins. Wakes every pending `Done`, stops the deadline
    /// timer and finishes children.
    fn finish(&self, error: ScopeError) {
        let (wakers, children) = {
            let mut state = self.lock();

            if state.error.is_some() {
                return;
            }

            state.error = Some(error);
            state.stop_timer = None;

            (
                std::mem::take(&mut state.wakers),
                std::mem::take(&mut state.children),
            )
        };

        log::debug!(
            "scope finished: {}, waking {} waiter(s), {} child scope(s)",
            error.as_label(),
            wakers.len(),
            children.len()
        );

        for (_, waker) in wakers {
            waker.wake();
        }

        for child in children.iter().filter_map(Weak::upgrade) {
            child.finish(error);
        }
    }

    /// The timer may lag behind the clock, so readers check the deadline too.
    fn expire_if_due(&self) {
        if let Some(deadline) = self.deadline {
            if deadline <= Instant::now() {
                self.finish(ScopeError::DeadlineExceeded);
            }
        }
    }

    fn error(&self) -> Option<ScopeError> {
        self.expire_if_due();
        self.lock().error
    }

    /// Register `child` for propagation, or return the error it must finish
    /// with right away.
    fn adopt(&self, child: &Arc<Signal>) -> Option<ScopeError> {
        self.expire_if_due();

        let mut state = self.lock();

        if let Some(error) = state.error {
            return Some(error);
        }

        state.children.retain(|weak| weak.strong_count() > 0);
        state.children.push(Arc::downgrade(child));

        None
    }

    /// Each `Done` owns at most one waker slot, keyed by `waiter`.
    fn poll_done(&self, waiter: &mut Option<u64>, waker: &Waker) -> Poll<()> {
        self.expire_if_due();

        let mut state = self.lock();

        if state.error.is_some() {
            return Poll::Ready(());
        }

        if let Some(id) = *waiter {
            if let Some((_, slot)) = state.wakers.iter_mut().find(|(w, _)| *w == id) {
                if !slot.will_wake(waker) {
                    *slot = waker.clone();
                }

                return Poll::Pending;
            }
        }

        let id = state.next_waiter;
        state.next_waiter += 1;
        state.wakers.push((id, waker.clone()));
        *waiter = Some(id);

        log::trace!("register done waiter {}", id);

        Poll::Pending
    }

    fn forget_waiter(&self, waiter: u64) {
        self.lock().wakers.retain(|(id, _)| *id != waiter);
    }
}

/// Sleeps until `deadline` unless the scope finishes first, in which case
/// dropping the stored sender ends the task early.
fn spawn_timer(signal: &Arc<Signal>, deadline: Instant) {
    let (stop, stopped) = oneshot::channel::<()>();

    {
        let mut state = signal.lock();

        if state.error.is_some() {
            return;
        }

        state.stop_timer = Some(stop);
    }

    let signal = Arc::downgrade(signal);

    async_std::task::spawn(async move {
        let sleep = async_std::task::sleep(deadline.saturating_duration_since(Instant::now()));
        futures::pin_mut!(sleep);

        match future::select(sleep, stopped).await {
            Either::Left(_) => {
                if let Some(signal) = signal.upgrade() {
                    signal.finish(ScopeError::DeadlineExceeded);
                }
            }
            Either::Right(_) => log::trace!("deadline timer stopped"),
        }
    });
}

#[cfg(test)]
mod tests {

    use super::*;
    use futures::prelude::*;

    #[test]
    fn test_background_never_finishes() {
        crate::test_util::init();

        let scope = Scope::background();

        assert_eq!(scope.deadline(), None);
        assert_eq!(scope.err(), None);
        assert!(scope.done().now_or_never().is_none());
    }

    #[test]
    fn test_cancel_propagates_to_children() {
        crate::test_util::init();

        let (parent, cancel) = Scope::with_cancel(&Scope::background());
        let (child, _child_cancel) = Scope::with_cancel(&parent);
        let grandchild = Scope::with_value(&child, &Key::new("level"), 2_u8);

        assert!(grandchild.done().now_or_never().is_none());

        cancel.cancel();

        assert!(child.done().now_or_never().is_some());
        assert!(grandchild.done().now_or_never().is_some());
        assert_eq!(grandchild.err(), Some(ScopeError::Canceled));
    }

    #[test]
    fn test_child_cancel_leaves_parent_running() {
        crate::test_util::init();

        let (parent, _cancel) = Scope::with_cancel(&Scope::background());
        let (child, child_cancel) = Scope::with_cancel(&parent);

        child_cancel.cancel();

        assert_eq!(child.err(), Some(ScopeError::Canceled));
        assert_eq!(parent.err(), None);
    }

    #[test]
    fn test_child_of_finished_parent_is_finished() {
        crate::test_util::init();

        let (parent, cancel) = Scope::with_cancel(&Scope::background());
        cancel.cancel();

        let (child, _) = Scope::with_timeout(&parent, Duration::from_secs(60));

        assert!(child.done().now_or_never().is_some());
        assert_eq!(child.err(), Some(ScopeError::Canceled));
    }

    #[test]
    fn test_first_error_wins() {
        crate::test_util::init();

        let (scope, cancel) = Scope::with_timeout(&Scope::background(), Duration::ZERO);
        cancel.cancel();
        cancel.cancel();

        assert_eq!(scope.err(), Some(ScopeError::DeadlineExceeded));
    }

    #[test]
    fn test_later_deadline_keeps_parent_deadline() {
        crate::test_util::init();

        let (parent, _) = Scope::with_timeout(&Scope::background(), Duration::from_secs(10));
        let (child, _) = Scope::with_timeout(&parent, Duration::from_secs(3600));

        assert_eq!(child.deadline(), parent.deadline());

        let (tighter, _) = Scope::with_timeout(&parent, Duration::from_secs(1));

        assert!(tighter.deadline() < parent.deadline());
    }

    #[async_std::test]
    async fn test_deadline_timer_wakes_waiter() -> Result<(), anyhow::Error> {
        crate::test_util::init();

        let (scope, _cancel) =
            Scope::with_timeout(&Scope::background(), Duration::from_millis(20));

        assert_eq!(scope.err(), None);

        async_std::future::timeout(Duration::from_secs(5), scope.done()).await?;

        assert_eq!(scope.err(), Some(ScopeError::DeadlineExceeded));

        Ok(())
    }

    #[async_std::test]
    async fn test_cancel_from_another_task() -> Result<(), anyhow::Error> {
        crate::test_util::init();

        let (scope, cancel) = Scope::with_cancel(&Scope::background());

        async_std::task::spawn(async move {
            async_std::task::sleep(Duration::from_millis(10)).await;
            log::debug!("cancel scope");
            cancel.cancel();
        });

        async_std::future::timeout(Duration::from_secs(5), scope.done()).await?;

        assert_eq!(scope.err(), Some(ScopeError::Canceled));

        Ok(())
    }

    #[async_std::test]
    async fn test_cancel_stops_deadline_timer() -> Result<(), anyhow::Error> {
        crate::test_util::init();

        let (scope, cancel) =
            Scope::with_timeout(&Scope::background(), Duration::from_secs(3600));

        assert_eq!(Arc::weak_count(&cancel.signal), 1);

        cancel.cancel();
        drop(scope);

        async_std::task::sleep(Duration::from_millis(50)).await;

        assert_eq!(Arc::weak_count(&cancel.signal), 0);
        assert!(cancel.signal.lock().stop_timer.is_none());

        Ok(())
    }

    #[test]
    fn test_no_timer_for_finished_parent() {
        crate::test_util::init();

        let (parent, cancel) = Scope::with_cancel(&Scope::background());
        cancel.cancel();

        let deadline = Instant::now() + Duration::from_secs(3600);
        let (_child, child_cancel) = Scope::with_deadline(&parent, deadline);

        assert_eq!(Arc::weak_count(&child_cancel.signal), 0);
    }

    #[test]
    fn test_dropped_done_releases_waker() {
        crate::test_util::init();

        let (scope, cancel) = Scope::with_cancel(&Scope::background());
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());

        let mut first = scope.done();
        let mut second = first.clone();

        assert!(Pin::new(&mut first).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut first).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut second).poll(&mut cx).is_pending());
        assert_eq!(cancel.signal.lock().wakers.len(), 2);

        drop(first);
        assert_eq!(cancel.signal.lock().wakers.len(), 1);

        drop(second);
        assert!(cancel.signal.lock().wakers.is_empty());
    }

    #[test]
    fn test_value_lookup() {
        crate::test_util::init();

        let user = Key::<String>::new("user");
        let shadowed = Key::<String>::new("user");
        let retries = Key::<u32>::new("retries");

        let root = Scope::with_value(&Scope::background(), &user, "alice".to_string());
        let (cancelable, _) = Scope::with_cancel(&root);
        let scope = Scope::with_value(&cancelable, &retries, 3);
        let scope = Scope::with_value(&scope, &retries, 5);

        assert_eq!(scope.value(&user).map(String::as_str), Some("alice"));
        assert_eq!(scope.value(&retries), Some(&5));
        assert_eq!(scope.value(&shadowed), None);
        assert_eq!(root.value(&retries), None);
    }
}
