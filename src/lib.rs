//! Lifecycle signaling for a single stream subscription.
//!
//! An [`Emitter`] borrows a [`CancellationScope`] and lets the subscriber
//! wait for cancellation or deadline expiry through
//! [`done`](CancellationScope::done). The producing side of the stream can
//! substitute a more specific error with [`Emitter::set_error`], and the
//! subscriber records when it started observing with [`Emit::subscribe`].
//!
//! ```
//! use futures::FutureExt;
//! use futures_emitter::{CancellationScope, Emit, Emitter, Scope};
//!
//! let (scope, cancel) = Scope::with_cancel(&Scope::background());
//! let mut emitter = Emitter::new(&scope);
//! emitter.subscribe();
//!
//! cancel.cancel();
//!
//! assert!(emitter.done().now_or_never().is_some());
//! assert_eq!(emitter.err().unwrap().to_string(), "context canceled");
//! ```

mod emitter;
mod error;
mod scope;

pub use emitter::*;
pub use error::*;
pub use scope::*;
