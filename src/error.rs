use std::{error::Error as StdError, sync::Arc};

use thiserror::Error;

/// Reason a [`Scope`](crate::Scope) finished.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeError {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl ScopeError {
    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ScopeError::Canceled => "scope_canceled",
            ScopeError::DeadlineExceeded => "scope_deadline_exceeded",
        }
    }
}

/// Shared handle to an error set by the owner of an [`Emitter`](crate::Emitter).
pub type OverrideError = Arc<dyn StdError + Send + Sync + 'static>;

/// Error reported by an [`Emitter`](crate::Emitter).
///
/// Both variants display exactly like the error they carry.
#[derive(Error, Debug, Clone)]
pub enum EmitError<E> {
    /// The wrapped scope finished on its own.
    #[error(transparent)]
    Scope(E),

    /// The owning stream substituted its own error.
    #[error(transparent)]
    Override(OverrideError),
}

impl<E> EmitError<E> {
    pub fn is_override(&self) -> bool {
        matches!(self, EmitError::Override(_))
    }

    /// Returns the scope error, if this is not an override.
    pub fn scope_error(&self) -> Option<&E> {
        match self {
            EmitError::Scope(err) => Some(err),
            EmitError::Override(_) => None,
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            EmitError::Scope(_) => "emit_scope",
            EmitError::Override(_) => "emit_override",
        }
    }
}
