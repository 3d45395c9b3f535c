//! Structured error types for sluice.
//!
//! `StoreError` provides pattern-matchable errors for registration, reduction
//! and dispatch. `MergeError` is kept separate so normalization conflicts are
//! distinguishable from every other failure.
//!
//! # The Error Boundary Rule
//!
//! `anyhow` is the transport at dispatch and effect boundaries. Structured
//! errors ride inside it and can be recovered with `downcast_ref`.
//!
//! # Example
//!
//! ```ignore
//! use sluice::StoreError;
//!
//! match handle.dispatch(action).await {
//!     Ok(outcome) => println!("reduced: {:?}", outcome),
//!     Err(e) => match e.downcast_ref::<StoreError>() {
//!         Some(StoreError::ReducerFailed { slice, .. }) => eprintln!("slice {slice} rejected it"),
//!         Some(other) => eprintln!("store error: {other}"),
//!         None => eprintln!("middleware error: {e}"),
//!     },
//! }
//! ```

use std::error::Error as StdError;

use thiserror::Error;

/// Boxed source error carried by reduction failures.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors raised by the store, slices and dispatcher.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A slice with this key is already registered.
    #[error("slice already registered: {key}")]
    DuplicateSlice {
        /// The colliding slice key.
        key: String,
    },

    /// A reducer for this action type is already registered on the slice.
    #[error("slice {slice} already has a reducer for action type {action_type}")]
    DuplicateReducer {
        /// Slice key.
        slice: String,
        /// The colliding action type.
        action_type: String,
    },

    /// A fallible reducer returned an error.
    #[error("reducer for {action_type} on slice {slice} failed: {source}")]
    ReducerFailed {
        /// Slice key.
        slice: String,
        /// Action type being reduced.
        action_type: String,
        /// The underlying error.
        #[source]
        source: BoxError,
    },

    /// A reducer panicked.
    #[error("reducer for {action_type} on slice {slice} panicked: {message}")]
    ReducerPanicked {
        /// Slice key.
        slice: String,
        /// Action type being reduced.
        action_type: String,
        /// Panic payload, when it was a string.
        message: String,
    },

    /// A hydration action carried a state the slice could not decode.
    #[error("failed to hydrate slice {slice}: {source}")]
    HydrationFailed {
        /// Slice key.
        slice: String,
        /// The decoding error.
        #[source]
        source: serde_json::Error,
    },

    /// The dispatcher is not attached to a running pipeline.
    #[error("dispatcher is not attached to a pipeline")]
    DispatcherNotAttached,

    /// An action payload could not be encoded or decoded.
    #[error("invalid payload for action type {action_type}: {source}")]
    InvalidPayload {
        /// Action type whose payload failed.
        action_type: String,
        /// The serde error.
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Wrap an `anyhow::Error` returned by a fallible reducer.
    pub(crate) fn reducer_failed(slice: &str, action_type: &str, error: anyhow::Error) -> Self {
        Self::ReducerFailed {
            slice: slice.to_string(),
            action_type: action_type.to_string(),
            source: error.into(),
        }
    }

    /// Build a `ReducerPanicked` from a `catch_unwind` payload.
    pub(crate) fn reducer_panicked(
        slice: &str,
        action_type: &str,
        panic: Box<dyn std::any::Any + Send>,
    ) -> Self {
        Self::ReducerPanicked {
            slice: slice.to_string(),
            action_type: action_type.to_string(),
            message: panic_message(panic.as_ref()),
        }
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Normalization merge failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    /// Incoming entities collide with existing keys under `FailIfDuplicate`.
    #[error("merge conflict on {} key(s): {}", keys.len(), keys.join(", "))]
    Conflict {
        /// Debug-formatted conflicting keys, in key order.
        keys: Vec<String>,
    },
}
