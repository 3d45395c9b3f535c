//! # Sluice
//!
//! A unidirectional state container: actions go in, reducers compute the next
//! state, effects observe and feed new actions back.
//!
//! ## Core Concepts
//!
//! - [`Action`] = what happened, in the Flux Standard Action shape
//!   `{ type, payload?, meta?, error? }`
//! - [`Slice`] = one named partition of state with a table of reducers
//! - [`RootState`] = immutable snapshot of every slice
//! - [`Middleware`] = before/after hooks around every dispatch
//! - [`AsyncEffect`] / [`ReactiveEffect`] = side work triggered by reduced actions
//!
//! ## Architecture
//!
//! ```text
//! Dispatcher::dispatch(action)
//!     │
//!     ▼ ActionContext (cid, timestamp)
//! Middleware A.before ─► Middleware B.before
//!     │
//!     ▼ Store::prepare ─► next RootState (not yet visible)
//!     │
//! Middleware B.after ─► Middleware A.after
//!     │
//!     ▼ Store::commit ─► subscribers, ActionBus::publish
//!     ├─► AsyncEffect.run()  (one task per matching action) ─┐
//!     │                                                      │
//!     └─► ReactiveEffect stream ─────────────────────────────┤
//!                                                            │
//!            Dispatcher::dispatch(output) ◄──────────────────┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Reduction is serialized** - at most one action is reduced at a time
//! 2. **Reducers are pure** - `(&S, &Action) -> S`, no IO, no dispatch
//! 3. **One state per action** - each reduced action publishes exactly one
//!    [`RootState`]; partial updates are never observable
//! 4. **Effects are isolated** - a failing or panicking effect never affects
//!    the store or other effects
//! 5. **No hidden globals** - effects receive a [`Dispatcher`] explicitly
//!
//! ## Guarantees
//!
//! - **Linearizable state**: every observer sees states in reduction order
//! - **Lossy fan-out under pressure**: bus observers slower than the bus
//!   capacity miss actions and log a warning
//! - **In-memory only**: use [`RootState::to_json`] and [`Hydrate`] to persist
//!   and restore slices
//!
//! ## Example
//!
//! ```ignore
//! use sluice::{Action, EngineBuilder, Slice};
//!
//! let counter = Slice::new("counter", 10i64)
//!     .on("Increment", |c, _| c + 1)
//!     .on("Reset", |_, _| 10);
//!
//! let handle = EngineBuilder::new()
//!     .with_slice(counter)
//!     .with_middleware(CorrelationMiddleware::new())
//!     .with_resilient_effect(effect_fn("persist", ActionFilter::Any, |action, state| async move {
//!         api.save(&state.to_json()?).await?;
//!         Ok(vec![])
//!     }))
//!     .build()?
//!     .start();
//!
//! handle.dispatch(Action::new("Increment")).await?;
//! assert_eq!(handle.state().get::<i64>("counter"), Some(&11));
//! ```

// Core modules
mod bus;
mod config;
mod core;
mod dispatch;
mod effect_impl;
mod engine;
mod error;
mod middleware;
mod normalize;
mod operators;
mod pipeline;
mod resilience;
mod slice;
mod state;
mod store;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export core types
pub use crate::core::{Action, ActionContext, CorrelationId, Hydrate, CORRELATION_META_KEY, HYDRATE};

// Re-export error types
pub use crate::error::{BoxError, MergeError, StoreError};

// Re-export state types
pub use slice::Slice;
pub use state::{RootState, SliceState, StateSubscription};
pub use store::{BoxedSlice, Store};

// Re-export pipeline types
pub use bus::{ActionBus, Dispatched, DEFAULT_CAPACITY};
pub use dispatch::Dispatcher;
pub use middleware::{CorrelationMiddleware, LoggingMiddleware, Middleware};
pub use pipeline::DispatchOutcome;

// Re-export effect types
pub use effect_impl::{
    effect_fn, reactive_fn, ActionFilter, AsyncEffect, EffectSources, FnEffect, FnReactive,
    ReactiveEffect,
};
pub use operators::{ticks, ActionStreamExt, EffectStreamExt};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, Resilient, RetryMiddleware, RetryPolicy,
    ServiceUnavailable, SERVICE_UNAVAILABLE,
};

// Re-export normalization helpers
pub use normalize::{merge, EntityCollection, MergeStrategy};

// Re-export configuration
pub use config::{EngineConfig, ResilienceConfig};

// Re-export engine types (primary entry point)
pub use engine::{Engine, EngineBuilder, EngineHandle};

// Re-export commonly used external types
pub use async_trait::async_trait;
