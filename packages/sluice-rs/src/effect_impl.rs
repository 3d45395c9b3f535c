//! Effects: observers of reduced actions that perform side work.
//!
//! Two flavors:
//!
//! | Flavor           | Trigger                          | Output                       |
//! |------------------|----------------------------------|------------------------------|
//! | [`AsyncEffect`]  | once per matching reduced action | `Vec<Action>` to dispatch    |
//! | [`ReactiveEffect`] | wired once at engine start     | a stream of actions          |
//!
//! Effects never touch state directly. Their output re-enters the pipeline
//! through the dispatcher, like any externally dispatched action.
//!
//! # Execution
//!
//! Each async effect invocation runs as its own task, concurrently with other
//! invocations and with later dispatches. A failing or panicking invocation
//! is logged and never affects the store or other effects.
//!
//! # Example
//!
//! ```ignore
//! use sluice::{async_trait, Action, AsyncEffect, RootState};
//!
//! struct FetchTodos { api: ApiClient }
//!
//! #[async_trait]
//! impl AsyncEffect for FetchTodos {
//!     fn matches(&self, action: &Action) -> bool {
//!         action.is("todos/fetch")
//!     }
//!
//!     async fn run(&self, _action: Action, _state: RootState) -> anyhow::Result<Vec<Action>> {
//!         let todos = self.api.list().await?;
//!         Ok(vec![Action::new("todos/loaded").with_payload(&todos)?])
//!     }
//! }
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

use crate::bus::{ActionBus, Dispatched};
use crate::core::Action;
use crate::dispatch::Dispatcher;
use crate::error::panic_message;
use crate::state::{RootState, StateSubscription};

// =============================================================================
// Action filter
// =============================================================================

/// Which actions an effect reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionFilter {
    /// Every action.
    Any,
    /// Actions whose type is one of these.
    Types(Vec<String>),
}

impl ActionFilter {
    /// Match a single action type.
    pub fn of_type(action_type: impl Into<String>) -> Self {
        Self::Types(vec![action_type.into()])
    }

    /// Match any of several action types.
    pub fn one_of<I, T>(action_types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::Types(action_types.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, action: &Action) -> bool {
        match self {
            Self::Any => true,
            Self::Types(types) => types.iter().any(|t| action.is(t)),
        }
    }
}

// =============================================================================
// Async effects
// =============================================================================

/// An effect invoked once per matching reduced action.
///
/// Receives the action and the root state it produced. Returned actions are
/// dispatched in order once `run` completes. Effects that need to dispatch
/// mid-run take a [`Dispatcher`] at construction.
#[async_trait]
pub trait AsyncEffect: Send + Sync + 'static {
    /// Name used in logs and as the circuit-breaker key.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Returns true if this effect should run for `action`.
    fn matches(&self, action: &Action) -> bool;

    /// Perform the side work.
    async fn run(&self, action: Action, state: RootState) -> Result<Vec<Action>>;
}

/// Async effect built from a closure. See [`effect_fn`].
pub struct FnEffect<F> {
    name: String,
    filter: ActionFilter,
    f: F,
}

/// Build an async effect from a filter and an async closure.
///
/// ```ignore
/// let audit = effect_fn("audit", ActionFilter::Any, |action, _state| async move {
///     println!("saw {}", action.action_type());
///     Ok(vec![])
/// });
/// ```
pub fn effect_fn<F, Fut>(name: impl Into<String>, filter: ActionFilter, f: F) -> FnEffect<F>
where
    F: Fn(Action, RootState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Action>>> + Send + 'static,
{
    FnEffect {
        name: name.into(),
        filter,
        f,
    }
}

#[async_trait]
impl<F, Fut> AsyncEffect for FnEffect<F>
where
    F: Fn(Action, RootState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Action>>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, action: &Action) -> bool {
        self.filter.matches(action)
    }

    async fn run(&self, action: Action, state: RootState) -> Result<Vec<Action>> {
        (self.f)(action, state).await
    }
}

// =============================================================================
// Reactive effects
// =============================================================================

/// Live inputs handed to a reactive effect when it is wired.
#[derive(Clone)]
pub struct EffectSources {
    bus: ActionBus,
    state: StateSubscription,
}

impl EffectSources {
    pub(crate) fn new(bus: ActionBus, state: StateSubscription) -> Self {
        Self { bus, state }
    }

    /// Every reduced action, in reduction order.
    pub fn actions(&self) -> BoxStream<'static, Action> {
        self.bus.actions()
    }

    /// Every reduced action paired with the root state it produced.
    pub fn dispatched(&self) -> BoxStream<'static, Dispatched> {
        self.bus.dispatched()
    }

    /// The current root state followed by every published one.
    pub fn state(&self) -> BoxStream<'static, RootState> {
        self.state.clone().into_stream()
    }

    /// Handle for sampling the latest root state.
    pub fn latest_state(&self) -> StateSubscription {
        self.state.clone()
    }
}

impl std::fmt::Debug for EffectSources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectSources").finish_non_exhaustive()
    }
}

/// An effect expressed as a transformation of the live action and state
/// streams into a stream of new actions.
///
/// `wire` is called once when the engine starts. The returned stream runs
/// until it ends or the engine shuts down; each item is dispatched.
pub trait ReactiveEffect: Send + Sync + 'static {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn wire(&self, sources: EffectSources) -> BoxStream<'static, Action>;
}

/// Reactive effect built from a closure. See [`reactive_fn`].
pub struct FnReactive<F> {
    name: String,
    f: F,
}

/// Build a reactive effect from a closure over [`EffectSources`].
///
/// ```ignore
/// let reset = reactive_fn("auto-reset", |sources| {
///     sources
///         .dispatched()
///         .filter(|d| ready(d.state.get::<i64>("counter").is_some_and(|c| *c > 15)))
///         .delay(Duration::from_secs(1))
///         .map(|_| Action::new("Reset"))
///         .boxed()
/// });
/// ```
pub fn reactive_fn<F>(name: impl Into<String>, f: F) -> FnReactive<F>
where
    F: Fn(EffectSources) -> BoxStream<'static, Action> + Send + Sync + 'static,
{
    FnReactive {
        name: name.into(),
        f,
    }
}

impl<F> ReactiveEffect for FnReactive<F>
where
    F: Fn(EffectSources) -> BoxStream<'static, Action> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn wire(&self, sources: EffectSources) -> BoxStream<'static, Action> {
        (self.f)(sources)
    }
}

// =============================================================================
// Runners
// =============================================================================

/// Carry the trigger's correlation id over to an effect's output.
///
/// Only applies when the trigger was tagged (correlation middleware active)
/// and the output does not already carry an id.
fn continue_trace(trigger: &Action, output: Action) -> Action {
    match trigger.correlation_id() {
        Some(cid) if output.correlation_id().is_none() => output.with_correlation(cid),
        _ => output,
    }
}

/// Spawn the task that feeds matching actions to an async effect.
///
/// Subscribes to the bus before returning, so no action reduced after this
/// call is missed. Invocations are owned by a `JoinSet` and are aborted with
/// the runner.
pub(crate) fn spawn_async_runner(
    effect: Arc<dyn AsyncEffect>,
    bus: &ActionBus,
    dispatcher: Dispatcher,
) -> JoinHandle<()> {
    let mut records = bus.dispatched();

    tokio::spawn(async move {
        let mut inflight = JoinSet::new();

        loop {
            tokio::select! {
                record = records.next() => {
                    let Some(record) = record else { break };
                    if !effect.matches(record.action()) {
                        continue;
                    }
                    inflight.spawn(invoke(effect.clone(), record, dispatcher.clone()));
                }
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(effect = effect.name(), "effect task panicked");
                        }
                    }
                }
            }
        }

        // Bus closed: let outstanding invocations finish.
        while inflight.join_next().await.is_some() {}
        debug!(effect = effect.name(), "async effect runner stopped");
    })
}

async fn invoke(effect: Arc<dyn AsyncEffect>, record: Dispatched, dispatcher: Dispatcher) {
    let Dispatched { context, state } = record;
    let cid = context.cid;
    let trigger = context.action;

    // AssertUnwindSafe: the effect is shared immutably and the result is
    // discarded on panic.
    let result = AssertUnwindSafe(effect.run(trigger.clone(), state))
        .catch_unwind()
        .await;

    let outputs = match result {
        Ok(Ok(outputs)) => outputs,
        Ok(Err(e)) => {
            error!(effect = effect.name(), cid = %cid, action_type = %trigger.action_type(), error = %e, "async effect failed");
            return;
        }
        Err(panic) => {
            let panic_msg = panic_message(panic.as_ref());
            error!(effect = effect.name(), cid = %cid, panic = %panic_msg, "async effect panicked");
            return;
        }
    };

    for output in outputs {
        let output = continue_trace(&trigger, output);
        let output_type = output.action_type().to_string();
        if let Err(e) = dispatcher.dispatch(output).await {
            warn!(effect = effect.name(), cid = %cid, action_type = %output_type, error = %e, "effect output dispatch failed");
        }
    }
}

/// Wire a reactive effect and spawn the task that dispatches its output.
///
/// `wire` runs before this returns, so subscriptions made inside it see every
/// action reduced afterwards.
pub(crate) fn spawn_reactive_runner(
    effect: Arc<dyn ReactiveEffect>,
    sources: EffectSources,
    dispatcher: Dispatcher,
) -> JoinHandle<()> {
    let mut outputs = effect.wire(sources);

    tokio::spawn(async move {
        while let Some(action) = outputs.next().await {
            let action_type = action.action_type().to_string();
            if let Err(e) = dispatcher.dispatch(action).await {
                warn!(effect = effect.name(), action_type = %action_type, error = %e, "reactive effect dispatch failed");
            }
        }
        debug!(effect = effect.name(), "reactive effect stream ended");
    })
}
