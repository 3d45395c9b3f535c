//! Sluice Engine - wires store, pipeline, bus and effects together.
//!
//! ```text
//! dispatch ─► middleware.before ─► Store::reduce ─► middleware.after ─► ActionBus
//!    ▲                                                                     │
//!    │                              ┌── async effects (one task per action)┤
//!    └──────────────────────────────┤                                      │
//!                                   └── reactive effects (wired at start) ◄┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use sluice::{EngineBuilder, Slice, Action};
//!
//! let handle = EngineBuilder::new()
//!     .with_slice(Slice::new("counter", 10i64).on("Increment", |c, _| c + 1))
//!     .with_middleware(CorrelationMiddleware::new())
//!     .with_effect(SaveCounter::new(api))
//!     .build()?
//!     .start();
//!
//! handle.dispatch(Action::new("Increment")).await?;
//! assert_eq!(handle.state().get::<i64>("counter"), Some(&11));
//! ```
//!
//! # Lifecycle
//!
//! `build` registers slices and attaches the dispatcher, so actions can be
//! dispatched before `start`. Effects only observe actions reduced after
//! `start`. Dropping or shutting down the [`EngineHandle`] stops every effect
//! runner and detaches all dispatcher clones.

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bus::ActionBus;
use crate::config::EngineConfig;
use crate::core::Action;
use crate::dispatch::Dispatcher;
use crate::effect_impl::{spawn_async_runner, spawn_reactive_runner, AsyncEffect, EffectSources, ReactiveEffect};
use crate::middleware::Middleware;
use crate::pipeline::{DispatchOutcome, Pipeline};
use crate::resilience::{Resilient, RetryMiddleware};
use crate::slice::Slice;
use crate::state::{RootState, SliceState, StateSubscription};
use crate::store::{BoxedSlice, Store};

// =============================================================================
// Engine
// =============================================================================

/// A built, not yet started engine.
///
/// Actions can already be dispatched; effects start with [`Engine::start`].
pub struct Engine {
    pipeline: Arc<Pipeline>,
    store: Arc<Store>,
    bus: ActionBus,
    dispatcher: Dispatcher,
    retry: RetryMiddleware,
    effects: Vec<Arc<dyn AsyncEffect>>,
    reactive: Vec<Arc<dyn ReactiveEffect>>,
}

impl Engine {
    /// Create a new engine builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn bus(&self) -> &ActionBus {
        &self.bus
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Start every effect runner.
    ///
    /// Async effects subscribe and reactive effects are wired before this
    /// returns, so nothing dispatched afterwards is missed.
    pub fn start(self) -> EngineHandle {
        info!(
            slices = self.store.slice_keys().len(),
            async_effects = self.effects.len(),
            reactive_effects = self.reactive.len(),
            "starting sluice engine"
        );

        let mut runners = Vec::with_capacity(self.effects.len() + self.reactive.len());
        for effect in self.effects {
            debug!(effect = effect.name(), "async effect registered");
            runners.push(spawn_async_runner(effect, &self.bus, self.dispatcher.clone()));
        }
        for effect in self.reactive {
            debug!(effect = effect.name(), "reactive effect wired");
            let sources = EffectSources::new(self.bus.clone(), self.store.subscribe());
            runners.push(spawn_reactive_runner(effect, sources, self.dispatcher.clone()));
        }

        EngineHandle {
            pipeline: self.pipeline,
            store: self.store,
            bus: self.bus,
            dispatcher: self.dispatcher,
            retry: self.retry,
            runners,
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.store)
            .field("async_effects", &self.effects.len())
            .field("reactive_effects", &self.reactive.len())
            .finish()
    }
}

// =============================================================================
// Engine Handle
// =============================================================================

/// Handle to a running engine.
///
/// Owns the pipeline: every [`Dispatcher`] clone works for as long as the
/// handle lives. Dropping it aborts the effect runners.
pub struct EngineHandle {
    pipeline: Arc<Pipeline>,
    store: Arc<Store>,
    bus: ActionBus,
    dispatcher: Dispatcher,
    retry: RetryMiddleware,
    runners: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Dispatch an action and wait for its reduction.
    ///
    /// Same semantics as [`Dispatcher::dispatch`].
    pub async fn dispatch(&self, action: Action) -> Result<DispatchOutcome> {
        self.dispatcher.dispatch(action).await
    }

    /// The current root state.
    pub fn state(&self) -> RootState {
        self.store.state()
    }

    /// Observe the current root state and every later one.
    pub fn subscribe(&self) -> StateSubscription {
        self.store.subscribe()
    }

    pub fn last_action(&self) -> Option<Action> {
        self.dispatcher.last_action()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// A dispatcher clone for handing to collaborators.
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    pub fn bus(&self) -> &ActionBus {
        &self.bus
    }

    /// Retry middleware owning the circuits of resilient effects.
    pub fn retry(&self) -> &RetryMiddleware {
        &self.retry
    }

    /// Register a slice while running. See [`Store::add_slice`].
    pub fn add_slice<S: SliceState>(&self, slice: Slice<S>) -> Result<()> {
        self.store.add_slice(slice)?;
        Ok(())
    }

    /// Abort the effect runners without waiting.
    ///
    /// Dispatch keeps working; no effect observes later actions.
    pub fn abort(&self) {
        for runner in &self.runners {
            runner.abort();
        }
    }

    /// Stop every effect runner and wait for them to wind down.
    ///
    /// Consumes the handle, which detaches every dispatcher clone.
    pub async fn shutdown(mut self) {
        info!("shutting down sluice engine");
        let runners = std::mem::take(&mut self.runners);
        for runner in &runners {
            runner.abort();
        }
        for runner in runners {
            let _ = runner.await;
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        for runner in &self.runners {
            runner.abort();
        }
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("store", &self.store)
            .field("runners", &self.runners.len())
            .field("pipeline_refs", &Arc::strong_count(&self.pipeline))
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Engine Builder
// =============================================================================

/// Builder for an engine: slices, middleware and effects, in order.
///
/// # Example
///
/// ```ignore
/// let dispatcher = Dispatcher::detached();
///
/// let mut builder = EngineBuilder::new()
///     .with_config(config)
///     .with_dispatcher(dispatcher.clone())
///     .with_slices([todos_slice.into(), filter_slice.into()])
///     .with_middleware(CorrelationMiddleware::new())
///     .with_middleware(LoggingMiddleware::new());
///
/// let sync = builder.retry().wrap(SyncTodos::new(api, dispatcher.clone()));
/// let engine = builder.with_effect(sync).build()?;
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    dispatcher: Dispatcher,
    retry: RetryMiddleware,
    slices: Vec<BoxedSlice>,
    middleware: Vec<Arc<dyn Middleware>>,
    effects: Vec<Arc<dyn AsyncEffect>>,
    reactive: Vec<Arc<dyn ReactiveEffect>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        let config = EngineConfig::default();
        Self {
            retry: RetryMiddleware::new(config.resilience.clone()),
            config,
            dispatcher: Dispatcher::detached(),
            slices: Vec::new(),
            middleware: Vec::new(),
            effects: Vec::new(),
            reactive: Vec::new(),
        }
    }

    /// Replace the configuration.
    ///
    /// Also resets the retry middleware to the new resilience defaults, so
    /// call this before wrapping effects.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.retry = RetryMiddleware::new(config.resilience.clone());
        self.config = config;
        self
    }

    /// Use a dispatcher created ahead of the engine.
    ///
    /// Lets effects receive their dispatch handle at construction time. The
    /// dispatcher must not already be attached elsewhere.
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// The dispatcher this engine will attach.
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// The retry middleware used by [`EngineBuilder::with_resilient_effect`].
    pub fn retry(&self) -> &RetryMiddleware {
        &self.retry
    }

    pub fn with_slice<S: SliceState>(mut self, slice: Slice<S>) -> Self {
        self.slices.push(slice.into());
        self
    }

    pub fn with_slices(mut self, slices: impl IntoIterator<Item = BoxedSlice>) -> Self {
        self.slices.extend(slices);
        self
    }

    /// Append a middleware. The first registered is the outermost.
    pub fn with_middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn with_effect<E: AsyncEffect>(mut self, effect: E) -> Self {
        self.effects.push(Arc::new(effect));
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Arc<dyn AsyncEffect>>) -> Self {
        self.effects.extend(effects);
        self
    }

    /// Register an async effect wrapped with retry and circuit breaking.
    pub fn with_resilient_effect<E: AsyncEffect>(self, effect: E) -> Self {
        let wrapped: Resilient<E> = self.retry.wrap(effect);
        self.with_effect(wrapped)
    }

    pub fn with_reactive_effect<R: ReactiveEffect>(mut self, effect: R) -> Self {
        self.reactive.push(Arc::new(effect));
        self
    }

    pub fn with_reactive_effects(
        mut self,
        effects: impl IntoIterator<Item = Arc<dyn ReactiveEffect>>,
    ) -> Self {
        self.reactive.extend(effects);
        self
    }

    /// Build the engine.
    ///
    /// Fails on a slice key collision or if the dispatcher is already
    /// attached to another engine.
    pub fn build(self) -> Result<Engine> {
        let store = Arc::new(Store::new());
        store.add_slices(self.slices)?;

        let bus = ActionBus::with_capacity(self.config.bus_capacity);
        let pipeline = Arc::new(Pipeline::new(store.clone(), bus.clone(), self.middleware));
        self.dispatcher.attach(&pipeline)?;

        Ok(Engine {
            pipeline,
            store,
            bus,
            dispatcher: self.dispatcher,
            retry: self.retry,
            effects: self.effects,
            reactive: self.reactive,
        })
    }
}
