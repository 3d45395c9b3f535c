//! The dispatcher: the single entry point for actions.
//!
//! A `Dispatcher` is a cheap, cloneable handle. Create one before the engine
//! exists, hand clones to effects at construction time, then attach it when
//! the engine is built. Dispatching through a handle that was never attached,
//! or whose engine has been dropped, fails immediately with
//! [`StoreError::DispatcherNotAttached`].
//!
//! The handle holds only a weak reference to the pipeline, so effects that
//! keep a dispatcher do not keep the engine alive.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use anyhow::{anyhow, Result};
use tracing::warn;

use crate::core::Action;
use crate::error::StoreError;
use crate::pipeline::{DispatchOutcome, Pipeline};

struct DispatcherInner {
    pipeline: OnceLock<Weak<Pipeline>>,
    last_action: Mutex<Option<Action>>,
}

/// Handle for injecting actions into the pipeline.
///
/// # Example
///
/// ```ignore
/// let dispatcher = Dispatcher::detached();
/// let effect = SaveTodos::new(dispatcher.clone());
///
/// let handle = EngineBuilder::new()
///     .with_dispatcher(dispatcher.clone())
///     .with_effect(effect)
///     .build()?
///     .start();
///
/// dispatcher.dispatch(Action::new("todos/load")).await?;
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Create a handle not yet attached to any pipeline.
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                pipeline: OnceLock::new(),
                last_action: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn attach(&self, pipeline: &Arc<Pipeline>) -> Result<()> {
        self.inner
            .pipeline
            .set(Arc::downgrade(pipeline))
            .map_err(|_| anyhow!("dispatcher is already attached to a pipeline"))
    }

    /// Returns true if the handle is attached to a live pipeline.
    pub fn is_attached(&self) -> bool {
        self.pipeline().is_some()
    }

    fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.inner.pipeline.get().and_then(Weak::upgrade)
    }

    fn lock_last_action(&self) -> MutexGuard<'_, Option<Action>> {
        self.inner.last_action.lock().unwrap_or_else(|poisoned| {
            warn!("last_action lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Dispatch an action.
    ///
    /// Returns once the action has been reduced and the after-reduce phase
    /// has run. Effects triggered by it may still be running.
    ///
    /// # Errors
    ///
    /// - [`StoreError::DispatcherNotAttached`] if there is no live pipeline
    /// - any middleware error
    /// - [`StoreError`] reduction failures (reducer error, panic, bad hydration)
    pub async fn dispatch(&self, action: Action) -> Result<DispatchOutcome> {
        let pipeline = self.pipeline().ok_or(StoreError::DispatcherNotAttached)?;
        *self.lock_last_action() = Some(action.clone());
        pipeline.dispatch(action).await
    }

    /// The most recent action handed to [`Dispatcher::dispatch`].
    pub fn last_action(&self) -> Option<Action> {
        self.lock_last_action().clone()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("attached", &self.is_attached())
            .field("last_action", &self.last_action().map(|a| a.action_type().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ActionBus;
    use crate::slice::Slice;
    use crate::store::Store;

    fn pipeline() -> Arc<Pipeline> {
        let store = Store::new();
        store
            .add_slice(Slice::new("counter", 0i64).on("Increment", |c, _| c + 1))
            .unwrap();
        Arc::new(Pipeline::new(Arc::new(store), ActionBus::new(), Vec::new()))
    }

    #[tokio::test]
    async fn test_detached_dispatch_fails() {
        let dispatcher = Dispatcher::detached();

        let err = dispatcher.dispatch(Action::new("Increment")).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::DispatcherNotAttached)
        ));
        assert!(dispatcher.last_action().is_none());
    }

    #[tokio::test]
    async fn test_attached_dispatch_tracks_last_action() {
        let pipeline = pipeline();
        let dispatcher = Dispatcher::detached();
        dispatcher.attach(&pipeline).unwrap();

        dispatcher.dispatch(Action::new("Increment")).await.unwrap();
        dispatcher.dispatch(Action::new("NoOp")).await.unwrap();

        assert_eq!(dispatcher.last_action().unwrap().action_type(), "NoOp");
    }

    #[tokio::test]
    async fn test_clones_share_last_action() {
        let pipeline = pipeline();
        let dispatcher = Dispatcher::detached();
        let clone = dispatcher.clone();
        dispatcher.attach(&pipeline).unwrap();

        clone.dispatch(Action::new("Increment")).await.unwrap();

        assert!(dispatcher.is_attached());
        assert_eq!(dispatcher.last_action().unwrap().action_type(), "Increment");
    }

    #[tokio::test]
    async fn test_attach_twice_is_error() {
        let dispatcher = Dispatcher::detached();
        dispatcher.attach(&pipeline()).unwrap();
        assert!(dispatcher.attach(&pipeline()).is_err());
    }

    #[tokio::test]
    async fn test_dropped_pipeline_detaches() {
        let dispatcher = Dispatcher::detached();
        {
            let pipeline = pipeline();
            dispatcher.attach(&pipeline).unwrap();
            assert!(dispatcher.is_attached());
        }

        assert!(!dispatcher.is_attached());
        let err = dispatcher.dispatch(Action::new("Increment")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::DispatcherNotAttached)
        ));
    }
}
