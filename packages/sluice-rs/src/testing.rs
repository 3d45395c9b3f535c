//! Testing utilities for stores, middleware and effects.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! sluice = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ## Recording hook order
//!
//! ```ignore
//! use sluice::testing::{HookLog, HookRecorder};
//!
//! let log = HookLog::new();
//! let handle = EngineBuilder::new()
//!     .with_middleware(HookRecorder::new("outer", log.clone()))
//!     .with_middleware(HookRecorder::new("inner", log.clone()))
//!     .build()?
//!     .start();
//!
//! handle.dispatch(Action::new("Ping")).await?;
//! assert_eq!(log.entries(), ["outer.before", "inner.before", "inner.after", "outer.after"]);
//! ```
//!
//! ## Waiting for meaning, not time
//!
//! ```ignore
//! use sluice::testing::{await_state, ActionLog};
//!
//! let log = ActionLog::attach(handle.bus());
//! handle.dispatch(Action::new("Increment")).await?;
//!
//! log.await_count(2, Duration::from_secs(1)).await?;
//! await_state(&handle.subscribe(), Duration::from_secs(1), |s| {
//!     s.get::<i64>("counter") == Some(&10)
//! })
//! .await?;
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::bus::ActionBus;
use crate::core::{Action, ActionContext};
use crate::middleware::Middleware;
use crate::state::{RootState, StateSubscription};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Hook recording
// =============================================================================

/// Shared, ordered log of hook invocations.
#[derive(Debug, Clone, Default)]
pub struct HookLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl HookLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Usable from reducers to mark the reduce step.
    pub fn push(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

/// Middleware that records `"<name>.before"` and `"<name>.after"` for every
/// context passing through it, and otherwise passes contexts on untouched.
#[derive(Debug, Clone)]
pub struct HookRecorder {
    name: String,
    log: HookLog,
}

impl HookRecorder {
    pub fn new(name: impl Into<String>, log: HookLog) -> Self {
        Self {
            name: name.into(),
            log,
        }
    }
}

#[async_trait]
impl Middleware for HookRecorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn before_reduce(&self, contexts: Vec<ActionContext>) -> Result<Vec<ActionContext>> {
        for _ in &contexts {
            self.log.push(format!("{}.before", self.name));
        }
        Ok(contexts)
    }

    async fn after_reduce(
        &self,
        contexts: Vec<ActionContext>,
        _state: &RootState,
    ) -> Result<Vec<ActionContext>> {
        for _ in &contexts {
            self.log.push(format!("{}.after", self.name));
        }
        Ok(contexts)
    }
}

// =============================================================================
// Action log
// =============================================================================

/// Captures every action reduced on a bus, in order.
///
/// Subscribes when created; actions reduced earlier are not seen. Stops
/// capturing when dropped.
#[derive(Debug)]
pub struct ActionLog {
    actions: Arc<Mutex<Vec<Action>>>,
    notify: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ActionLog {
    pub fn attach(bus: &ActionBus) -> Self {
        let actions = Arc::new(Mutex::new(Vec::new()));
        let notify = Arc::new(Notify::new());
        let mut stream = bus.actions();

        let task = tokio::spawn({
            let actions = actions.clone();
            let notify = notify.clone();
            async move {
                while let Some(action) = stream.next().await {
                    lock(&actions).push(action);
                    notify.notify_waiters();
                }
            }
        });

        Self {
            actions,
            notify,
            task,
        }
    }

    pub fn actions(&self) -> Vec<Action> {
        lock(&self.actions).clone()
    }

    /// Types of captured actions, in reduction order.
    pub fn types(&self) -> Vec<String> {
        lock(&self.actions)
            .iter()
            .map(|a| a.action_type().to_string())
            .collect()
    }

    pub fn count_of(&self, action_type: &str) -> usize {
        lock(&self.actions).iter().filter(|a| a.is(action_type)).count()
    }

    pub fn len(&self) -> usize {
        lock(&self.actions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` actions have been captured.
    pub async fn await_count(&self, count: usize, timeout: Duration) -> Result<()> {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| anyhow!("expected {} actions within {:?}, saw {}", count, timeout, self.len()))
    }
}

impl Drop for ActionLog {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// =============================================================================
// State waiting
// =============================================================================

/// Wait until the root state satisfies `predicate`.
///
/// Checks the current state first, then every published one. Returns the
/// matching state.
pub async fn await_state<F>(
    subscription: &StateSubscription,
    timeout: Duration,
    predicate: F,
) -> Result<RootState>
where
    F: Fn(&RootState) -> bool,
{
    let mut subscription = subscription.clone();
    let current = subscription.current();
    if predicate(&current) {
        return Ok(current);
    }

    let wait = async {
        while let Some(state) = subscription.changed().await {
            if predicate(&state) {
                return Ok(state);
            }
        }
        Err(anyhow!("store dropped before the state matched"))
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| anyhow!("state did not match within {:?}", timeout))?
}
