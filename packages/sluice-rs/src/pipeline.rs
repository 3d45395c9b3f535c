//! The action pipeline: serialization point for every dispatch.
//!
//! ```text
//! dispatch(action)
//!     │
//!     ▼ ActionContext::new
//! before_reduce  (middleware 0 → n)
//!     │
//!     ▼ Store::prepare  (one context at a time)
//! after_reduce   (middleware n → 0)
//!     │
//!     ▼ Store::commit, ActionBus::publish
//! effects, observers
//! ```
//!
//! # Serialization
//!
//! At most one action is inside the pipeline at any time. Concurrent callers
//! wait on an async gate; reduction order is the gate's acquisition order.
//!
//! # Commit
//!
//! A reduced state is committed and published only after the whole
//! after-reduce chain returns. If an after hook fails, or drops every
//! context, the reduction is discarded: state subscribers and the bus both
//! keep seeing the previous root state.
//!
//! # Re-entrancy
//!
//! A middleware hook may itself dispatch. Such a nested dispatch is detected
//! through a task-local marker, queued instead of waiting on the gate (which
//! would deadlock), and processed right after the current action finishes.
//! The nested call returns [`DispatchOutcome::Queued`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use tracing::{debug, error, trace, warn};

use crate::bus::ActionBus;
use crate::core::{Action, ActionContext, CorrelationId};
use crate::middleware::Middleware;
use crate::state::RootState;
use crate::store::Store;

static NEXT_PIPELINE_ID: AtomicUsize = AtomicUsize::new(1);

tokio::task_local! {
    static ACTIVE_PIPELINE: usize;
}

/// What happened to a dispatched action.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// The action was reduced. `state` is the root state after reduction.
    Reduced {
        cid: CorrelationId,
        state: RootState,
    },
    /// A middleware dropped the action, before reduction or after it.
    Dropped { cid: CorrelationId },
    /// Dispatched from inside the pipeline; runs once the current action
    /// completes.
    ///
    /// The queued action is processed before the outer dispatch returns, but
    /// its own failure is only logged. Observe the bus or the state to learn
    /// whether it was reduced.
    Queued { cid: CorrelationId },
}

impl DispatchOutcome {
    pub fn cid(&self) -> CorrelationId {
        match self {
            Self::Reduced { cid, .. } | Self::Dropped { cid } | Self::Queued { cid } => *cid,
        }
    }

    /// Root state after reduction, if the action was reduced.
    pub fn state(&self) -> Option<&RootState> {
        match self {
            Self::Reduced { state, .. } => Some(state),
            _ => None,
        }
    }

    pub fn is_reduced(&self) -> bool {
        matches!(self, Self::Reduced { .. })
    }
}

/// Middleware chain plus the store and bus it feeds.
pub(crate) struct Pipeline {
    id: usize,
    store: Arc<Store>,
    bus: ActionBus,
    middleware: Vec<Arc<dyn Middleware>>,
    gate: tokio::sync::Mutex<()>,
    pending: Mutex<VecDeque<ActionContext>>,
}

impl Pipeline {
    pub(crate) fn new(store: Arc<Store>, bus: ActionBus, middleware: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            id: NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed),
            store,
            bus,
            middleware,
            gate: tokio::sync::Mutex::new(()),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<ActionContext>> {
        self.pending.lock().unwrap_or_else(|poisoned| {
            warn!("pipeline queue lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn is_active_here(&self) -> bool {
        ACTIVE_PIPELINE.try_with(|id| *id == self.id).unwrap_or(false)
    }

    /// Run one action through the pipeline.
    pub(crate) async fn dispatch(&self, action: Action) -> Result<DispatchOutcome> {
        let ctx = ActionContext::new(action);

        if self.is_active_here() {
            let cid = ctx.cid;
            debug!(cid = %cid, action_type = %ctx.action_type(), "re-entrant dispatch queued");
            self.lock_pending().push_back(ctx);
            return Ok(DispatchOutcome::Queued { cid });
        }

        let _gate = self.gate.lock().await;
        ACTIVE_PIPELINE
            .scope(self.id, async {
                let outcome = self.process(ctx).await;
                self.drain_pending().await;
                outcome
            })
            .await
    }

    async fn drain_pending(&self) {
        loop {
            // Pop in its own statement so the guard is released before awaiting.
            let next = self.lock_pending().pop_front();
            let Some(ctx) = next else {
                break;
            };
            let cid = ctx.cid;
            let action_type = ctx.action_type().to_string();
            if let Err(e) = self.process(ctx).await {
                error!(cid = %cid, action_type = %action_type, error = %e, "queued dispatch failed");
            }
        }
    }

    async fn process(&self, ctx: ActionContext) -> Result<DispatchOutcome> {
        let cid = ctx.cid;

        let mut contexts = vec![ctx];
        for mw in &self.middleware {
            contexts = mw.before_reduce(contexts).await?;
            if contexts.is_empty() {
                debug!(cid = %cid, middleware = mw.name(), "action dropped before reduce");
                return Ok(DispatchOutcome::Dropped { cid });
            }
        }

        let outcome_cid = contexts.first().map(|c| c.cid).unwrap_or(cid);
        let mut last_state = None;

        for ctx in contexts {
            let reduction = self.store.prepare(&ctx)?;
            trace!(cid = %ctx.cid, action_type = %ctx.action_type(), "reduced");

            let ctx_cid = ctx.cid;
            let mut reduced = vec![ctx];
            for mw in self.middleware.iter().rev() {
                // An error here discards the reduction; nothing was committed.
                reduced = mw.after_reduce(reduced, reduction.next()).await?;
                if reduced.is_empty() {
                    debug!(cid = %ctx_cid, middleware = mw.name(), "action dropped after reduce, state discarded");
                    break;
                }
            }
            if reduced.is_empty() {
                continue;
            }

            let state = self.store.commit(reduction);
            for ctx in reduced {
                self.bus.publish(ctx, state.clone());
            }
            last_state = Some(state);
        }

        Ok(match last_state {
            Some(state) => DispatchOutcome::Reduced {
                cid: outcome_cid,
                state,
            },
            None => DispatchOutcome::Dropped { cid: outcome_cid },
        })
    }
}
