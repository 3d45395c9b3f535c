//! Middleware: before/after-reduce hooks around every dispatch.
//!
//! Middleware nest like an onion. For a chain registered as `[Outer, Inner]`:
//!
//! ```text
//! Outer.before → Inner.before → reduce → Inner.after → Outer.after
//! ```
//!
//! Each hook receives the batch of contexts flowing through the chain and
//! returns the batch to pass on. A hook may rewrite, filter, duplicate or
//! delay contexts. Returning an empty batch from `before_reduce` drops the
//! action: nothing is reduced and no after-reduce hook runs for it. Returning
//! an error aborts the dispatch and surfaces at the call site.
//!
//! # Example
//!
//! ```ignore
//! use sluice::{async_trait, ActionContext, Middleware};
//!
//! struct DropDebugActions;
//!
//! #[async_trait]
//! impl Middleware for DropDebugActions {
//!     async fn before_reduce(&self, contexts: Vec<ActionContext>) -> anyhow::Result<Vec<ActionContext>> {
//!         Ok(contexts.into_iter().filter(|c| !c.action_type().starts_with("debug/")).collect())
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, trace};

use crate::core::ActionContext;
use crate::state::RootState;

/// A pipeline stage wrapping every dispatch.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Runs before reduction, outermost first.
    async fn before_reduce(&self, contexts: Vec<ActionContext>) -> Result<Vec<ActionContext>> {
        Ok(contexts)
    }

    /// Runs after reduction, innermost first.
    ///
    /// `state` is the root state the contexts' action produced. It is
    /// committed only once every after hook has returned; an error or an
    /// empty result discards it.
    async fn after_reduce(
        &self,
        contexts: Vec<ActionContext>,
        state: &RootState,
    ) -> Result<Vec<ActionContext>> {
        let _ = state;
        Ok(contexts)
    }
}

// =============================================================================
// Correlation
// =============================================================================

/// Tags every action with its correlation id.
///
/// Writes `meta.correlationId` on each action. If the action already carries
/// a valid `meta.correlationId` (for example, one produced by an effect
/// reacting to an earlier action), that id is adopted as the context's id, so
/// a chain of actions shares one trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationMiddleware;

impl CorrelationMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for CorrelationMiddleware {
    fn name(&self) -> &str {
        "correlation"
    }

    async fn before_reduce(&self, contexts: Vec<ActionContext>) -> Result<Vec<ActionContext>> {
        Ok(contexts
            .into_iter()
            .map(|mut ctx| {
                match ctx.action.correlation_id() {
                    Some(incoming) => {
                        trace!(cid = %incoming, replaced = %ctx.cid, "adopting incoming correlation id");
                        ctx.cid = incoming;
                    }
                    None => {
                        let action = ctx.action.clone().with_correlation(ctx.cid);
                        ctx = ctx.with_action(action);
                    }
                }
                ctx
            })
            .collect())
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Logs every dispatch before and after reduction.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn before_reduce(&self, contexts: Vec<ActionContext>) -> Result<Vec<ActionContext>> {
        for ctx in &contexts {
            debug!(
                cid = %ctx.cid,
                action_type = %ctx.action_type(),
                error = ctx.action.is_error(),
                "dispatching"
            );
        }
        Ok(contexts)
    }

    async fn after_reduce(
        &self,
        contexts: Vec<ActionContext>,
        state: &RootState,
    ) -> Result<Vec<ActionContext>> {
        for ctx in &contexts {
            let elapsed = Utc::now() - ctx.dispatched_at;
            debug!(
                cid = %ctx.cid,
                action_type = %ctx.action_type(),
                slices = state.len(),
                elapsed_us = elapsed.num_microseconds().unwrap_or(i64::MAX),
                "reduced"
            );
        }
        Ok(contexts)
    }
}
