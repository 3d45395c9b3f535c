//! Broadcast bus for reduced actions.
//!
//! After an action has passed the whole middleware chain, the pipeline
//! publishes it here together with the root state it produced. Effects and
//! other observers subscribe to this bus.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: Slow receivers may miss actions
//! - **In-memory only**: Actions are not persisted
//! - **Ordered**: Every receiver sees actions in reduction order
//!
//! A lagging receiver logs how many actions it missed and keeps going.

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::core::{Action, ActionContext};
use crate::state::RootState;

/// Default channel capacity for the action bus.
pub const DEFAULT_CAPACITY: usize = 10000;

/// One reduced action and the root state it produced.
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// The action's context after the after-reduce phase.
    pub context: ActionContext,
    /// Root state right after this action was reduced.
    pub state: RootState,
}

impl Dispatched {
    pub fn action(&self) -> &Action {
        &self.context.action
    }
}

/// Broadcast channel of [`Dispatched`] records.
///
/// # Example
///
/// ```ignore
/// let bus = ActionBus::new();
/// let mut actions = bus.actions();
///
/// // ... dispatch through the pipeline ...
///
/// while let Some(action) = actions.next().await {
///     println!("reduced {}", action.action_type());
/// }
/// ```
#[derive(Clone)]
pub struct ActionBus {
    sender: broadcast::Sender<Dispatched>,
}

impl ActionBus {
    /// Create a new bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new bus with the specified capacity.
    ///
    /// The capacity determines how many actions can be buffered before
    /// slow receivers start lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a reduced action.
    ///
    /// Returns the number of receivers that received it.
    pub fn publish(&self, context: ActionContext, state: RootState) -> usize {
        self.sender
            .send(Dispatched { context, state })
            .unwrap_or(0)
    }

    /// Subscribe to raw records.
    ///
    /// Only actions published after this call are received.
    pub fn subscribe(&self) -> broadcast::Receiver<Dispatched> {
        self.sender.subscribe()
    }

    /// Stream of reduced actions with the state they produced.
    ///
    /// Subscribes immediately, not on first poll.
    pub fn dispatched(&self) -> BoxStream<'static, Dispatched> {
        stream::unfold(self.subscribe(), |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(record) => return Some((record, receiver)),
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "action bus lagged, missed actions");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// Stream of reduced actions.
    ///
    /// Subscribes immediately, not on first poll.
    pub fn actions(&self) -> BoxStream<'static, Action> {
        self.dispatched().map(|record| record.context.action).boxed()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ActionBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActionBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
