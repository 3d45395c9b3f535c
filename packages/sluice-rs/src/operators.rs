//! Stream operators for composing reactive effects.
//!
//! | Operator              | Behavior                                                   |
//! |-----------------------|------------------------------------------------------------|
//! | `of_type`             | keep actions of one type                                   |
//! | `of_types`            | keep actions of any listed type                            |
//! | `take_until_action`   | end the stream once a stop action is seen                  |
//! | `with_latest_state`   | pair each item with the latest root state                  |
//! | `delay`               | emit each item after a fixed delay                         |
//! | `switch_map`          | start an inner stream per item, canceling the previous one |
//!
//! `switch_map` drives its inner streams on a spawned task, so it must be
//! called from inside a Tokio runtime (reactive effects are wired on one).
//!
//! # Example: a start/stop ticker
//!
//! ```ignore
//! reactive_fn("ticker", |sources| {
//!     let stops = sources.clone();
//!     sources
//!         .actions()
//!         .of_type("timer/start")
//!         .switch_map(move |_| {
//!             ticks(Duration::from_secs(1))
//!                 .map(|_| Action::new("timer/tick"))
//!                 .take_until_action(stops.actions(), "timer/stop")
//!         })
//!         .boxed()
//! })
//! ```

use std::time::Duration;

use futures::future::ready;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::Action;
use crate::state::{RootState, StateSubscription};

/// Buffer between a `switch_map` driver task and its consumer.
const SWITCH_BUFFER: usize = 64;

/// Operators over streams of actions.
pub trait ActionStreamExt: Stream<Item = Action> + Sized + Send + 'static {
    /// Keep only actions of `action_type`.
    fn of_type(self, action_type: impl Into<String>) -> BoxStream<'static, Action> {
        let action_type = action_type.into();
        self.filter(move |action| ready(action.is(&action_type)))
            .boxed()
    }

    /// Keep only actions whose type is in `action_types`.
    fn of_types<I, T>(self, action_types: I) -> BoxStream<'static, Action>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let types: Vec<String> = action_types.into_iter().map(Into::into).collect();
        self.filter(move |action| ready(types.iter().any(|t| action.is(t))))
            .boxed()
    }
}

impl<S> ActionStreamExt for S where S: Stream<Item = Action> + Sized + Send + 'static {}

/// General-purpose operators used by reactive effects.
pub trait EffectStreamExt: Stream + Sized + Send + 'static
where
    Self::Item: Send + 'static,
{
    /// End this stream as soon as an action of `stop_type` appears on
    /// `actions`. Pending work inside this stream is dropped at that point.
    fn take_until_action<A>(self, actions: A, stop_type: impl Into<String>) -> BoxStream<'static, Self::Item>
    where
        A: Stream<Item = Action> + Send + 'static,
    {
        let stop_type = stop_type.into();
        let stop = async move {
            let mut stops = Box::pin(actions.filter(move |a| ready(a.is(&stop_type))));
            stops.next().await;
        };
        self.take_until(stop).boxed()
    }

    /// Pair every item with the root state current at the moment it flows.
    fn with_latest_state(self, state: StateSubscription) -> BoxStream<'static, (Self::Item, RootState)> {
        self.map(move |item| (item, state.current())).boxed()
    }

    /// Emit every item `delay` after it arrives, preserving order.
    fn delay(self, delay: Duration) -> BoxStream<'static, Self::Item> {
        self.then(move |item| async move {
            tokio::time::sleep(delay).await;
            item
        })
        .boxed()
    }

    /// Map each item to an inner stream and forward only the newest one.
    ///
    /// A new item cancels the inner stream started by the previous item.
    /// The output ends when the source has ended and the last inner stream
    /// has finished.
    fn switch_map<U, S, F>(self, mut f: F) -> BoxStream<'static, U>
    where
        U: Send + 'static,
        S: Stream<Item = U> + Send + 'static,
        F: FnMut(Self::Item) -> S + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<U>(SWITCH_BUFFER);
        let mut source = self.boxed();

        tokio::spawn(async move {
            let mut inner: Option<JoinHandle<()>> = None;
            let mut consumer_gone = false;

            loop {
                tokio::select! {
                    next = source.next() => {
                        let Some(item) = next else { break };
                        if let Some(previous) = inner.take() {
                            previous.abort();
                        }
                        let mut stream = Box::pin(f(item));
                        let tx = tx.clone();
                        inner = Some(tokio::spawn(async move {
                            while let Some(value) = stream.next().await {
                                if tx.send(value).await.is_err() {
                                    break;
                                }
                            }
                        }));
                    }
                    _ = tx.closed() => {
                        consumer_gone = true;
                        break;
                    }
                }
            }

            if let Some(current) = inner {
                if consumer_gone {
                    current.abort();
                } else {
                    let _ = current.await;
                }
            }
        });

        stream::unfold(rx, |mut rx| async move {
            let value = rx.recv().await?;
            Some((value, rx))
        })
        .boxed()
    }
}

impl<S> EffectStreamExt for S
where
    S: Stream + Sized + Send + 'static,
    S::Item: Send + 'static,
{
}

/// A stream yielding `()` every `period`, first tick after one period.
pub fn ticks(period: Duration) -> BoxStream<'static, ()> {
    let start = tokio::time::Instant::now() + period;
    let interval = tokio::time::interval_at(start, period);
    stream::unfold(interval, |mut interval| async move {
        interval.tick().await;
        Some(((), interval))
    })
    .boxed()
}
