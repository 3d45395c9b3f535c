// Counter demo: drives a sluice engine end to end from the command line.

mod config;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::ready;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sluice::{
    effect_fn, merge, reactive_fn, Action, ActionFilter, CorrelationMiddleware, EffectStreamExt,
    EngineBuilder, EntityCollection, Hydrate, LoggingMiddleware, MergeStrategy, ServiceUnavailable,
    Slice, SERVICE_UNAVAILABLE,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "counter-demo")]
#[command(about = "Run the counter scenario against a sluice engine")]
struct Cli {
    /// Number of Increment actions to dispatch
    #[arg(long, default_value_t = 6)]
    increments: u32,

    /// Override SLUICE_INITIAL_COUNT
    #[arg(long)]
    initial: Option<i64>,

    /// Override SLUICE_RESET_DELAY_MS
    #[arg(long)]
    reset_delay_ms: Option<u64>,

    /// Make the backup effect succeed instead of always failing
    #[arg(long)]
    healthy_backup: bool,

    /// Print the final root state as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Todo {
    id: u32,
    title: String,
    done: bool,
}

type Todos = EntityCollection<u32, Todo>;

fn counter_slice(initial: i64) -> Slice<i64> {
    Slice::new("counter", initial)
        .on("Increment", |count, _| count + 1)
        .on("Reset", move |_, _| initial)
}

fn todos_slice() -> Slice<Todos> {
    Slice::new("todos", Todos::new())
        .on_result("todos/loaded", |todos, action| {
            let incoming = Todos::from_entities(
                action.payload_as::<Vec<Todo>>()?,
                |t| t.id,
                MergeStrategy::Overwrite,
            )?;
            Ok(merge(todos, &incoming, MergeStrategy::Overwrite)?)
        })
        .on_result("todos/added", |todos, action| {
            let todo: Todo = action.payload_as()?;
            let incoming = Todos::from_iter([(todo.id, todo)]);
            Ok(merge(todos, &incoming, MergeStrategy::FailIfDuplicate)?)
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sluice=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(initial) = cli.initial {
        config.initial_count = initial;
    }
    if let Some(ms) = cli.reset_delay_ms {
        config.reset_delay = Duration::from_millis(ms);
    }
    tracing::info!(?config, "configuration loaded");

    let threshold = config.reset_threshold;
    let delay = config.reset_delay;
    let auto_reset = reactive_fn("auto-reset", move |sources| {
        sources
            .dispatched()
            .filter(move |d| {
                ready(d.action().is("Increment") && d.state.get::<i64>("counter").is_some_and(|c| *c > threshold))
            })
            .delay(delay)
            .map(|_| Action::new("Reset"))
            .boxed()
    });

    let healthy = cli.healthy_backup;
    let backup = effect_fn("backup", ActionFilter::of_type("Reset"), move |_, state| {
        let snapshot = state.to_json().map_err(anyhow::Error::from);
        async move {
            anyhow::ensure!(healthy, "backup target unreachable");
            let snapshot = snapshot?;
            tracing::info!(%snapshot, "state backed up");
            Ok(vec![Action::new("backup/completed")])
        }
    });

    let outage_watch = effect_fn("outage-watch", ActionFilter::of_type(SERVICE_UNAVAILABLE), |action, _| async move {
        if let Some(outage) = ServiceUnavailable::from_action(&action) {
            tracing::warn!(
                original = %outage.original_action,
                reason = %outage.reason,
                "service unavailable"
            );
        }
        Ok(vec![])
    });

    let handle = EngineBuilder::new()
        .with_config(config.engine.clone())
        .with_slice(counter_slice(config.initial_count))
        .with_slice(todos_slice())
        .with_middleware(CorrelationMiddleware::new())
        .with_middleware(LoggingMiddleware::new())
        .with_reactive_effect(auto_reset)
        .with_resilient_effect(backup)
        .with_effect(outage_watch)
        .build()?
        .start();

    for _ in 0..cli.increments {
        handle.dispatch(Action::new("Increment")).await?;
    }
    let peak = handle.state().get::<i64>("counter").copied().unwrap_or_default();
    tracing::info!(counter = peak, "increments dispatched");

    if peak > threshold {
        let mut states = handle.subscribe();
        let initial = config.initial_count;
        tokio::time::timeout(delay + Duration::from_secs(5), async {
            while states.current().get::<i64>("counter") != Some(&initial) {
                if states.changed().await.is_none() {
                    break;
                }
            }
        })
        .await
        .context("auto-reset never happened")?;
        tracing::info!(counter = initial, "counter reset");
    }

    let todos = vec![
        Todo { id: 1, title: "write reducers".into(), done: true },
        Todo { id: 2, title: "wire effects".into(), done: false },
    ];
    handle
        .dispatch(Action::new("todos/loaded").with_payload(&todos)?)
        .await?;

    // Adding an existing id is a merge conflict; state is left as it was.
    if let Err(e) = handle
        .dispatch(Action::new("todos/added").with_payload(&todos[0])?)
        .await
    {
        tracing::warn!(error = %e, "duplicate todo rejected");
    }

    // Restore the counter from an external snapshot.
    handle
        .dispatch(Hydrate::from_state("counter", &42i64)?.into_action())
        .await?;

    // Let the resilient backup effect finish its retries.
    let retry = &config.engine.resilience.retry;
    let settle = retry.attempt_timeout.min(Duration::from_millis(200)) + retry.max_backoff.min(Duration::from_secs(1));
    tokio::time::sleep(settle).await;
    if let Some(state) = handle.retry().circuit_state("backup") {
        tracing::info!(circuit = %state, "backup circuit");
    }

    let state = handle.state();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&state.to_json()?)?);
    } else {
        println!(
            "counter = {}, todos = {}",
            state.get::<i64>("counter").copied().unwrap_or_default(),
            state.get::<Todos>("todos").map(|t| t.len()).unwrap_or_default()
        );
    }

    handle.shutdown().await;
    Ok(())
}
