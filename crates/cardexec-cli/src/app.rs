//! Runs every configured card and streams their events to an output.

use std::io::Write;
use std::sync::Arc;

use cardexec_core::Params;
use cardexec_engine::{CardExecution, CardRegistry, ChannelObserver, ExecutionEvent, RecordStore};
use cardexec_http::HttpClient;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::output::Printer;

/// Outcome of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub cards: usize,
    pub failed: usize,
    pub lines: u64,
}

pub struct Application {
    registry: CardRegistry,
    store: Arc<RecordStore>,
    events: mpsc::UnboundedReceiver<ExecutionEvent>,
}

impl Application {
    /// Build one execution per card. All cards share one HTTP client and
    /// one event channel.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let http = HttpClient::new(config.http.client_config())?;
        let (tx, events) = mpsc::unbounded_channel();
        let registry = CardRegistry::new();

        for card in &config.cards {
            let key = card.key();
            registry.get_or_try_insert_with(key.clone(), || {
                let mut builder = CardExecution::builder(key.clone(), &card.kind)
                    .runtime_params(config.runtime_params.clone())
                    .card_settings(card.settings.clone())
                    .http_client(http.clone())
                    .observer(Arc::new(ChannelObserver::new(key.clone(), tx.clone())));
                if let Some(query) = &card.query {
                    builder = builder.query(query.clone());
                }
                builder.build()
            })?;
        }
        info!(cards = registry.len(), "Cards loaded");

        Ok(Self {
            registry,
            store: Arc::new(RecordStore::new(config.append_records)),
            events,
        })
    }

    pub fn store(&self) -> Arc<RecordStore> {
        self.store.clone()
    }

    /// Execute every card with `params`, writing events to `out`.
    ///
    /// With `follow`, live subscriptions keep running until Ctrl-C.
    /// Otherwise everything is cancelled once each card's first execution
    /// has returned.
    pub async fn run<W>(self, params: Params, follow: bool, out: W) -> AppResult<RunSummary>
    where
        W: Write + Send + 'static,
    {
        let Self {
            registry,
            store,
            events,
        } = self;

        let done = CancellationToken::new();
        let printer = spawn_printer(events, Printer::new(out, store), done.clone());

        let keys = registry.keys();
        let executions: Vec<CardExecution> =
            keys.iter().filter_map(|key| registry.get(key)).collect();
        let results = join_all(
            executions
                .iter()
                .map(|execution| execution.execute_query(params.clone())),
        )
        .await;

        let mut failed = 0;
        for (execution, result) in executions.iter().zip(results) {
            if let Err(e) = result {
                failed += 1;
                error!(card = %execution.key(), error = %e, "Card failed");
            }
        }

        if follow {
            info!("Following live cards, press Ctrl-C to stop");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
        }

        registry.cancel_all();
        done.cancel();
        let lines = printer
            .await
            .map_err(|e| AppError::Io(std::io::Error::other(e)))??;

        info!(cards = keys.len(), failed, lines, "Run finished");
        Ok(RunSummary {
            cards: keys.len(),
            failed,
            lines,
        })
    }
}

fn spawn_printer<W>(
    mut events: mpsc::UnboundedReceiver<ExecutionEvent>,
    mut printer: Printer<W>,
    done: CancellationToken,
) -> JoinHandle<AppResult<u64>>
where
    W: Write + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => printer.handle(&event)?,
                    None => break,
                },
                _ = done.cancelled() => {
                    while let Ok(event) = events.try_recv() {
                        printer.handle(&event)?;
                    }
                    break;
                }
            }
        }
        Ok(printer.lines())
    })
}
