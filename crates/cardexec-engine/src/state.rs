//! Generation-guarded execution state.
//!
//! Every invocation gets a generation number. Updates and emissions carry
//! the generation they belong to and are dropped once a newer invocation
//! (or a cancel) has bumped it, so a stale transport can never touch the
//! card again.

use std::sync::Arc;

use cardexec_core::{CardRecord, ExecutionState, LoadingState, QueryVariant, StateUpdate};
use cardexec_telemetry::Metrics;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{ExecutionError, ExecutionResult};
use crate::observer::ExecutionObserver;
use crate::processor::{run_post_processors, PostProcessor, ProcessorContext};

struct Tracked {
    generation: u64,
    state: ExecutionState,
}

pub(crate) struct StateCell {
    tracked: Mutex<Tracked>,
    observer: Arc<dyn ExecutionObserver>,
}

impl StateCell {
    pub(crate) fn new(observer: Arc<dyn ExecutionObserver>) -> Self {
        Self {
            tracked: Mutex::new(Tracked {
                generation: 0,
                state: ExecutionState::default(),
            }),
            observer,
        }
    }

    pub(crate) fn snapshot(&self) -> ExecutionState {
        self.tracked.lock().state.clone()
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.tracked.lock().generation == generation
    }

    fn apply_locked(&self, tracked: &mut Tracked, update: &StateUpdate) {
        tracked.state.apply(update);
        self.observer.on_state_change(update, &tracked.state);
    }

    /// Start an invocation: `loading` with the error cleared.
    /// `None` while another invocation is still loading.
    pub(crate) fn begin(&self) -> Option<u64> {
        let mut tracked = self.tracked.lock();
        if tracked.state.is_loading() {
            return None;
        }
        tracked.generation += 1;
        let update = StateUpdate::new()
            .with_loading(LoadingState::Loading)
            .without_error();
        self.apply_locked(&mut tracked, &update);
        Some(tracked.generation)
    }

    /// Apply `update` if `generation` is still current.
    pub(crate) fn apply(&self, generation: u64, update: StateUpdate) -> bool {
        let mut tracked = self.tracked.lock();
        if tracked.generation != generation {
            trace!(generation, current = tracked.generation, "Dropping stale state update");
            return false;
        }
        self.apply_locked(&mut tracked, &update);
        true
    }

    /// Emit `records` if `generation` is still current.
    pub(crate) fn emit(&self, generation: u64, records: &[CardRecord]) -> bool {
        let tracked = self.tracked.lock();
        if tracked.generation != generation {
            trace!(generation, current = tracked.generation, "Dropping stale records");
            return false;
        }
        self.observer.on_records_update(records);
        true
    }

    /// Emit regardless of generation.
    pub(crate) fn emit_now(&self, records: &[CardRecord]) {
        let _tracked = self.tracked.lock();
        self.observer.on_records_update(records);
    }

    /// Invalidate every running invocation and force `idle/disconnected`.
    pub(crate) fn reset(&self) -> u64 {
        let mut tracked = self.tracked.lock();
        tracked.generation += 1;
        self.apply_locked(&mut tracked, &StateUpdate::reset());
        tracked.generation
    }
}

/// Partial state updates from inside a custom handler.
#[derive(Clone)]
pub struct StateReporter {
    cell: Arc<StateCell>,
    generation: u64,
}

impl StateReporter {
    pub(crate) fn new(cell: Arc<StateCell>, generation: u64) -> Self {
        Self { cell, generation }
    }

    /// Apply `update`. `false` once the invocation is stale.
    pub fn update(&self, update: StateUpdate) -> bool {
        self.cell.apply(self.generation, update)
    }

    pub fn is_current(&self) -> bool {
        self.cell.is_current(self.generation)
    }
}

impl std::fmt::Debug for StateReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateReporter")
            .field("generation", &self.generation)
            .finish()
    }
}

/// One invocation's view of the card: state updates, post-processing and
/// emission, all bound to its generation and cancellation token.
#[derive(Clone)]
pub(crate) struct Emitter {
    cell: Arc<StateCell>,
    generation: u64,
    cancel: CancellationToken,
    variant: QueryVariant,
    ctx: Arc<ProcessorContext>,
    post: Arc<[Arc<dyn PostProcessor>]>,
}

impl Emitter {
    pub(crate) fn new(
        cell: Arc<StateCell>,
        generation: u64,
        cancel: CancellationToken,
        ctx: ProcessorContext,
        post: Vec<Arc<dyn PostProcessor>>,
    ) -> Self {
        Self {
            cell,
            generation,
            cancel,
            variant: ctx.query.variant(),
            ctx: Arc::new(ctx),
            post: post.into(),
        }
    }

    pub(crate) fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn ctx(&self) -> &ProcessorContext {
        &self.ctx
    }

    pub(crate) fn reporter(&self) -> StateReporter {
        StateReporter::new(self.cell.clone(), self.generation)
    }

    /// Apply `update`, failing with `Cancelled` once stale.
    pub(crate) fn update(&self, update: StateUpdate) -> ExecutionResult<()> {
        if self.cell.apply(self.generation, update) {
            Ok(())
        } else {
            Err(ExecutionError::Cancelled)
        }
    }

    /// Run the post-processors over one batch, interrupted by cancellation.
    pub(crate) async fn process(&self, records: Vec<CardRecord>) -> ExecutionResult<Vec<CardRecord>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ExecutionError::Cancelled),
            result = run_post_processors(&self.ctx, records, &self.post) => Ok(result?),
        }
    }

    pub(crate) fn emit(&self, records: &[CardRecord]) -> ExecutionResult<()> {
        if !self.cell.emit(self.generation, records) {
            return Err(ExecutionError::Cancelled);
        }
        Metrics::records_emitted(self.variant.as_str(), records.len());
        Ok(())
    }
}
