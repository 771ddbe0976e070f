//! NDJSON output of execution events.

use std::io::Write;
use std::sync::Arc;

use cardexec_core::{CardRecord, ExecutionState};
use cardexec_engine::{ExecutionEvent, RecordStore};
use serde::Serialize;

use crate::error::AppResult;

/// One output line.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputLine<'a> {
    #[serde(rename_all = "camelCase")]
    Records {
        report_id: &'a str,
        card_id: &'a str,
        records: &'a [CardRecord],
    },
    #[serde(rename_all = "camelCase")]
    State {
        report_id: &'a str,
        card_id: &'a str,
        state: &'a ExecutionState,
    },
}

impl<'a> From<&'a ExecutionEvent> for OutputLine<'a> {
    fn from(event: &'a ExecutionEvent) -> Self {
        match event {
            ExecutionEvent::Records { key, records } => Self::Records {
                report_id: &key.report_id,
                card_id: &key.card_id,
                records,
            },
            ExecutionEvent::State { key, state } => Self::State {
                report_id: &key.report_id,
                card_id: &key.card_id,
                state,
            },
        }
    }
}

/// Writes events as NDJSON and mirrors them into the record store.
pub struct Printer<W> {
    out: W,
    store: Arc<RecordStore>,
    lines: u64,
}

impl<W: Write> Printer<W> {
    pub fn new(out: W, store: Arc<RecordStore>) -> Self {
        Self {
            out,
            store,
            lines: 0,
        }
    }

    pub fn handle(&mut self, event: &ExecutionEvent) -> AppResult<()> {
        match event {
            ExecutionEvent::Records { key, records } => self.store.apply_batch(key, records),
            ExecutionEvent::State { key, state } => self.store.set_state(key, state.clone()),
        }
        serde_json::to_writer(&mut self.out, &OutputLine::from(event))?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        self.lines += 1;
        Ok(())
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }
}
