//! Streaming-HTTP driver.
//!
//! Reads the body chunk by chunk, frames and parses complete blocks, and
//! emits each parsed item as soon as it is post-processed. Whatever is
//! left in the buffer at end of stream becomes one final batch.

use cardexec_core::{CardRecord, ConnectionStatus, StateUpdate, StreamingHttpPayload};
use cardexec_http::HttpClient;
use cardexec_stream::{normalize_item, normalize_records, BlockFramer};
use cardexec_telemetry::Metrics;
use tracing::{debug, info};

use crate::error::ExecutionResult;
use crate::processor::to_records;
use crate::state::Emitter;

/// Tracks the first emission of one stream.
struct StreamEmitter<'a> {
    emitter: &'a Emitter,
    emitted: bool,
}

impl StreamEmitter<'_> {
    /// Post-process and emit one batch. Empty results are skipped.
    async fn push(&mut self, records: Vec<CardRecord>) -> ExecutionResult<()> {
        let records = normalize_records(self.emitter.process(records).await?);
        if records.is_empty() {
            return Ok(());
        }
        self.emitter.emit(&records)?;
        if !self.emitted {
            self.emitted = true;
            self.emitter.update(StateUpdate::success())?;
        }
        Ok(())
    }
}

pub(crate) async fn run_streaming(
    http: &HttpClient,
    payload: &StreamingHttpPayload,
    emitter: &Emitter,
) -> ExecutionResult<()> {
    emitter.update(
        StateUpdate::new()
            .with_connection(ConnectionStatus::Connecting)
            .with_stream_active(true),
    )?;

    let result = read_stream(http, payload, emitter).await;

    // Dropped silently once stale.
    let _ = emitter.update(
        StateUpdate::new()
            .with_connection(ConnectionStatus::Disconnected)
            .with_stream_active(false),
    );
    result
}

async fn read_stream(
    http: &HttpClient,
    payload: &StreamingHttpPayload,
    emitter: &Emitter,
) -> ExecutionResult<()> {
    let cancel = emitter.cancel();
    let mut body = http.open_stream(&payload.request, cancel).await?;
    emitter.update(StateUpdate::new().with_connection(ConnectionStatus::Connected))?;

    let mut framer = BlockFramer::new(payload.stream_format, payload.stream_delimiter.clone());
    let mut out = StreamEmitter {
        emitter,
        emitted: false,
    };

    while let Some(text) = body.next_text(cancel).await? {
        for block in framer.push(&text) {
            Metrics::stream_block(block.format.as_str());
            for item in framer.parse(&block) {
                out.push(to_records(normalize_item(item))).await?;
            }
        }
    }

    let residual = framer.finish();
    if !residual.is_empty() {
        debug!(items = residual.len(), "Parsing residual stream buffer");
        let items = residual.into_iter().map(normalize_item).collect();
        out.push(items).await?;
    }

    info!(
        bytes = body.bytes_read(),
        emitted = out.emitted,
        "Stream finished"
    );

    // A stream that never produced a record still leaves `loading`.
    if !out.emitted {
        emitter.update(StateUpdate::success())?;
    }
    Ok(())
}
