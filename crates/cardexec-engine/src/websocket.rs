//! WebSocket subscription driver.
//!
//! The connection runs in its own task. A consumer task turns its events
//! into state updates and post-processed record batches until the
//! invocation is cancelled or the connection stops for good.

use cardexec_core::{ConnectionStatus, LoadingState, StateUpdate, WebSocketPayload};
use cardexec_ws::{
    event_channel, spawn_connection, ClientInfo, WsConfig, WsError, WsEvent, WsHandle,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{ExecutionError, ExecutionResult};
use crate::processor::to_records;
use crate::state::Emitter;

/// Open the subscription and wait for the first connection.
///
/// On success the handle belongs to the invocation; events keep flowing
/// to the card after this returns.
pub(crate) async fn start_websocket(
    payload: &WebSocketPayload,
    emitter: &Emitter,
) -> ExecutionResult<WsHandle> {
    let ctx = emitter.ctx();
    let client = ClientInfo::new(&ctx.report_id, &ctx.card_id, &ctx.kind);
    let (events_tx, events_rx) = event_channel();

    let handle = spawn_connection(WsConfig::new(payload.clone(), client), events_tx);
    let stop = emitter.cancel().child_token();
    let consumer = tokio::spawn(consume_events(events_rx, emitter.clone(), stop.clone()));

    let connected = tokio::select! {
        biased;
        _ = emitter.cancel().cancelled() => Err(WsError::Cancelled),
        result = handle.wait_connected() => result,
    };

    match connected {
        Ok(()) => Ok(handle),
        Err(e) => {
            handle.close();
            // No event may land after the caller writes the error state.
            stop.cancel();
            if let Err(join) = consumer.await {
                warn!(error = %join, "WebSocket event consumer failed");
            }
            Err(e.into())
        }
    }
}

async fn consume_events(
    mut events: mpsc::Receiver<WsEvent>,
    emitter: Emitter,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if let Err(e) = handle_event(event, &emitter).await {
            if e.is_cancelled() {
                break;
            }
            error!(error = %e, "WebSocket event handling failed");
        }
    }
    debug!("WebSocket event consumer stopped");
}

async fn handle_event(event: WsEvent, emitter: &Emitter) -> ExecutionResult<()> {
    match event {
        WsEvent::Connecting { attempt } => {
            debug!(attempt, "WebSocket connecting");
            emitter.update(
                StateUpdate::new()
                    .with_connection(ConnectionStatus::Connecting)
                    .with_stream_active(false),
            )
        }
        WsEvent::Connected { session_id } => {
            debug!(%session_id, "WebSocket connected");
            emitter.update(
                StateUpdate::success()
                    .with_connection(ConnectionStatus::Connected)
                    .with_stream_active(true)
                    .without_error(),
            )
        }
        WsEvent::Message(value) => match emitter.process(to_records(value)).await {
            Ok(records) => {
                if records.is_empty() {
                    return Ok(());
                }
                emitter.emit(&records)?;
                emitter.update(StateUpdate::new().refreshed_now())
            }
            Err(ExecutionError::Processor(e)) => {
                warn!(error = %e, "Dropping WebSocket message");
                emitter.update(
                    StateUpdate::new().with_error(format!("Message processing error: {e}")),
                )
            }
            Err(e) => Err(e),
        },
        WsEvent::SubscriptionError(message) => {
            emitter.update(StateUpdate::new().with_error(format!("Subscription error: {message}")))
        }
        WsEvent::Disconnected { code, reason, error } => {
            debug!(code, %reason, "WebSocket disconnected");
            let mut update = StateUpdate::new()
                .with_connection(ConnectionStatus::Disconnected)
                .with_stream_active(false);
            if let Some(message) = error {
                update = update.with_error(message);
            }
            emitter.update(update)
        }
        WsEvent::Reconnecting {
            attempt,
            max_attempts,
            delay,
        } => {
            debug!(attempt, delay_ms = delay.as_millis() as u64, "WebSocket reconnect scheduled");
            emitter.update(
                StateUpdate::new()
                    .with_connection(ConnectionStatus::Reconnecting)
                    .with_error(format!(
                        "Connection lost. Reconnecting... ({attempt}/{max_attempts})"
                    )),
            )
        }
        WsEvent::Exhausted { attempts } => emitter.update(
            StateUpdate::new()
                .with_loading(LoadingState::Error)
                .with_connection(ConnectionStatus::Disconnected)
                .with_stream_active(false)
                .with_error(WsError::ReconnectExhausted(attempts).to_string()),
        ),
    }
}
