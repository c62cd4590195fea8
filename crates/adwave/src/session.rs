//! WebSocket session: inbound batch protocol and the outbound writer task.
//!
//! One writer task owns the socket sink; everything else sends through
//! [`ClientSender`]. Inbound, a session is: one JSON batch request, zero or
//! more binary voice recordings, a `finished` control message, then the
//! batch runs. Validation failures before the batch starts produce a
//! `fatal_error` and nothing else.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, Stream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;

use crate::pipeline::batch::run_batch;
use crate::pipeline::job::JobContext;
use crate::protocol::{ClientMessage, ClientSender, OutboundFrame, ServerMessage};
use crate::providers::{AdRequest, AdType};
use crate::routes::AppState;
use crate::slots::ReservationId;

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("Invalid batch request: {0}")]
    BadRequest(String),
    #[error("No locations provided")]
    NoLocations,
    #[error("Failed to retrieve voices library")]
    NoVoices,
    #[error("Invalid reservation ID or no slots available")]
    InvalidReservation,
    #[error("connection closed before the batch request")]
    ClosedEarly,
}

pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sink, inbound) = socket.split();
    let (tx, rx) = mpsc::channel::<OutboundFrame>(256);
    let writer = tokio::spawn(write_frames(sink, rx));

    run_session(inbound, ClientSender::new(tx), state).await;

    // All senders are gone once the session returns; the writer drains the
    // queue and exits.
    if let Err(e) = writer.await {
        tracing::error!(error = %e, "Socket writer task aborted");
    }
}

/// Forward queued frames to the socket until every sender is dropped or the
/// client goes away.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundFrame>,
) {
    while let Some(frame) = rx.recv().await {
        let message = match frame {
            OutboundFrame::Control(control) => match serde_json::to_string(&control) {
                Ok(json) => Message::Text(json.into()),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode control message");
                    continue;
                }
            },
            OutboundFrame::Audio(bytes) => Message::Binary(bytes),
        };
        if let Err(e) = sink.send(message).await {
            tracing::warn!(error = %e, "Client connection lost");
            break;
        }
    }
    let _ = sink.close().await;
}

/// Generic over the inbound stream so tests can drive a session from a
/// scripted frame sequence.
async fn run_session<S>(mut inbound: S, sender: ClientSender, state: Arc<AppState>)
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    if let Err(e) = session_inner(&mut inbound, &sender, &state).await {
        tracing::warn!(error = %e, "Session rejected");
        sender
            .send(ServerMessage::FatalError {
                message: e.to_string(),
            })
            .await;
    }
}

async fn session_inner<S>(
    inbound: &mut S,
    sender: &ClientSender,
    state: &AppState,
) -> Result<(), SessionError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let request = read_request(inbound).await?;
    if request.locations.is_empty() {
        return Err(SessionError::NoLocations);
    }
    sender.send(ServerMessage::Received).await;

    let voices = state
        .providers
        .speech
        .voices()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Voice library fetch failed");
            SessionError::NoVoices
        })?;
    if voices.is_empty() {
        return Err(SessionError::NoVoices);
    }

    // Reject an unusable ticket before the client uploads recordings.
    if request.ad_type == AdType::Custom {
        let valid = match request.slot_reservation_id.as_deref() {
            Some(raw) => {
                let ticket = ReservationId::from_raw(raw);
                state.pool.has_available_slot(Some(&ticket)).await
            }
            None => false,
        };
        if !valid {
            return Err(SessionError::InvalidReservation);
        }
    }

    let recordings = read_preamble(inbound).await;
    tracing::info!(
        locations = request.locations.len(),
        recordings = recordings.len(),
        "Batch request accepted"
    );

    let ctx = JobContext {
        sender: sender.clone(),
        providers: state.providers.clone(),
        pool: Arc::clone(&state.pool),
        acquire_timeout: state.acquire_timeout,
    };
    run_batch(
        ctx,
        Arc::new(request),
        Arc::new(voices),
        Arc::new(recordings),
    )
    .await;
    Ok(())
}

/// The first text frame must be the batch request.
async fn read_request<S>(inbound: &mut S) -> Result<AdRequest, SessionError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                return serde_json::from_str(&text)
                    .map_err(|e| SessionError::BadRequest(e.to_string()));
            }
            Ok(Message::Binary(_)) => {
                return Err(SessionError::BadRequest(
                    "expected a JSON batch request first".to_string(),
                ));
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Socket error before batch request");
                break;
            }
        }
    }
    Err(SessionError::ClosedEarly)
}

/// Buffer binary recordings until a `finished` control message. A closed or
/// failed connection ends the preamble with whatever arrived; the batch
/// still runs so held resources get cleaned up.
async fn read_preamble<S>(inbound: &mut S) -> Vec<Bytes>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut recordings = Vec::new();
    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(Message::Binary(bytes)) => recordings.push(bytes),
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Finished) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring unrecognized control message");
                }
            },
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Socket error during preamble");
                break;
            }
        }
    }
    recordings
}
