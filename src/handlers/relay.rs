use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;

use crate::{
    error::{AppError, Result},
    models::client::Client,
    models::protocol::{ClientMessage, ServerMessage},
    services::error_handler::ErrorContext,
    services::hub::Connection,
    state::AppState,
    validation::pairing::validate_identifier,
};

/// Handshake query parameters of the relay socket.
#[derive(Deserialize, Debug)]
pub struct ConnectParams {
    pub user_id: String,
    pub client_id: Option<String>,
    pub display_name: Option<String>,
}

/// Upgrades `GET /ws/relay` to a relay connection.
///
/// `user_id` is trusted as authenticated by the fronting auth layer.
pub async fn relay_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
) -> Result<Response> {
    validate_identifier("user_id", &params.user_id)?;
    if let Some(client_id) = &params.client_id {
        validate_identifier("client_id", client_id)?;
    }

    let max_message_bytes = state.config.hub.max_message_bytes;
    Ok(ws
        .max_message_size(max_message_bytes)
        .on_upgrade(move |socket| serve_connection(socket, state, params, addr))
        .into_response())
}

/// Liveness probe with hub counters.
pub async fn health(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let clients = state.hub.get_all_clients().await?.len();
    let sessions = state.hub.get_all_sessions().await?.len();
    let body = sonic_rs::to_string(&sonic_rs::json!({
        "status": "ok",
        "clients": clients,
        "sessions": sessions,
    }))?;
    Ok((StatusCode::OK, body))
}

async fn serve_connection(socket: WebSocket, state: AppState, params: ConnectParams, addr: SocketAddr) {
    let (mut sink, mut stream) = socket.split();

    let connection = match state
        .hub
        .register_client(
            &params.user_id,
            params.client_id,
            params.display_name,
            Some(addr.to_string()),
        )
        .await
    {
        Ok(connection) => connection,
        Err(e) => {
            let ctx = ErrorContext {
                operation: "register_client",
                user_id: Some(&params.user_id),
                ..ErrorContext::default()
            };
            let error = state.errors.handle(&e, &ctx);
            let _ = send(&mut sink, &ServerMessage::Error {
                code: error.code,
                message: error.message,
            })
            .await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    let Connection {
        client,
        sender,
        mut receiver,
        closed,
    } = connection;

    let writer_closed = closed.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                message = receiver.recv() => match message {
                    Some(message) => {
                        if send(&mut sink, &message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = writer_closed.cancelled() => {
                    // flush what the hub queued before closing
                    while let Ok(message) = receiver.try_recv() {
                        if send(&mut sink, &message).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let max_message_bytes = state.config.hub.max_message_bytes;
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = closed.cancelled() => break,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(_))) => {
                let reply = reject(
                    &state,
                    &client,
                    "decode_message",
                    None,
                    AppError::Validation("Binary frames are not supported".to_string()),
                );
                let _ = sender.try_send(reply);
                continue;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(client_id = %client.client_id, "WebSocket read failed: {}", e);
                break;
            }
        };

        if text.as_str().len() > max_message_bytes {
            let reply = reject(
                &state,
                &client,
                "decode_message",
                None,
                AppError::Validation(format!("Message exceeds {} bytes", max_message_bytes)),
            );
            let _ = sender.try_send(reply);
            continue;
        }

        let message = match sonic_rs::from_str::<ClientMessage>(text.as_str()) {
            Ok(message) => message,
            Err(e) => {
                let reply = reject(
                    &state,
                    &client,
                    "decode_message",
                    None,
                    AppError::Validation(format!("Malformed message: {}", e)),
                );
                let _ = sender.try_send(reply);
                continue;
            }
        };

        let (operation, session_id) = describe(&message);
        match dispatch(&state, &client, message).await {
            Ok(Some(reply)) => {
                if sender.send(reply).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                let reply = reject(&state, &client, operation, session_id.as_deref(), e);
                let _ = sender.try_send(reply);
            }
        }
    }

    if let Err(e) = state.hub.unregister_client(&client.client_id).await {
        tracing::warn!(client_id = %client.client_id, "⚠️ Failed to unregister client: {}", e);
    }
    closed.cancel();
    drop(sender);
    let _ = writer.await;
}

/// Executes one client frame. Pushed messages go through the hub; the return
/// value is the direct reply, if any.
async fn dispatch(state: &AppState, client: &Client, message: ClientMessage) -> Result<Option<ServerMessage>> {
    let client_id = client.client_id.as_str();
    match message {
        ClientMessage::RequestPairing {
            role,
            device_info,
            force,
        } => {
            let result = state
                .hub
                .request_pairing(client_id, &role, device_info, force)
                .await?;
            Ok(Some(ServerMessage::PairingResult(result)))
        }
        ClientMessage::CancelPairing { role } => {
            state.hub.cancel_pairing(client_id, role).await?;
            Ok(Some(state.hub.pairing_status(client_id, Some(role)).await?))
        }
        ClientMessage::PairingStatus { role } => {
            Ok(Some(state.hub.pairing_status(client_id, role).await?))
        }
        ClientMessage::Apdu { session_id, apdu } => {
            let raw = hex::decode(apdu.trim())
                .map_err(|_| AppError::Validation("APDU must be hexadecimal".to_string()))?;
            let sequence = state.hub.relay_apdu(&session_id, client_id, &raw).await?;
            Ok(Some(ServerMessage::RelayAck {
                session_id,
                sequence,
            }))
        }
        ClientMessage::EndSession { session_id } => {
            state.hub.end_session(&session_id, client_id).await?;
            Ok(None)
        }
        ClientMessage::Heartbeat => Ok(Some(ServerMessage::HeartbeatResponse {
            timestamp: state.clock.now().timestamp_millis(),
        })),
    }
}

fn describe(message: &ClientMessage) -> (&'static str, Option<String>) {
    match message {
        ClientMessage::RequestPairing { .. } => ("request_pairing", None),
        ClientMessage::CancelPairing { .. } => ("cancel_pairing", None),
        ClientMessage::PairingStatus { .. } => ("pairing_status", None),
        ClientMessage::Apdu { session_id, .. } => ("relay_apdu", Some(session_id.clone())),
        ClientMessage::EndSession { session_id } => ("end_session", Some(session_id.clone())),
        ClientMessage::Heartbeat => ("heartbeat", None),
    }
}

fn reject(
    state: &AppState,
    client: &Client,
    operation: &str,
    session_id: Option<&str>,
    error: AppError,
) -> ServerMessage {
    let ctx = ErrorContext {
        operation,
        session_id,
        client_id: Some(&client.client_id),
        user_id: Some(&client.user_id),
    };
    let error = state.errors.handle(&error, &ctx);
    ServerMessage::Error {
        code: error.code,
        message: error.message,
    }
}

async fn send<S>(sink: &mut S, message: &ServerMessage) -> std::result::Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let json = match sonic_rs::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("❌ Failed to serialize server message: {}", e);
            return Ok(());
        }
    };
    sink.send(Message::Text(json.into())).await.map_err(|_| ())
}
