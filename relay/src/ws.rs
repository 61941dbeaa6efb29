use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use courier_helpers::envelope::{b64_decode, TransportType};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use nanoid::nanoid;
use serde_json::Value;
use tokio::time::{interval, sleep_until, Instant};
use tracing::{error, info, info_span, Instrument};

use crate::{http::requests_direct_response, relay::Relay};

/// Creates the router for a WebSocket relay instance.
pub(crate) fn create_ws_router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/", get(handler))
        .with_state(relay)
}

async fn handler(ws: WebSocketUpgrade, State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        handle_socket(socket, relay).instrument(info_span!("websocket_connection"))
    })
}

/// Runs the receive loop for one relay WebSocket connection with a
/// heartbeat ping and an idle timeout. Direct responses are written back
/// on the same socket that carried the request.
async fn handle_socket(socket: WebSocket, relay: Arc<Relay>) {
    let (mut sender, mut receiver) = socket.split();
    let mut heartbeat = interval(Duration::from_millis(
        relay.config.ws_heartbeat_interval_ms,
    ));
    let receive_timeout = Duration::from_millis(relay.config.ws_receive_timeout_ms);
    let mut idle_deadline = Instant::now() + receive_timeout;

    info!("websocket connection received");
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            _ = sleep_until(idle_deadline) => {
                info!(
                    "closing websocket connection after {}ms of inactivity",
                    relay.config.ws_receive_timeout_ms
                );
                break;
            }
            received = receiver.next() => {
                match received {
                    None => break,
                    Some(Err(err)) => {
                        // The stream ends with `None` on the next poll when
                        // the connection is actually gone.
                        error!("websocket connection error: {err}");
                    }
                    Some(Ok(message)) => {
                        idle_deadline = Instant::now() + receive_timeout;
                        match message {
                            Message::Text(text) => {
                                handle_inbound_payload(
                                    &relay,
                                    &mut sender,
                                    text.as_str().as_bytes().to_vec(),
                                    false,
                                )
                                .await;
                            }
                            Message::Binary(bytes) => {
                                handle_inbound_payload(&relay, &mut sender, bytes.to_vec(), true)
                                    .await;
                            }
                            Message::Close(close) => {
                                if let Some(close_frame) = close {
                                    info!(
                                        "connection closed, client sent close with code {} and reason `{}`",
                                        close_frame.code,
                                        close_frame.reason.as_str(),
                                    );
                                } else {
                                    info!("connection closed, client sent close without close frame");
                                }
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    }
    info!("websocket connection closed");
}

async fn handle_inbound_payload(
    relay: &Arc<Relay>,
    sender: &mut SplitSink<WebSocket, Message>,
    message_data: Vec<u8>,
    binary: bool,
) {
    let message_json = serde_json::from_slice::<Value>(&message_data).ok();
    let direct_response_requested = message_json
        .as_ref()
        .map(requests_direct_response)
        .unwrap_or(false);
    let txn_id = direct_response_requested.then(|| nanoid!());

    async {
        info!("inbound websocket message received");
        if let Err(err) = relay
            .enqueue_inbound(&message_data, txn_id.clone(), TransportType::Ws)
            .await
        {
            error!("failed to route inbound message: {err}");
            return;
        }

        let Some(txn_id) = txn_id else {
            return;
        };

        let Some(response_data) = relay.wait_for_direct_response(&txn_id).await else {
            // The peer gets no reply on timeout, the agent's eventual
            // response is dropped by a later consumer.
            return;
        };
        let response_body = match b64_decode(&response_data.response) {
            Ok(response_body) => response_body,
            Err(err) => {
                error!("direct response has invalid payload encoding: {err}");
                return;
            }
        };

        // Reply in the same frame type the request arrived in.
        let send_result = if binary {
            sender.send(Message::Binary(response_body.into())).await
        } else {
            match String::from_utf8(response_body) {
                Ok(text) => sender.send(Message::Text(text.into())).await,
                Err(non_utf8) => {
                    sender
                        .send(Message::Binary(non_utf8.into_bytes().into()))
                        .await
                }
            }
        };
        if let Err(err) = send_result {
            error!("failed to send direct response on websocket: {err}");
        }
    }
    .instrument(info_span!("ws_message_handler"))
    .await
}
