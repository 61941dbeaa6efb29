use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use courier_helpers::envelope::{b64_decode, TransportType};
use nanoid::nanoid;
use serde_json::Value;
use tracing::{error, info, info_span, Instrument};

use crate::relay::Relay;

const DEFAULT_RESPONSE_CONTENT_TYPE: &str = "application/json";

const INVITATION_HINT: &str = "You have received a connection invitation. To accept the \
    invitation, paste it into your agent application.";

/// Creates the router for an HTTP relay instance. The invitation hint and
/// the message handler share the root path, split by method.
pub(crate) fn create_http_router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/", get(invite_handler).post(message_handler))
        .with_state(relay)
}

/// Handler for inbound invitations. A request carrying a `c_i` query
/// parameter receives a hint for human visitors, anything else is an
/// empty 200.
async fn invite_handler(Query(params): Query<HashMap<String, String>>) -> Response {
    if params.contains_key("c_i") {
        INVITATION_HINT.into_response()
    } else {
        StatusCode::OK.into_response()
    }
}

/// Handler for inbound messages.
///
/// The accepted payload is enqueued for the agent; when the sender
/// requested a direct response via `~transport.return_route`, the handler
/// blocks until the correlated response arrives or the timeout elapses,
/// returning an empty 200 on timeout.
async fn message_handler(State(relay): State<Arc<Relay>>, body: Bytes) -> Response {
    let message_data = body.to_vec();
    let message_json = serde_json::from_slice::<Value>(&message_data).ok();
    let direct_response_requested = message_json
        .as_ref()
        .map(requests_direct_response)
        .unwrap_or(false);
    let txn_id = direct_response_requested.then(|| nanoid!());

    async {
        info!("inbound http message received");
        if let Err(err) = relay
            .enqueue_inbound(&message_data, txn_id.clone(), TransportType::Http)
            .await
        {
            error!("failed to route inbound message: {err}");
            return StatusCode::BAD_REQUEST.into_response();
        }

        let Some(txn_id) = txn_id else {
            return StatusCode::OK.into_response();
        };

        match relay.wait_for_direct_response(&txn_id).await {
            Some(response_data) => {
                let content_type = response_data
                    .content_type
                    .unwrap_or_else(|| DEFAULT_RESPONSE_CONTENT_TYPE.to_string());
                match b64_decode(&response_data.response) {
                    Ok(response_body) => {
                        ([(header::CONTENT_TYPE, content_type)], response_body).into_response()
                    }
                    Err(err) => {
                        error!("direct response has invalid payload encoding: {err}");
                        StatusCode::OK.into_response()
                    }
                }
            }
            None => StatusCode::OK.into_response(),
        }
    }
    .instrument(info_span!("http_message_handler"))
    .await
}

/// A sender asks for a synchronous reply by setting
/// `~transport.return_route` to any value other than `none`.
pub(crate) fn requests_direct_response(message: &Value) -> bool {
    message
        .get("~transport")
        .and_then(|transport| transport.get("return_route"))
        .and_then(Value::as_str)
        .map(|mode| mode != "none")
        .unwrap_or(false)
}
