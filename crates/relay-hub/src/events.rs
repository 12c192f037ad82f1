use crate::api::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use relay_core::Subscription;
use tracing::{debug, info, warn};

/// Streams relay events as JSON text frames until either side goes away.
///
/// The subscription is taken before the upgrade completes, so a client sees
/// everything published after its handshake returns.
pub async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let subscription = state.coordinator.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, subscription))
}

async fn stream_events(socket: WebSocket, mut subscription: Subscription) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    info!(event = "event_stream_open");

    loop {
        tokio::select! {
            next = subscription.next() => {
                let Some(event) = next else {
                    break;
                };
                let text = match serde_json::to_string(&event) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(event = "event_encode_failed", seq = event.seq, error = %err);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    debug!(event = "event_stream_send_failed", seq = event.seq);
                    break;
                }
            }
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = ws_sender.close().await;
    info!(event = "event_stream_closed", dropped = subscription.dropped());
}

#[cfg(test)]
mod tests {
    use crate::api::tests::{spawn_app, TEST_KEY};
    use crate::api::API_KEY_HEADER;
    use futures_util::StreamExt;
    use relay_core::{CommandStatus, EventKind, RelayEvent};
    use serde_json::json;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn next_event<S>(stream: &mut S) -> RelayEvent
    where
        S: futures_util::Stream<
                Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
            > + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("event before timeout")
                .expect("stream open")
                .expect("frame");
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).expect("event json");
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stream_reports_registration_and_transitions_in_order() {
        let app = spawn_app().await;
        let mut request = format!("ws://{}/api/events", app.addr)
            .into_client_request()
            .expect("request");
        request
            .headers_mut()
            .insert(API_KEY_HEADER, HeaderValue::from_static(TEST_KEY));
        let (mut stream, _) = connect_async(request).await.expect("connect");

        app.register("c1").await;
        let command_id = app.submit("c1", "echo hi").await;
        app.post(
            &format!("/api/commands/{command_id}/claim"),
            json!({"client_id": "c1"}),
        )
        .await;

        let registered = next_event(&mut stream).await;
        assert_eq!(
            registered.kind,
            EventKind::ClientRegistered {
                client_id: "c1".to_string()
            }
        );
        let created = next_event(&mut stream).await;
        assert!(matches!(created.kind, EventKind::CommandCreated { .. }));
        let claimed = next_event(&mut stream).await;
        assert_eq!(
            claimed.kind,
            EventKind::CommandTransitioned {
                command_id,
                client_id: "c1".to_string(),
                from: CommandStatus::Pending,
                to: CommandStatus::Running,
            }
        );
        assert!(registered.seq < created.seq && created.seq < claimed.seq);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn browser_clients_authenticate_with_query_key() {
        let app = spawn_app().await;
        let url = format!("ws://{}/api/events?api_key={TEST_KEY}", app.addr);
        let (mut stream, _) = connect_async(url).await.expect("connect");

        app.register("c9").await;
        let event = next_event(&mut stream).await;
        assert_eq!(
            event.kind,
            EventKind::ClientRegistered {
                client_id: "c9".to_string()
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stream_requires_api_key() {
        let app = spawn_app().await;
        let result = connect_async(format!("ws://{}/api/events", app.addr)).await;
        assert!(result.is_err());
    }
}
