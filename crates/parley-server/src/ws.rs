//! WebSocket transport for admitted connections.
//!
//! One task per connection: this function reads inbound frames and hands
//! them to the hub, while a spawned writer drains the connection's outbound
//! queue with a per-send timeout.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parley_shared::protocol::ProtocolViolation;
use tracing::{debug, warn};

use crate::error::HubError;
use crate::hub::{Admission, Hub};

pub async fn serve_connection(
    socket: WebSocket,
    hub: Arc<Hub>,
    admission: Admission,
    send_timeout: Duration,
) {
    let Admission {
        connection,
        mut events,
    } = admission;
    let (mut sink, mut stream) = socket.split();

    let conn_id = connection.id;
    let mut writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let frame = match event.to_json() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(conn = %conn_id, error = %e, "Failed to encode event");
                    continue;
                }
            };
            match tokio::time::timeout(send_timeout, sink.send(Message::Text(frame))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(conn = %conn_id, error = %e, "Socket write failed");
                    return;
                }
                Err(_) => {
                    warn!(conn = %conn_id, "Socket write timed out");
                    return;
                }
            }
        }
        // Queue closed: the hub dropped this connection.
        let _ = tokio::time::timeout(send_timeout, sink.close()).await;
    });
    let mut writer_done = false;

    loop {
        tokio::select! {
            _ = &mut writer, if !writer_done => {
                writer_done = true;
                break;
            }
            frame = stream.next() => {
                let outcome = match frame {
                    Some(Ok(Message::Text(raw))) => hub.handle_inbound(&connection, &raw).await,
                    Some(Ok(Message::Binary(_))) => {
                        Err(hub.report_violation(&connection, ProtocolViolation::Binary).await)
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(conn = %connection.id, error = %e, "Socket read failed");
                        break;
                    }
                };

                match outcome {
                    Err(HubError::TooManyViolations(_)) | Err(HubError::NotActive(_)) => break,
                    Err(e) => debug!(conn = %connection.id, error = %e, "Inbound message dropped"),
                    Ok(delivered) => debug!(conn = %connection.id, delivered, "Inbound message broadcast"),
                }
            }
        }
    }

    hub.disconnect(connection.id).await;
    if !writer_done {
        // Disconnect dropped the queue's sender, so the writer finishes.
        let _ = writer.await;
    }

    debug!(
        conn = %connection.id,
        identity = %connection.identity,
        connected_secs = (Utc::now() - connection.admitted_at).num_seconds(),
        "Transport closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use parley_shared::types::Identity;
    use tempfile::TempDir;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use crate::api::{build_router, test_state, AppState};
    use crate::hub::HubConfig;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WAIT: Duration = Duration::from_secs(5);

    async fn spawn_server(hub_config: HubConfig) -> (SocketAddr, AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, 1024, hub_config).await;
        let app = build_router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        (addr, state, dir)
    }

    async fn connect(addr: SocketAddr, state: &AppState, name: &str) -> Client {
        let token = state.tokens.issue(&Identity::new(name).unwrap());
        let (mut client, _) = connect_async(format!("ws://{addr}/ws?token={token}"))
            .await
            .unwrap();
        let welcome = next_event(&mut client).await;
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["identity"], name);
        client
    }

    async fn next_event(client: &mut Client) -> serde_json::Value {
        loop {
            let frame = tokio::time::timeout(WAIT, client.next())
                .await
                .expect("timed out waiting for an event")
                .expect("socket closed")
                .unwrap();
            if let ClientMessage::Text(raw) = frame {
                return serde_json::from_str(&raw).unwrap();
            }
        }
    }

    /// Read until the server closes the socket, returning the events seen.
    async fn read_until_closed(client: &mut Client) -> Vec<serde_json::Value> {
        let mut events = Vec::new();
        loop {
            let frame = tokio::time::timeout(WAIT, client.next())
                .await
                .expect("socket was not closed");
            match frame {
                Some(Ok(ClientMessage::Text(raw))) => events.push(serde_json::from_str(&raw).unwrap()),
                Some(Ok(ClientMessage::Close(_))) | Some(Err(_)) | None => return events,
                Some(Ok(_)) => {}
            }
        }
    }

    async fn wait_for_connections(hub: &Hub, expected: usize) {
        for _ in 0..100 {
            if hub.connection_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "expected {expected} connections, found {}",
            hub.connection_count().await
        );
    }

    #[tokio::test]
    async fn test_text_reaches_every_client() {
        let (addr, state, _dir) = spawn_server(HubConfig::default()).await;
        let mut alice = connect(addr, &state, "alice").await;
        let mut bob = connect(addr, &state, "bob").await;

        alice
            .send(ClientMessage::Text(r#"{"type":"text","text":"hi all"}"#.into()))
            .await
            .unwrap();

        for client in [&mut alice, &mut bob] {
            let event = next_event(client).await;
            assert_eq!(event["type"], "text_message");
            assert_eq!(event["sender"], "alice");
            assert_eq!(event["text"], "hi all");
        }
    }

    #[tokio::test]
    async fn test_binary_frame_is_a_violation() {
        let (addr, state, _dir) = spawn_server(HubConfig::default()).await;
        let mut alice = connect(addr, &state, "alice").await;

        alice
            .send(ClientMessage::Binary(vec![0xde, 0xad]))
            .await
            .unwrap();

        let event = next_event(&mut alice).await;
        assert_eq!(event["type"], "error");
        assert_eq!(event["code"], "protocol_violation");
        assert_eq!(state.hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_repeated_violations_close_the_socket() {
        let (addr, state, _dir) = spawn_server(HubConfig {
            max_protocol_violations: 2,
            ..HubConfig::default()
        })
        .await;
        let mut alice = connect(addr, &state, "alice").await;
        let mut bob = connect(addr, &state, "bob").await;

        for _ in 0..2 {
            alice
                .send(ClientMessage::Text("not json".into()))
                .await
                .unwrap();
        }

        let events = read_until_closed(&mut alice).await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e["code"] == "protocol_violation"));
        wait_for_connections(&state.hub, 1).await;

        // The remaining peer is unaffected.
        bob.send(ClientMessage::Text(r#"{"type":"text","text":"still here"}"#.into()))
            .await
            .unwrap();
        assert_eq!(next_event(&mut bob).await["text"], "still here");
    }

    #[tokio::test]
    async fn test_dropped_client_is_disconnected() {
        let (addr, state, _dir) = spawn_server(HubConfig::default()).await;
        let alice = connect(addr, &state, "alice").await;
        assert_eq!(state.hub.connection_count().await, 1);

        drop(alice);

        wait_for_connections(&state.hub, 0).await;
    }

    #[tokio::test]
    async fn test_invalid_token_gets_no_socket() {
        let (addr, _state, _dir) = spawn_server(HubConfig::default()).await;

        let result = connect_async(format!("ws://{addr}/ws?token=forged")).await;
        match result {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 401);
            }
            Err(e) => panic!("expected a 401 handshake failure, got {e}"),
            Ok(_) => panic!("handshake succeeded with a forged token"),
        }
    }
}
