//! WebSocket transport to the relay.
//!
//! The socket is split into a writer task and a reader task that bridge text
//! frames to a [`RawChannel`]. Ping, pong and binary frames never reach the
//! channel; a close frame or socket error ends the reader, which closes the
//! receiving half.

use futures_util::{SinkExt, StreamExt};
use protocol::error::{ProtocolError, Result};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use url::Url;

use super::{RawChannel, CHANNEL_CAPACITY};

/// Validate a relay URL: it must parse and use the ws or wss scheme.
pub fn parse_relay_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url)
        .map_err(|e| ProtocolError::Transport(format!("invalid relay url {url}: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(ProtocolError::Transport(format!(
            "relay url must use ws or wss, got {other}"
        ))),
    }
}

/// Connect to the relay and return the raw channel over the socket.
pub async fn connect_websocket(url: &str) -> Result<RawChannel> {
    let url = parse_relay_url(url)?;

    tracing::info!(url = %url, "Connecting to relay");

    let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|e| match e {
        WsError::Io(io_err) => ProtocolError::from(io_err),
        _ => ProtocolError::ConnectionClosed(format!("WebSocket connection failed: {}", e)),
    })?;

    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let (incoming_tx, incoming_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

    // Writer: drains outgoing frames, closes the socket once every sender is gone
    tokio::spawn(async move {
        while let Some(frame) = outgoing_rx.recv().await {
            if let Err(e) = ws_sink.send(WsMessage::Text(frame)).await {
                tracing::error!(error = %e, "failed to send WebSocket message");
                return;
            }
        }
        if let Err(e) = ws_sink.close().await {
            tracing::debug!(error = %e, "WebSocket close failed");
        }
    });

    // Reader: forwards text frames until close or error
    tokio::spawn(async move {
        while let Some(result) = ws_stream.next().await {
            match result {
                Ok(WsMessage::Text(text)) => {
                    if incoming_tx.send(text).await.is_err() {
                        break;
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    tracing::info!(?frame, "relay closed connection");
                    break;
                }
                Ok(WsMessage::Binary(data)) => {
                    tracing::warn!(len = data.len(), "ignoring binary frame from relay");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket error");
                    break;
                }
                _ => {
                    // Ping/pong are answered by tungstenite
                }
            }
        }
    });

    Ok(RawChannel::new(outgoing_tx, incoming_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relay_url_accepts_ws_schemes() {
        assert!(parse_relay_url("ws://127.0.0.1:8080/ws").is_ok());
        assert!(parse_relay_url("wss://relay.example.com/ws").is_ok());
    }

    #[test]
    fn test_parse_relay_url_rejects_other_schemes() {
        assert!(matches!(
            parse_relay_url("https://relay.example.com"),
            Err(ProtocolError::Transport(_))
        ));
        assert!(matches!(
            parse_relay_url("not a url"),
            Err(ProtocolError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 9 (discard) is closed on any sane test host
        let result = connect_websocket("ws://127.0.0.1:9/ws").await;
        assert!(result.is_err());
    }
}
