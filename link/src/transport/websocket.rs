use super::{Incoming, Transport, WireSocket};
use crate::{
    error::{Result, TriageLinkError},
    event_router::DisconnectReason,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        error::Error as WsError,
        handshake::client::Response as WsResponse,
        http::header::{HeaderValue, AUTHORIZATION},
        protocol::Message,
    },
    MaybeTlsStream,
};

type WebSocketStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Binary frames larger than this are dropped instead of decoded.
const MAX_WS_BINARY_MESSAGE_BYTES: usize = 16 << 20;

/// tokio-tungstenite transport with the token in the `Authorization` header.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

fn http_rejection(response: &WsResponse) -> TriageLinkError {
    let status = response.status().as_u16();
    let body_text = response
        .body()
        .as_ref()
        .filter(|b| !b.is_empty())
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();
    match status {
        401 => TriageLinkError::AuthenticationError(
            "Unauthorized: WebSocket requires valid credentials".to_string(),
        ),
        403 => TriageLinkError::AuthenticationError(
            "Forbidden: Access to WebSocket denied".to_string(),
        ),
        code if body_text.is_empty() => {
            TriageLinkError::WebSocketError(format!("WebSocket HTTP error: {}", code))
        },
        code => TriageLinkError::WebSocketError(format!(
            "WebSocket HTTP error {}: {}",
            code, body_text
        )),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str, token: &str) -> Result<Box<dyn WireSocket>> {
        let mut request = url.into_client_request().map_err(|e| {
            TriageLinkError::WebSocketError(format!("Failed to build WebSocket request: {}", e))
        })?;

        let header_value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
            TriageLinkError::ConfigurationError(format!(
                "Invalid token for Authorization header: {}",
                e
            ))
        })?;
        request.headers_mut().insert(AUTHORIZATION, header_value);

        match connect_async(request).await {
            Ok((stream, _)) => {
                log::debug!("[triage-link] WebSocket upgrade to {} complete", url);
                Ok(Box::new(WebSocketSocket { stream }))
            },
            Err(WsError::Http(response)) => Err(http_rejection(&response)),
            Err(e) => Err(TriageLinkError::WebSocketError(format!("Connection failed: {}", e))),
        }
    }
}

struct WebSocketSocket {
    stream: WebSocketStream,
}

#[async_trait]
impl WireSocket for WebSocketSocket {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TriageLinkError::WebSocketError(format!("Failed to send frame: {}", e)))
    }

    async fn recv(&mut self) -> Result<Incoming> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Incoming::Text(text.as_str().to_string()));
                },
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > MAX_WS_BINARY_MESSAGE_BYTES {
                        log::warn!(
                            "[triage-link] Dropping binary frame of {} bytes",
                            data.len()
                        );
                        continue;
                    }
                    match String::from_utf8(data.to_vec()) {
                        Ok(text) => return Ok(Incoming::Text(text)),
                        Err(_) => {
                            log::warn!("[triage-link] Dropping non UTF-8 binary frame");
                            continue;
                        },
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = self.stream.send(Message::Pong(payload)).await;
                },
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {},
                Some(Ok(Message::Close(frame))) => {
                    let reason = match frame {
                        Some(f) => {
                            DisconnectReason::with_code(f.reason.to_string(), f.code.into())
                        },
                        None => DisconnectReason::new("Server closed connection"),
                    };
                    return Ok(Incoming::Closed(reason));
                },
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Ok(Incoming::Closed(DisconnectReason::new("WebSocket stream ended")));
                },
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
