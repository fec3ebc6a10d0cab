//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! [`WebSocketConnector`] dials the hub and presents the session token as an
//! `Authorization: Bearer` header on the upgrade request; each successful dial
//! yields a [`WebSocketTransport`]. Both `ws://` and `wss://` URLs are
//! supported via [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), signal_hub_client::HubError> {
//! use signal_hub_client::transport::{Connector, Transport};
//! use signal_hub_client::WebSocketConnector;
//!
//! let mut connector = WebSocketConnector::new("wss://hub.example.com/signal");
//! let mut transport = connector.connect("session-token").await?;
//! transport.send(r#"{"type":"ping"}"#.to_string()).await?;
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::transport::{Connector, Transport};

/// Type alias for the underlying WebSocket stream.
///
/// Public so callers can wrap a stream they opened themselves with
/// [`WebSocketTransport::from_stream`].
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ── Connector ───────────────────────────────────────────────────────

/// Opens authenticated WebSocket connections to the hub.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    live_reauth: bool,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            live_reauth: true,
        }
    }

    /// Whether the server accepts `refresh-token` frames on an open socket.
    /// Defaults to `true`; when `false` a token refresh redials.
    #[must_use]
    pub fn with_live_reauth(mut self, enabled: bool) -> Self {
        self.live_reauth = enabled;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&mut self, token: &str) -> Result<Box<dyn Transport>, HubError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| HubError::Connection(format!("invalid hub url: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| HubError::InvalidArgument("token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        debug!(url = %self.url, "connecting to WebSocket server");
        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(map_handshake_error)?;
        info!(url = %self.url, "WebSocket connection established");

        let mut transport = WebSocketTransport::from_stream(stream);
        transport.live_reauth = self.live_reauth;
        Ok(Box::new(transport))
    }
}

fn map_handshake_error(e: tokio_tungstenite::tungstenite::Error) -> HubError {
    use tokio_tungstenite::tungstenite::Error;
    match e {
        Error::Http(response)
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            HubError::AuthRejected(format!("handshake returned {}", response.status()))
        }
        Error::Io(io) => HubError::Io(io),
        other => HubError::Connection(other.to_string()),
    }
}

// ── Transport ───────────────────────────────────────────────────────

/// A [`Transport`] backed by a WebSocket connection.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method is cancel-safe. Dropping the future
/// returned by `recv` before it completes will not consume or lose any messages,
/// making it safe to use inside `tokio::select!`.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
    live_reauth: bool,
}

impl WebSocketTransport {
    /// Wrap an already-established WebSocket stream, e.g. one opened with
    /// custom TLS or proxy settings.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
            live_reauth: true,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), HubError> {
        if self.closed {
            return Err(HubError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| HubError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, HubError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(HubError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                // tungstenite queues the pong reply itself.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Binary(_) => {
                    warn!("received unexpected binary WebSocket frame, skipping");
                }
                Message::Frame(_) => {
                    debug!("received raw WebSocket frame, skipping");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), HubError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| HubError::TransportSend(e.to_string()))
    }

    fn supports_live_reauth(&self) -> bool {
        self.live_reauth
    }
}

#[cfg(test)]
#[cfg(feature = "transport-websocket")]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request, Response,
    };

    #[test]
    fn websocket_types_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
        assert_send::<WebSocketConnector>();
    }

    // ── Mock-server helpers ──────────────────────────────────────────────

    /// Start a local WebSocket server that checks the bearer header against
    /// `expected_token` and runs `handler` on the accepted connection.
    async fn start_mock_server<F, Fut>(expected_token: &'static str, handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let check = |request: &Request, response: Response| {
                let expected = format!("Bearer {expected_token}");
                let presented = request
                    .headers()
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok());
                if presented == Some(expected.as_str()) {
                    Ok(response)
                } else {
                    let mut rejection = ErrorResponse::new(None);
                    *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                    Err(rejection)
                }
            };
            if let Ok(ws) = tokio_tungstenite::accept_hdr_async(tcp, check).await {
                handler(ws).await;
            }
        });

        format!("ws://{addr}")
    }

    // ── Tests ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn connector_presents_bearer_token() {
        let url = start_mock_server("tok-1", |mut ws| async move {
            ws.send(Message::Text("welcome".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut connector = WebSocketConnector::new(url);
        let mut transport = connector.connect("tok-1").await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "welcome");
    }

    #[tokio::test]
    async fn rejected_token_maps_to_auth_rejected() {
        let url = start_mock_server("tok-1", |_ws| async {}).await;

        let mut connector = WebSocketConnector::new(url);
        let err = connector.connect("wrong").await.err().unwrap();
        assert!(matches!(err, HubError::AuthRejected(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        let mut connector = WebSocketConnector::new("ws://127.0.0.1:1");
        let err = connector.connect("tok").await.err().unwrap();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn invalid_url_is_a_connection_error() {
        let mut connector = WebSocketConnector::new("not a url");
        let err = connector.connect("tok").await.err().unwrap();
        assert!(matches!(err, HubError::Connection(_)));
    }

    #[tokio::test]
    async fn live_reauth_flag_reaches_the_transport() {
        let url = start_mock_server("tok", |mut ws| async move {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut connector = WebSocketConnector::new(url).with_live_reauth(false);
        let mut transport = connector.connect("tok").await.unwrap();
        assert!(!transport.supports_live_reauth());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn recv_skips_binary_frames() {
        let url = start_mock_server("tok", |mut ws| async move {
            ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            ws.send(Message::Text("after_binary".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketConnector::new(url).connect("tok").await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "after_binary");
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let url = start_mock_server("tok", |mut ws| async move {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut transport = WebSocketConnector::new(url).connect("tok").await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send("oops".to_string()).await.unwrap_err();
        assert!(matches!(err, HubError::TransportClosed));
    }

    #[tokio::test]
    async fn send_round_trip() {
        let url = start_mock_server("tok", |mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketConnector::new(url).connect("tok").await.unwrap();
        transport.send(r#"{"type":"ping"}"#.to_string()).await.unwrap();
        assert_eq!(
            transport.recv().await.unwrap().unwrap(),
            r#"{"type":"ping"}"#
        );
    }
}
