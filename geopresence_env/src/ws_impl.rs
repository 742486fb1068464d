//! Production hub transport: negotiate over HTTP, then a WebSocket.

use crate::error::EnvError;
use crate::transport::{HubConnector, HubSocket};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

/// Redirect hops followed before negotiation is abandoned.
const MAX_NEGOTIATE_REDIRECTS: usize = 100;

/// Options for the negotiate step.
#[derive(Debug, Clone, Default)]
pub struct NegotiateOptions {
    /// Connect straight to the WebSocket endpoint
    pub skip_negotiation: bool,

    /// Bearer token sent on negotiate and upgrade
    pub access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    connection_id: Option<String>,
    connection_token: Option<String>,
    url: Option<String>,
    access_token: Option<String>,
    available_transports: Option<Vec<AvailableTransport>>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailableTransport {
    transport: String,
    #[serde(default)]
    transfer_formats: Vec<String>,
}

impl NegotiateResponse {
    fn offers_websockets(&self) -> bool {
        match &self.available_transports {
            None => true,
            Some(transports) => transports.iter().any(|t| {
                t.transport == "WebSockets" && t.transfer_formats.iter().any(|f| f == "Text")
            }),
        }
    }
}

/// Where to open the socket, after negotiation.
struct Negotiated {
    url: Url,
    access_token: Option<String>,
}

/// Connector that negotiates with the hub and upgrades to a WebSocket.
pub struct WsConnector {
    http: reqwest::Client,
    options: NegotiateOptions,
}

impl WsConnector {
    /// Creates a connector with its own HTTP client.
    pub fn new(options: NegotiateOptions) -> Self {
        Self::with_client(reqwest::Client::new(), options)
    }

    /// Creates a connector sharing an existing HTTP client.
    pub fn with_client(http: reqwest::Client, options: NegotiateOptions) -> Self {
        Self { http, options }
    }

    async fn negotiate(&self, endpoint: Url) -> Result<Negotiated, EnvError> {
        let mut base = endpoint;
        let mut token = self.options.access_token.clone();

        for _ in 0..MAX_NEGOTIATE_REDIRECTS {
            let url = negotiate_url(&base);
            let mut request = self.http.post(url.clone());
            if let Some(token) = &token {
                request = request.bearer_auth(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| EnvError::negotiation(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(EnvError::negotiation(format!("{} returned {}", url.path(), status)));
            }
            let body: NegotiateResponse = response
                .json()
                .await
                .map_err(|e| EnvError::negotiation(e.to_string()))?;

            if let Some(error) = body.error {
                return Err(EnvError::negotiation(error));
            }
            if let Some(redirect) = body.url {
                debug!(host = ?base.host_str(), "negotiate redirected");
                base = Url::parse(&redirect)
                    .map_err(|e| EnvError::InvalidEndpoint(format!("{redirect}: {e}")))?;
                token = body.access_token.or(token);
                continue;
            }
            if !body.offers_websockets() {
                return Err(EnvError::negotiation("hub does not offer WebSockets with text frames"));
            }

            let id = body.connection_token.or(body.connection_id);
            return Ok(Negotiated {
                url: websocket_url(&base, id.as_deref())?,
                access_token: token,
            });
        }

        Err(EnvError::negotiation("too many negotiate redirects"))
    }
}

#[async_trait]
impl HubConnector for WsConnector {
    type Socket = WsSocket;

    async fn connect(&self, endpoint: &str) -> Result<WsSocket, EnvError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| EnvError::InvalidEndpoint(format!("{endpoint}: {e}")))?;

        let target = if self.options.skip_negotiation {
            Negotiated {
                url: websocket_url(&endpoint, None)?,
                access_token: self.options.access_token.clone(),
            }
        } else {
            self.negotiate(endpoint).await?
        };

        let mut request = target
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| EnvError::connection(e.to_string()))?;
        if let Some(token) = &target.access_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| EnvError::connection(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| EnvError::connection(e.to_string()))?;
        info!(host = ?target.url.host_str(), status = %response.status(), "websocket open");

        Ok(WsSocket {
            stream,
            closed: false,
        })
    }
}

/// An open WebSocket to the hub.
pub struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

#[async_trait]
impl HubSocket for WsSocket {
    async fn send(&mut self, frame: String) -> Result<(), EnvError> {
        if self.closed {
            return Err(EnvError::Closed);
        }
        self.stream
            .send(Message::Text(frame))
            .await
            .map_err(|e| EnvError::network(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, EnvError>> {
        if self.closed {
            return None;
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return Some(
                        String::from_utf8(bytes)
                            .map_err(|e| EnvError::network(format!("non-UTF-8 frame: {e}"))),
                    );
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "websocket closed by peer");
                    self.closed = true;
                    return None;
                }
                // Ping/Pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.closed = true;
                    return Some(Err(EnvError::network(e.to_string())));
                }
                None => {
                    self.closed = true;
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "websocket close");
        }
    }
}

/// `{base}/negotiate?negotiateVersion=1`, keeping any existing query.
fn negotiate_url(base: &Url) -> Url {
    let mut url = base.clone();
    let path = format!("{}/negotiate", base.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    url
}

/// WebSocket form of a hub URL, with the connection token appended.
fn websocket_url(base: &Url, connection_token: Option<&str>) -> Result<Url, EnvError> {
    let mut url = base.clone();
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(EnvError::InvalidEndpoint(format!("unsupported scheme '{other}'")));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| EnvError::InvalidEndpoint(format!("cannot use scheme '{scheme}'")))?;
    if let Some(token) = connection_token {
        url.query_pairs_mut().append_pair("id", token);
    }
    Ok(url)
}
