//! WebSocket endpoint of a ComfyUI node.
//!
//! [`WsEndpoint`] holds what is needed to open the event stream for one
//! node. Call [`WsEndpoint::connect`] to establish a live
//! [`WsConnection`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use fleet_core::node::NodeAuth;
use fleet_core::types::DbId;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::NodeError;

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
pub struct WsEndpoint {
    node_id: DbId,
    ws_url: String,
    auth: NodeAuth,
}

/// A live WebSocket connection to a node.
pub struct WsConnection {
    pub node_id: DbId,
    pub stream: WsStream,
}

impl WsEndpoint {
    /// Derive the WebSocket URL from the node's HTTP host.
    pub fn new(node_id: DbId, host: &str, auth: NodeAuth) -> Self {
        Self {
            node_id,
            ws_url: ws_url_for(host),
            auth,
        }
    }

    pub fn node_id(&self) -> DbId {
        self.node_id
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Open `/ws?clientId=<client_id>`. ComfyUI addresses run events to
    /// the client id used at submission, so the same id must be used there.
    ///
    /// A 401/403 handshake response maps to [`NodeError::Auth`].
    pub async fn connect(&self, client_id: &str) -> Result<WsConnection, NodeError> {
        let url = format!("{}/ws?clientId={client_id}", self.ws_url);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| NodeError::Connection(format!("Invalid WebSocket URL {url}: {e}")))?;

        if let Some(value) = authorization_header(&self.auth) {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| NodeError::Auth(format!("Invalid credentials: {e}")))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        let (stream, _response) = connect_async(request).await.map_err(|e| match e {
            tokio_tungstenite::tungstenite::Error::Http(response)
                if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
            {
                NodeError::Auth(format!("WebSocket handshake answered {}", response.status()))
            }
            other => NodeError::Connection(format!(
                "Failed to connect to node at {}: {other}",
                self.ws_url
            )),
        })?;

        tracing::info!(
            node_id = self.node_id,
            client_id = %client_id,
            "Connected to node at {}",
            self.ws_url,
        );

        Ok(WsConnection {
            node_id: self.node_id,
            stream,
        })
    }
}

/// `http://` -> `ws://`, `https://` -> `wss://`.
pub fn ws_url_for(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if let Some(rest) = host.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = host.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{host}")
    }
}

fn authorization_header(auth: &NodeAuth) -> Option<String> {
    match auth {
        NodeAuth::None => None,
        NodeAuth::Basic { username, password } => Some(format!(
            "Basic {}",
            STANDARD.encode(format!("{username}:{password}"))
        )),
        NodeAuth::Bearer { token } => Some(format!("Bearer {token}")),
    }
}
