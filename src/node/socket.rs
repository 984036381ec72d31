use async_trait::async_trait;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{NodeMessage, PlayerEvent};
use super::rest::RestNodeClient;
use super::{NodeClient, NodeError};

const CLIENT_NAME: &str = concat!("open-music-audio/", env!("CARGO_PKG_VERSION"));

type NodeStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything needed to reach a node.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    pub host: String,
    pub password: String,
    pub rest_port: u16,
    pub ws_port: u16,
    pub timeout: Duration,
    pub user_id: u64,
}

/// A live node session: the REST handle plus a token that is cancelled when
/// the event stream goes away.
pub struct NodeSession {
    pub session_id: String,
    pub client: Arc<dyn NodeClient>,
    pub lifeline: CancellationToken,
}

impl fmt::Debug for NodeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSession")
            .field("session_id", &self.session_id)
            .field("closed", &self.lifeline.is_cancelled())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    /// The node did not complete the handshake in time. Worth retrying.
    #[error("node handshake timed out")]
    Timeout,

    #[error("node handshake failed: {0}")]
    Fatal(#[from] NodeError),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<NodeSession, ConnectError>;
}

/// Opens the node websocket and forwards its events to the reactor channel.
#[derive(Debug, Clone)]
pub struct WsConnector {
    events: UnboundedSender<PlayerEvent>,
}

impl WsConnector {
    pub fn new(events: UnboundedSender<PlayerEvent>) -> Self {
        Self { events }
    }

    async fn handshake(params: &ConnectParams) -> Result<(NodeStream, String), NodeError> {
        let url = format!("ws://{}:{}/v4/websocket", params.host, params.ws_port);
        let mut request = url.into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&params.password).map_err(|e| NodeError::Header(e.to_string()))?,
        );
        headers.insert("User-Id", HeaderValue::from(params.user_id));
        headers.insert("Client-Name", HeaderValue::from_static(CLIENT_NAME));

        let (mut stream, _) = tokio_tungstenite::connect_async(request).await?;

        // El primer mensaje útil debe ser `ready` con el id de sesión
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<NodeMessage>(&text)? {
                    NodeMessage::Ready {
                        session_id,
                        resumed,
                    } => {
                        debug!("Sesión {} lista (reanudada: {})", session_id, resumed);
                        return Ok((stream, session_id));
                    }
                    other => debug!("Mensaje previo a ready ignorado: {:?}", other),
                },
                Some(Ok(Message::Close(_))) | None => return Err(NodeError::Closed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl NodeConnector for WsConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<NodeSession, ConnectError> {
        let (stream, session_id) =
            match tokio::time::timeout(params.timeout, Self::handshake(params)).await {
                Ok(result) => result?,
                Err(_) => return Err(ConnectError::Timeout),
            };

        let client = RestNodeClient::new(
            &params.host,
            params.rest_port,
            params.password.clone(),
            session_id.clone(),
        )?;

        let lifeline = CancellationToken::new();
        tokio::spawn(read_events(stream, self.events.clone(), lifeline.clone()));

        info!(
            "🔗 Conectado al nodo {}:{} (sesión {})",
            params.host, params.ws_port, session_id
        );
        Ok(NodeSession {
            session_id,
            client: Arc::new(client),
            lifeline,
        })
    }
}

async fn read_events(
    mut stream: NodeStream,
    events: UnboundedSender<PlayerEvent>,
    lifeline: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = lifeline.cancelled() => {
                let _ = stream.close(None).await;
                break;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<NodeMessage>(&text) {
                        Ok(NodeMessage::Event(event)) => {
                            if let Some(event) = event.into_player_event() {
                                if events.send(event).is_err() {
                                    debug!("Reactor detenido, cerrando lector de eventos");
                                    break;
                                }
                            }
                        }
                        Ok(NodeMessage::Stats { players, playing_players }) => {
                            debug!("📊 Nodo: {} jugadores, {} reproduciendo", players, playing_players);
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Mensaje del nodo inválido: {}", e),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    warn!("🔌 El nodo cerró el websocket: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("❌ Error en el websocket del nodo: {}", e);
                    break;
                }
                None => break,
            }
        }
    }

    lifeline.cancel();
}
