use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::model::{LoadResult, RoomId, Track, VoiceState};
use super::{NodeClient, NodeError};

/// REST side of a node session.
#[derive(Debug, Clone)]
pub struct RestNodeClient {
    http: Client,
    base: Url,
    password: String,
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

impl RestNodeClient {
    pub fn new(
        host: &str,
        port: u16,
        password: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Result<Self, NodeError> {
        let base = Url::parse(&format!("http://{}:{}/", host, port))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("open-music-audio/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base,
            password: password.into(),
            session_id: session_id.into(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn player_url(&self, room: RoomId) -> Result<Url, NodeError> {
        Ok(self.base.join(&format!(
            "v4/sessions/{}/players/{}",
            self.session_id, room
        ))?)
    }

    async fn send(&self, method: Method, url: Url, body: Option<Value>) -> Result<reqwest::Response, NodeError> {
        let mut request = self
            .http
            .request(method, url)
            .header("Authorization", &self.password);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        // El nodo devuelve un JSON con `message`; si no, usamos el texto plano
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.message)
            .unwrap_or(text);
        Err(NodeError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn update_player(&self, room: RoomId, body: Value) -> Result<(), NodeError> {
        let url = self.player_url(room)?;
        debug!("PATCH jugador {}: {}", room, body);
        self.send(Method::PATCH, url, Some(body)).await?;
        Ok(())
    }
}

#[async_trait]
impl NodeClient for RestNodeClient {
    async fn version(&self) -> Result<String, NodeError> {
        let url = self.base.join("version")?;
        let response = self.send(Method::GET, url, None).await?;
        Ok(response.text().await?.trim().to_string())
    }

    async fn load_tracks(&self, identifier: &str) -> Result<LoadResult, NodeError> {
        let mut url = self.base.join("v4/loadtracks")?;
        url.query_pairs_mut().append_pair("identifier", identifier);

        let response = self.send(Method::GET, url, None).await?;
        let bytes = response.bytes().await?;
        let result: LoadResult = serde_json::from_slice(&bytes)?;

        if let LoadResult::Error(ref exception) = result {
            warn!(
                "⚠️ El nodo no pudo cargar '{}': {}",
                identifier,
                exception.message.as_deref().unwrap_or(&exception.cause)
            );
        }
        Ok(result)
    }

    async fn play(&self, room: RoomId, track: &Track, volume: u16) -> Result<(), NodeError> {
        self.update_player(
            room,
            json!({
                "track": {
                    "encoded": track.encoded,
                    "userData": track.user_data,
                },
                "position": 0,
                "volume": volume,
                "paused": false,
            }),
        )
        .await
    }

    async fn stop(&self, room: RoomId) -> Result<(), NodeError> {
        self.update_player(room, json!({ "track": { "encoded": null } }))
            .await
    }

    async fn set_paused(&self, room: RoomId, paused: bool) -> Result<(), NodeError> {
        self.update_player(room, json!({ "paused": paused })).await
    }

    async fn seek(&self, room: RoomId, position: Duration) -> Result<(), NodeError> {
        let millis = u64::try_from(position.as_millis()).unwrap_or(u64::MAX);
        self.update_player(room, json!({ "position": millis })).await
    }

    async fn set_volume(&self, room: RoomId, volume: u16) -> Result<(), NodeError> {
        self.update_player(room, json!({ "volume": volume.min(1000) }))
            .await
    }

    async fn update_voice(&self, room: RoomId, voice: &VoiceState) -> Result<(), NodeError> {
        self.update_player(room, json!({ "voice": voice })).await
    }

    async fn destroy(&self, room: RoomId) -> Result<(), NodeError> {
        let url = self.player_url(room)?;
        match self.send(Method::DELETE, url, None).await {
            Ok(_) => Ok(()),
            // Un jugador que ya no existe está destruido de todas formas
            Err(NodeError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                debug!("Jugador {} ya no existía en el nodo", room);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
