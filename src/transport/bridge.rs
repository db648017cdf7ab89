//! Session gateway transport
//!
//! Speaks JSON over HTTP to a gateway process that owns the messaging
//! sessions and the wire protocol. One [`GatewayTransport`] per bot
//! identity; live events are polled from the gateway.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::compose::{FormattedText, MediaItem};
use crate::models::{BotId, BotIdentity, RawMessage};

use super::{
    PeerHandle, SentMessage, SourceEvent, Transport, TransportError, TransportFactory,
    TransportResult,
};

const EVENT_BUFFER: usize = 256;

// ============================================================================
// Configuration
// ============================================================================

/// Gateway client configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway base URL
    pub base_url: String,

    /// Request timeout
    pub timeout: Duration,

    /// Interval between event polls for subscribed peers
    pub event_poll_interval: Duration,
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
            event_poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_event_poll_interval(mut self, interval: Duration) -> Self {
        self.event_poll_interval = interval;
        self
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ConnectRequest<'a> {
    bot_id: BotId,
    api_id: i32,
    api_hash: &'a str,
    session: &'a str,
}

#[derive(Debug, Deserialize)]
struct ConnectResponse {
    authorized: bool,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    text: &'a str,
    entities: &'a [crate::models::MessageEntity],
    link_preview: bool,
}

#[derive(Debug, Serialize)]
struct AlbumRequest<'a> {
    items: &'a [MediaItem],
}

#[derive(Debug, Serialize)]
struct IdsRequest<'a> {
    ids: &'a [i64],
}

#[derive(Debug, Serialize)]
struct PinRequest {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct EventBatch {
    cursor: i64,
    #[serde(default)]
    events: Vec<SourceEvent>,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: u64,
}

// ============================================================================
// Error Mapping
// ============================================================================

fn map_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_decode() {
        TransportError::Protocol(err.to_string())
    } else {
        TransportError::Connection(err.to_string())
    }
}

/// Map non-2xx gateway responses onto [`TransportError`]
async fn check(resp: Response) -> TransportResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let header_wait = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = resp.text().await.unwrap_or_default();

    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let seconds = header_wait
                .or_else(|| serde_json::from_str::<RateLimitBody>(&body).ok().map(|b| b.retry_after))
                .unwrap_or(1);
            TransportError::RateLimited { seconds }
        }
        StatusCode::NOT_FOUND => TransportError::NotFound(body),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::Unauthorized(body),
        other => TransportError::Rpc {
            code: other.as_u16(),
            message: body,
        },
    })
}

// ============================================================================
// Gateway Transport
// ============================================================================

/// [`Transport`] backed by the session gateway
pub struct GatewayTransport {
    bot_id: BotId,
    config: GatewayConfig,
    http: Client,
    pollers: Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayTransport {
    pub fn new(bot_id: BotId, config: GatewayConfig, http: Client) -> Self {
        Self {
            bot_id,
            config,
            http,
            pollers: Mutex::new(Vec::new()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/bots/{}{}", self.config.base_url, self.bot_id, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> TransportResult<T> {
        let resp = self.http.get(url).send().await.map_err(map_reqwest)?;
        check(resp).await?.json().await.map_err(map_reqwest)
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> TransportResult<T> {
        let resp = self.http.post(url).json(body).send().await.map_err(map_reqwest)?;
        check(resp).await?.json().await.map_err(map_reqwest)
    }

    async fn post_unit<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> TransportResult<()> {
        let resp = self.http.post(url).json(body).send().await.map_err(map_reqwest)?;
        check(resp).await.map(|_| ())
    }
}

#[async_trait]
impl Transport for GatewayTransport {
    fn bot_id(&self) -> BotId {
        self.bot_id
    }

    async fn resolve_by_id(&self, id: i64) -> TransportResult<PeerHandle> {
        self.get_json(&self.url(&format!("/peers/by-id/{id}"))).await
    }

    async fn resolve_by_username(&self, username: &str) -> TransportResult<PeerHandle> {
        let name = username.trim_start_matches('@');
        self.get_json(&self.url(&format!("/peers/by-username/{name}"))).await
    }

    async fn dialogs(&self) -> TransportResult<Vec<PeerHandle>> {
        self.get_json(&self.url("/dialogs")).await
    }

    async fn iterate_messages(&self, peer: &PeerHandle, limit: usize) -> TransportResult<Vec<RawMessage>> {
        self.get_json(&self.url(&format!("/peers/{}/messages?limit={limit}", peer.id)))
            .await
    }

    async fn send_message(
        &self,
        peer: &PeerHandle,
        body: &FormattedText,
        link_preview: bool,
    ) -> TransportResult<SentMessage> {
        let req = SendMessageRequest {
            text: &body.text,
            entities: &body.entities,
            link_preview,
        };
        self.post_json(&self.url(&format!("/peers/{}/messages", peer.id)), &req)
            .await
    }

    async fn send_media(&self, peer: &PeerHandle, item: &MediaItem) -> TransportResult<SentMessage> {
        self.post_json(&self.url(&format!("/peers/{}/media", peer.id)), item)
            .await
    }

    async fn send_album(&self, peer: &PeerHandle, items: &[MediaItem]) -> TransportResult<Vec<SentMessage>> {
        self.post_json(
            &self.url(&format!("/peers/{}/album", peer.id)),
            &AlbumRequest { items },
        )
        .await
    }

    async fn pin_message(&self, peer: &PeerHandle, message_id: i64) -> TransportResult<()> {
        self.post_unit(
            &self.url(&format!("/peers/{}/pin", peer.id)),
            &PinRequest { message_id },
        )
        .await
    }

    async fn delete_messages(&self, peer: &PeerHandle, ids: &[i64]) -> TransportResult<()> {
        self.post_unit(&self.url(&format!("/peers/{}/delete", peer.id)), &IdsRequest { ids })
            .await
    }

    async fn subscribe(&self, peer: &PeerHandle) -> TransportResult<mpsc::Receiver<SourceEvent>> {
        // the first poll establishes the cursor and surfaces errors to the caller
        let events_url = self.url(&format!("/peers/{}/events", peer.id));
        let first: EventBatch = self.get_json(&format!("{events_url}?after=-1")).await?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let http = self.http.clone();
        let interval = self.config.event_poll_interval;
        let peer_id = peer.id;
        let bot_id = self.bot_id;

        let handle = tokio::spawn(async move {
            let mut cursor = first.cursor;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }

                let batch = match http.get(format!("{events_url}?after={cursor}")).send().await {
                    Ok(resp) => match check(resp).await {
                        Ok(resp) => resp.json::<EventBatch>().await.map_err(map_reqwest),
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(map_reqwest(e)),
                };

                match batch {
                    Ok(batch) => {
                        cursor = batch.cursor;
                        for event in batch.events {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(TransportError::NotFound(_)) | Err(TransportError::Unauthorized(_)) => {
                        tracing::warn!(bot_id, peer = peer_id, "Event subscription dropped by gateway");
                        return;
                    }
                    Err(e) => {
                        tracing::debug!(bot_id, peer = peer_id, error = %e, "Event poll failed");
                    }
                }
            }
        });

        let mut pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
        pollers.retain(|h| !h.is_finished());
        pollers.push(handle);
        Ok(rx)
    }

    async fn disconnect(&self) {
        let handles: Vec<_> = self
            .pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for h in handles {
            h.abort();
        }

        let url = format!("{}/sessions/{}", self.config.base_url, self.bot_id);
        if let Err(e) = self.http.delete(&url).send().await {
            tracing::debug!(bot_id = self.bot_id, error = %e, "Session close request failed");
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Opens gateway sessions for bot identities
pub struct GatewayFactory {
    config: GatewayConfig,
    http: Client,
}

impl GatewayFactory {
    pub fn new(config: GatewayConfig) -> TransportResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl TransportFactory for GatewayFactory {
    async fn connect(&self, bot: &BotIdentity) -> TransportResult<Arc<dyn Transport>> {
        let req = ConnectRequest {
            bot_id: bot.id,
            api_id: bot.credentials.api_id,
            api_hash: &bot.credentials.api_hash,
            session: &bot.credentials.session,
        };

        let url = format!("{}/sessions", self.config.base_url);
        let resp = self.http.post(&url).json(&req).send().await.map_err(map_reqwest)?;
        let status: ConnectResponse = check(resp).await?.json().await.map_err(map_reqwest)?;

        if !status.authorized {
            return Err(TransportError::Unauthorized(format!(
                "session of bot {} is not authorized",
                bot.id
            )));
        }

        tracing::info!(bot_id = bot.id, name = %bot.name, "Gateway session ready");
        Ok(Arc::new(GatewayTransport::new(
            bot.id,
            self.config.clone(),
            self.http.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_trims_trailing_slash() {
        let cfg = GatewayConfig::new("http://gw:8081/").with_timeout(Duration::from_secs(5));
        assert_eq!(cfg.base_url, "http://gw:8081");
        assert_eq!(cfg.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_url_layout() {
        let t = GatewayTransport::new(7, GatewayConfig::new("http://gw"), Client::new());
        assert_eq!(t.url("/dialogs"), "http://gw/bots/7/dialogs");
    }

    #[tokio::test]
    async fn test_finished_pollers_are_released() {
        use wiremock::matchers::{method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bots/7/peers/-100123/events"))
            .and(query_param("after", "-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"cursor": 5, "events": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bots/7/peers/-100123/events"))
            .and(query_param("after", "5"))
            .respond_with(ResponseTemplate::new(404).set_body_string("CHANNEL_INVALID"))
            .mount(&server)
            .await;

        let config = GatewayConfig::new(server.uri()).with_event_poll_interval(Duration::from_millis(10));
        let t = GatewayTransport::new(7, config, Client::new());
        let peer = PeerHandle::new(-100123);

        let mut first = t.subscribe(&peer).await.unwrap();
        // the gateway drops the subscription, ending the poller
        let closed = tokio::time::timeout(Duration::from_secs(5), first.recv()).await.unwrap();
        assert_eq!(closed, None);

        let _second = t.subscribe(&peer).await.unwrap();
        assert_eq!(t.pollers.lock().unwrap().len(), 1);

        t.disconnect().await;
        assert!(t.pollers.lock().unwrap().is_empty());
    }
}
