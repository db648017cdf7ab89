//! PostgreSQL change listener
//!
//! Subscribes to the notification channel the administrative tables raise
//! on insert/update/delete and forwards every notification as a
//! [`ChangeEvent`]. The payload is informational only: an event whose
//! payload does not parse still means "something changed". The connection
//! is re-established after a fixed delay whenever it drops.

use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_postgres::{AsyncMessage, NoTls};

/// Default notification channel
pub const DEFAULT_CHANNEL: &str = "tasks_changed";

/// Default delay before reconnecting
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Parsed trigger payload: `{"table": ..., "op": ..., "id": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub table: String,
    pub op: String,
    #[serde(default)]
    pub id: Option<i64>,
}

impl ChangeNotification {
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// One received notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub payload: String,
    /// `None` when the payload is not the expected JSON
    pub notification: Option<ChangeNotification>,
}

impl ChangeEvent {
    pub fn from_payload(payload: impl Into<String>) -> Self {
        let payload = payload.into();
        let notification = match ChangeNotification::parse(&payload) {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!(payload = %payload, error = %e, "Unparseable change notification");
                None
            }
        };
        Self { payload, notification }
    }
}

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub database_url: String,
    pub channel: String,
    pub reconnect_delay: Duration,
}

impl ListenerConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            channel: DEFAULT_CHANNEL.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

enum Exit {
    Shutdown,
    Dropped,
}

/// Long-lived `LISTEN` connection with automatic reconnect
pub struct ChangeListener {
    config: ListenerConfig,
}

impl ChangeListener {
    pub fn new(config: ListenerConfig) -> Self {
        Self { config }
    }

    /// Forward notifications into `events` until shutdown or until the
    /// receiving side goes away
    pub async fn run(self, events: mpsc::Sender<ChangeEvent>, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.listen_once(&events, &mut shutdown).await {
                Ok(Exit::Shutdown) => break,
                Ok(Exit::Dropped) => {
                    tracing::warn!(channel = %self.config.channel, "Change listener connection closed");
                }
                Err(e) => {
                    tracing::warn!(channel = %self.config.channel, error = %e, "Change listener failed");
                }
            }

            if events.is_closed() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
            tracing::info!(channel = %self.config.channel, "Reconnecting change listener");
        }

        tracing::info!("Change listener stopped");
    }

    async fn listen_once(
        &self,
        events: &mpsc::Sender<ChangeEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Exit, tokio_postgres::Error> {
        let (client, mut connection) = tokio_postgres::connect(&self.config.database_url, NoTls).await?;

        // the connection future must be polled for notifications to arrive
        let (note_tx, mut note_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(async move {
            let mut messages = std::pin::pin!(futures::stream::poll_fn(move |cx| connection.poll_message(cx)));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        if note_tx.send(n.payload().to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Listener connection error");
                        break;
                    }
                }
            }
        });

        client
            .batch_execute(&format!("LISTEN {}", quote_ident(&self.config.channel)))
            .await?;
        tracing::info!(channel = %self.config.channel, "Listening for changes");

        let exit = loop {
            tokio::select! {
                payload = note_rx.recv() => {
                    let Some(payload) = payload else {
                        break Exit::Dropped;
                    };
                    let event = ChangeEvent::from_payload(payload);
                    tracing::debug!(notification = ?event.notification, "Change notification received");
                    if events.send(event).await.is_err() {
                        break Exit::Shutdown;
                    }
                }
                _ = shutdown.changed() => break Exit::Shutdown,
            }
        };

        driver.abort();
        Ok(exit)
    }
}

/// Quote a channel name as an SQL identifier
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trigger_payload() {
        let n = ChangeNotification::parse(r#"{"table":"api_tasktime","op":"UPDATE","id":12}"#).unwrap();
        assert_eq!(n.table, "api_tasktime");
        assert_eq!(n.op, "UPDATE");
        assert_eq!(n.id, Some(12));
    }

    #[test]
    fn test_delete_payload_has_null_id() {
        let n = ChangeNotification::parse(r#"{"table":"api_entityposttask","op":"DELETE","id":null}"#).unwrap();
        assert_eq!(n.id, None);
    }

    #[test]
    fn test_invalid_payload_still_yields_event() {
        let event = ChangeEvent::from_payload("not json");
        assert_eq!(event.payload, "not json");
        assert!(event.notification.is_none());
    }

    fn unreachable() -> ListenerConfig {
        let mut config = ListenerConfig::new("postgresql://postgres@127.0.0.1:1/postrelay");
        config.reconnect_delay = Duration::from_millis(20);
        config
    }

    #[tokio::test]
    async fn test_keeps_reconnecting_until_shutdown() {
        let (events_tx, _events_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(ChangeListener::new(unreachable()).run(events_tx, shutdown_rx));

        // several failed connects and reconnect delays
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());

        shutdown_tx.send(true).unwrap();
        let joined = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap();
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn test_stops_when_receiver_dropped() {
        let (events_tx, events_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(events_rx);

        let run = ChangeListener::new(unreachable()).run(events_tx, shutdown_rx);
        assert!(tokio::time::timeout(Duration::from_secs(5), run).await.is_ok());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("tasks_changed"), "\"tasks_changed\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
