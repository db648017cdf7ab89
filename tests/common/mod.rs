//! Common test utilities

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Europe::Moscow;

use postrelay::config::Config;
use postrelay::engine::Engine;
use postrelay::models::{
    AfterPublish, BotId, BotIdentity, Channel, ChannelRef, ChoiceMode, Credentials, Media, RawMessage,
    Task, TaskId, TimeSlot,
};
use postrelay::storage::{MemoryStore, Store};
use postrelay::transport::{MemoryFactory, MemoryTransport, TransportFactory};

pub const BOT: BotId = 1;
pub const SOURCE_CHANNEL: i64 = 10;
pub const TARGET_CHANNEL: i64 = 20;
pub const SOURCE_PEER: i64 = -1_001_000;
pub const TARGET_PEER: i64 = -1_002_000;

/// Wednesday 12:00:00 local slot
pub const WEDNESDAY_NOON: (u8, u32) = (2, 43_200);

/// Moscow wall-clock time on Wednesday 2025-01-01
pub fn wednesday(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Moscow
        .with_ymd_and_hms(2025, 1, 1, h, m, s)
        .single()
        .unwrap()
        .with_timezone(&Utc)
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_735_000_000 + secs, 0).single().unwrap()
}

/// Plain text message; dates increase with the id
pub fn text_msg(id: i64, text: &str) -> RawMessage {
    RawMessage {
        id,
        date: at(id),
        text: text.to_string(),
        entities: vec![],
        media: None,
        grouped_id: None,
        is_service: false,
    }
}

/// Photo message, optionally part of album `group`
pub fn photo_msg(id: i64, caption: &str, group: Option<i64>) -> RawMessage {
    RawMessage {
        media: Some(Media::Photo {
            file_id: format!("photo-{id}"),
        }),
        grouped_id: group,
        ..text_msg(id, caption)
    }
}

pub fn bot(id: BotId) -> BotIdentity {
    BotIdentity {
        id,
        name: format!("bot-{id}"),
        credentials: Credentials {
            api_id: 12345,
            api_hash: "hash".to_string(),
            session: "session".to_string(),
        },
        is_active: true,
    }
}

pub fn source_channel(suffix: Option<&str>) -> Channel {
    Channel {
        id: SOURCE_CHANNEL,
        name: "source".to_string(),
        reference: ChannelRef::by_id(SOURCE_PEER),
        text_suffix: suffix.map(String::from),
        add_suffix: suffix.is_some(),
    }
}

pub fn target_channel() -> Channel {
    Channel {
        id: TARGET_CHANNEL,
        name: "target".to_string(),
        reference: ChannelRef::by_id(TARGET_PEER),
        text_suffix: None,
        add_suffix: false,
    }
}

/// Active task of [`BOT`] from the source to the target channel
pub fn task(id: TaskId, slots: &[(u8, u32)]) -> Task {
    Task {
        id,
        bot_id: BOT,
        source_id: SOURCE_CHANNEL,
        target_id: TARGET_CHANNEL,
        is_active: true,
        is_global_active: true,
        choice_mode: ChoiceMode::First,
        after_publish: AfterPublish::Cycle,
        pin: false,
        slots: slots
            .iter()
            .map(|&(day, secs)| TimeSlot::new(day, secs).unwrap())
            .collect(),
    }
}

/// Defaults with no stagger and no album pacing
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.scheduler.stagger_secs = 0;
    config.publisher.album_pacing_ms = 0;
    config
}

/// Engine wired to an in-memory store and one in-memory session
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub transport: Arc<MemoryTransport>,
    pub engine: Engine,
}

impl Harness {
    pub async fn new(tasks: Vec<Task>, history: Vec<RawMessage>) -> Self {
        Self::build(test_config(), tasks, None, history).await
    }

    pub async fn build(
        config: Config,
        tasks: Vec<Task>,
        suffix: Option<&str>,
        history: Vec<RawMessage>,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.put_bot(bot(BOT));
        store.put_channel(source_channel(suffix));
        store.put_channel(target_channel());
        for t in tasks {
            store.put_task(t);
        }

        let transport = Arc::new(MemoryTransport::new(BOT));
        transport.add_peer(SOURCE_PEER, Some("source_feed"));
        transport.add_peer(TARGET_PEER, Some("target_feed"));
        transport.set_history(SOURCE_PEER, history);

        let factory = MemoryFactory::new();
        factory.register(Arc::clone(&transport));

        let engine = Engine::new(
            &config,
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(factory) as Arc<dyn TransportFactory>,
        )
        .unwrap();
        engine.connect_sessions().await.unwrap();

        Self {
            store,
            transport,
            engine,
        }
    }
}
