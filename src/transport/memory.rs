//! In-memory transport
//!
//! Holds peers, channel histories and a log of everything sent, with
//! one-shot failure injection per operation. Used by the integration tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::compose::{FormattedText, MediaItem};
use crate::models::{BotId, BotIdentity, RawMessage};

use super::{
    PeerHandle, SentMessage, SourceEvent, Transport, TransportError, TransportFactory,
    TransportResult,
};

const EVENT_BUFFER: usize = 256;

/// Operation a failure can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    ResolveId,
    ResolveUsername,
    Dialogs,
    Iterate,
    SendMessage,
    SendMedia,
    SendAlbum,
    Pin,
    Delete,
    Subscribe,
}

/// Something the transport sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text {
        peer: i64,
        body: FormattedText,
        link_preview: bool,
    },
    Media {
        peer: i64,
        item: MediaItem,
    },
    Album {
        peer: i64,
        items: Vec<MediaItem>,
    },
}

impl Sent {
    pub fn peer(&self) -> i64 {
        match self {
            Self::Text { peer, .. } | Self::Media { peer, .. } | Self::Album { peer, .. } => *peer,
        }
    }
}

#[derive(Default)]
struct State {
    peers: HashMap<i64, PeerHandle>,
    usernames: HashMap<String, i64>,
    /// Peers reachable only through the dialog list
    dialog_only: HashSet<i64>,
    history: HashMap<i64, Vec<RawMessage>>,
    subscribers: HashMap<i64, Vec<mpsc::Sender<SourceEvent>>>,
    failures: HashMap<Op, VecDeque<TransportError>>,
    calls: HashMap<Op, usize>,
    holds: HashMap<Op, Arc<Notify>>,
    sent: Vec<Sent>,
    pinned: Vec<(i64, i64)>,
    deleted: Vec<(i64, Vec<i64>)>,
    next_id: i64,
    disconnected: bool,
}

/// In-process [`Transport`]
pub struct MemoryTransport {
    bot_id: BotId,
    state: Mutex<State>,
}

impl MemoryTransport {
    pub fn new(bot_id: BotId) -> Self {
        Self {
            bot_id,
            state: Mutex::new(State {
                next_id: 10_000,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a peer, optionally with a username
    pub fn add_peer(&self, id: i64, username: Option<&str>) -> PeerHandle {
        let peer = PeerHandle {
            id,
            access_hash: Some(id.wrapping_mul(31)),
            title: username.map(String::from),
        };
        let mut st = self.state();
        st.peers.insert(id, peer.clone());
        if let Some(name) = username {
            st.usernames.insert(name.to_lowercase(), id);
        }
        peer
    }

    /// Register a peer that direct id lookup cannot find
    pub fn add_dialog_only_peer(&self, id: i64) -> PeerHandle {
        let peer = self.add_peer(id, None);
        self.state().dialog_only.insert(id);
        peer
    }

    /// Replace the history of `peer`
    pub fn set_history(&self, peer: i64, messages: Vec<RawMessage>) {
        self.state().history.insert(peer, messages);
    }

    /// Append a message to `peer` and notify subscribers
    pub fn push_message(&self, peer: i64, message: RawMessage) {
        let mut st = self.state();
        st.history.entry(peer).or_default().push(message.clone());
        Self::notify(&mut st, peer, SourceEvent::NewMessage { message });
    }

    /// Delete messages out of band and notify subscribers
    pub fn remove_messages(&self, peer: i64, ids: &[i64]) {
        let mut st = self.state();
        if let Some(h) = st.history.get_mut(&peer) {
            h.retain(|m| !ids.contains(&m.id));
        }
        Self::notify(&mut st, peer, SourceEvent::Deleted { ids: ids.to_vec() });
    }

    fn notify(st: &mut State, peer: i64, event: SourceEvent) {
        if let Some(subs) = st.subscribers.get_mut(&peer) {
            subs.retain(|tx| tx.try_send(event.clone()).is_ok());
        }
    }

    /// Make the next call of `op` fail with `err`
    pub fn fail_next(&self, op: Op, err: TransportError) {
        self.state().failures.entry(op).or_default().push_back(err);
    }

    /// Park the next call of `op` until the returned handle is notified
    pub fn hold_next(&self, op: Op) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state().holds.insert(op, Arc::clone(&gate));
        gate
    }

    async fn wait_if_held(&self, op: Op) {
        let gate = self.state().holds.remove(&op);
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    pub fn calls(&self, op: Op) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.state().sent.clone()
    }

    pub fn pinned(&self) -> Vec<(i64, i64)> {
        self.state().pinned.clone()
    }

    pub fn deleted(&self) -> Vec<(i64, Vec<i64>)> {
        self.state().deleted.clone()
    }

    pub fn history(&self, peer: i64) -> Vec<RawMessage> {
        self.state().history.get(&peer).cloned().unwrap_or_default()
    }

    pub fn subscriber_count(&self, peer: i64) -> usize {
        self.state()
            .subscribers
            .get(&peer)
            .map(|s| s.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn is_disconnected(&self) -> bool {
        self.state().disconnected
    }

    /// Count the call and pop an injected failure, if any
    fn enter(&self, op: Op) -> TransportResult<MutexGuard<'_, State>> {
        let mut st = self.state();
        *st.calls.entry(op).or_default() += 1;
        if st.disconnected {
            return Err(TransportError::Connection("session closed".into()));
        }
        if let Some(err) = st.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(st)
    }

    fn next_id(st: &mut State) -> i64 {
        st.next_id += 1;
        st.next_id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn bot_id(&self) -> BotId {
        self.bot_id
    }

    async fn resolve_by_id(&self, id: i64) -> TransportResult<PeerHandle> {
        let st = self.enter(Op::ResolveId)?;
        if st.dialog_only.contains(&id) {
            return Err(TransportError::NotFound(format!("peer {id}")));
        }
        st.peers
            .get(&id)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(format!("peer {id}")))
    }

    async fn resolve_by_username(&self, username: &str) -> TransportResult<PeerHandle> {
        let st = self.enter(Op::ResolveUsername)?;
        st.usernames
            .get(&username.trim_start_matches('@').to_lowercase())
            .and_then(|id| st.peers.get(id))
            .cloned()
            .ok_or_else(|| TransportError::NotFound(format!("@{username}")))
    }

    async fn dialogs(&self) -> TransportResult<Vec<PeerHandle>> {
        let st = self.enter(Op::Dialogs)?;
        Ok(st.peers.values().cloned().collect())
    }

    async fn iterate_messages(&self, peer: &PeerHandle, limit: usize) -> TransportResult<Vec<RawMessage>> {
        self.wait_if_held(Op::Iterate).await;
        let st = self.enter(Op::Iterate)?;
        let mut msgs = st.history.get(&peer.id).cloned().unwrap_or_default();
        msgs.sort_by_key(|m| std::cmp::Reverse(m.id));
        msgs.truncate(limit);
        Ok(msgs)
    }

    async fn send_message(
        &self,
        peer: &PeerHandle,
        body: &FormattedText,
        link_preview: bool,
    ) -> TransportResult<SentMessage> {
        let mut st = self.enter(Op::SendMessage)?;
        st.sent.push(Sent::Text {
            peer: peer.id,
            body: body.clone(),
            link_preview,
        });
        Ok(SentMessage {
            id: Self::next_id(&mut st),
        })
    }

    async fn send_media(&self, peer: &PeerHandle, item: &MediaItem) -> TransportResult<SentMessage> {
        let mut st = self.enter(Op::SendMedia)?;
        st.sent.push(Sent::Media {
            peer: peer.id,
            item: item.clone(),
        });
        Ok(SentMessage {
            id: Self::next_id(&mut st),
        })
    }

    async fn send_album(&self, peer: &PeerHandle, items: &[MediaItem]) -> TransportResult<Vec<SentMessage>> {
        let mut st = self.enter(Op::SendAlbum)?;
        st.sent.push(Sent::Album {
            peer: peer.id,
            items: items.to_vec(),
        });
        Ok((0..items.len())
            .map(|_| SentMessage {
                id: Self::next_id(&mut st),
            })
            .collect())
    }

    async fn pin_message(&self, peer: &PeerHandle, message_id: i64) -> TransportResult<()> {
        let mut st = self.enter(Op::Pin)?;
        st.pinned.push((peer.id, message_id));
        Ok(())
    }

    async fn delete_messages(&self, peer: &PeerHandle, ids: &[i64]) -> TransportResult<()> {
        let mut st = self.enter(Op::Delete)?;
        st.deleted.push((peer.id, ids.to_vec()));
        if let Some(h) = st.history.get_mut(&peer.id) {
            h.retain(|m| !ids.contains(&m.id));
        }
        Ok(())
    }

    async fn subscribe(&self, peer: &PeerHandle) -> TransportResult<mpsc::Receiver<SourceEvent>> {
        let mut st = self.enter(Op::Subscribe)?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        st.subscribers.entry(peer.id).or_default().push(tx);
        Ok(rx)
    }

    async fn disconnect(&self) {
        let mut st = self.state();
        st.disconnected = true;
        st.subscribers.clear();
    }
}

/// Hands out pre-registered [`MemoryTransport`]s
#[derive(Default)]
pub struct MemoryFactory {
    transports: Mutex<HashMap<BotId, Arc<MemoryTransport>>>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, transport: Arc<MemoryTransport>) {
        self.transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(transport.bot_id(), transport);
    }
}

#[async_trait]
impl TransportFactory for MemoryFactory {
    async fn connect(&self, bot: &BotIdentity) -> TransportResult<Arc<dyn Transport>> {
        let transport = self
            .transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&bot.id)
            .cloned()
            .ok_or_else(|| TransportError::Unauthorized(format!("no session for bot {}", bot.id)))?;
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn raw(id: i64) -> RawMessage {
        RawMessage {
            id,
            date: Utc::now(),
            text: format!("m{id}"),
            entities: vec![],
            media: None,
            grouped_id: None,
            is_service: false,
        }
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let t = MemoryTransport::new(1);
        t.add_peer(5, Some("feed"));
        t.fail_next(Op::ResolveId, TransportError::RateLimited { seconds: 1 });

        assert!(matches!(
            t.resolve_by_id(5).await,
            Err(TransportError::RateLimited { seconds: 1 })
        ));
        assert_eq!(t.resolve_by_id(5).await.unwrap().id, 5);
        assert_eq!(t.calls(Op::ResolveId), 2);
    }

    #[tokio::test]
    async fn test_iterate_respects_limit() {
        let t = MemoryTransport::new(1);
        let peer = t.add_peer(5, None);
        t.set_history(5, (1..=10).map(raw).collect());
        let got = t.iterate_messages(&peer, 3).await.unwrap();
        let ids: Vec<_> = got.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![10, 9, 8]);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let t = MemoryTransport::new(1);
        let peer = t.add_peer(5, None);
        let mut rx = t.subscribe(&peer).await.unwrap();
        t.push_message(5, raw(1));
        t.remove_messages(5, &[1]);
        assert!(matches!(rx.recv().await, Some(SourceEvent::NewMessage { .. })));
        assert_eq!(rx.recv().await, Some(SourceEvent::Deleted { ids: vec![1] }));
    }
}
