//! Websocket transport for `yrs` documents.
//!
//! Each connection talks to `<url>/<room>` and exchanges `yrs::sync`
//! messages: it sends sync step 1 on connect, answers the server's step 1,
//! applies step 2 and updates, and forwards local updates. The first step 2
//! received on a link raises `sync`. Drops are retried according to the
//! transport's [`RetryPolicy`] until the connection is disconnected.
//!
//! Presence is a shared [`Awareness`]: the local state is announced after
//! step 1 and on every local change, remote states are applied as they
//! arrive, and awareness queries are answered with the full state.

use anyhow::{anyhow, Context as _, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use url::Url;
use yrs::sync::{Awareness, Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, Transact, Update};

use super::transport::{
    emit_connection_event, Connection, ConnectionEvent, ConnectionEvents, Endpoint, Transport,
};
use crate::error::{categorize_error, RetryPolicy};

/// Transaction origin used for updates received from the server
const REMOTE_ORIGIN: &str = "docsync-remote";

/// Websocket URL for a channel: `<url>/<room>`
pub fn channel_url(endpoint: &Endpoint) -> Result<Url> {
    let raw = format!("{}/{}", endpoint.url.trim_end_matches('/'), endpoint.room);
    let url = Url::parse(&raw).with_context(|| format!("invalid websocket url: {raw}"))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(anyhow!("unsupported websocket scheme '{other}' in {raw}")),
    }
}

pub struct WebsocketTransport {
    runtime: Handle,
    policy: RetryPolicy,
}

impl WebsocketTransport {
    /// Bind the transport to the current tokio runtime
    pub fn new(policy: RetryPolicy) -> Result<Self> {
        let runtime =
            Handle::try_current().context("websocket transport needs a tokio runtime")?;
        Ok(Self::with_runtime(runtime, policy))
    }

    pub fn with_runtime(runtime: Handle, policy: RetryPolicy) -> Self {
        Self { runtime, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Transport for WebsocketTransport {
    type Document = Doc;
    type Presence = Awareness;
    type Connection = WebsocketConnection;

    fn open(
        &self,
        endpoint: Endpoint,
        doc: &Doc,
        presence: Arc<Awareness>,
    ) -> WebsocketConnection {
        WebsocketConnection {
            shared: Arc::new(Shared {
                endpoint,
                doc: doc.clone(),
                presence,
                events: ConnectionEvents::new(),
                policy: self.policy.clone(),
                connected: AtomicBool::new(false),
            }),
            runtime: self.runtime.clone(),
            task: Mutex::new(None),
        }
    }
}

struct Shared {
    endpoint: Endpoint,
    doc: Doc,
    presence: Arc<Awareness>,
    events: ConnectionEvents,
    policy: RetryPolicy,
    connected: AtomicBool,
}

pub struct WebsocketConnection {
    shared: Arc<Shared>,
    runtime: Handle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebsocketConnection {
    pub fn doc(&self) -> &Doc {
        &self.shared.doc
    }

    /// Awareness this connection announces and keeps up to date
    pub fn presence(&self) -> &Arc<Awareness> {
        &self.shared.presence
    }
}

impl Connection for WebsocketConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    fn connect(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *task = Some(self.runtime.spawn(run(self.shared.clone())));
    }

    fn disconnect(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        if self.shared.connected.swap(false, Ordering::SeqCst) {
            emit_connection_event(
                &self.shared.events,
                ConnectionEvent::Closed {
                    reason: Some("disconnected".into()),
                },
            );
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> &ConnectionEvents {
        &self.shared.events
    }
}

impl Drop for WebsocketConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run(shared: Arc<Shared>) {
    let room = shared.endpoint.room.clone();
    let url = match channel_url(&shared.endpoint) {
        Ok(url) => url,
        Err(err) => {
            warn!(%room, "{err:#}");
            emit_connection_event(
                &shared.events,
                ConnectionEvent::Error {
                    message: format!("{err:#}"),
                },
            );
            return;
        }
    };

    let mut failures: u32 = 0;
    loop {
        if !shared.policy.allows(failures + 1) {
            warn!(%room, failures, "giving up on websocket channel");
            break;
        }

        let outcome = session(&shared, &url, &mut failures).await;
        let was_connected = shared.connected.swap(false, Ordering::SeqCst);

        match outcome {
            Ok(()) => {
                info!(%room, "websocket closed by server");
                emit_connection_event(&shared.events, ConnectionEvent::Closed { reason: None });
            }
            Err(err) => {
                let category = categorize_error(&err);
                warn!(%room, ?category, "websocket failure: {err:#}");
                if was_connected {
                    emit_connection_event(
                        &shared.events,
                        ConnectionEvent::Closed {
                            reason: Some(format!("{err:#}")),
                        },
                    );
                } else {
                    emit_connection_event(
                        &shared.events,
                        ConnectionEvent::Error {
                            message: format!("{err:#}"),
                        },
                    );
                }
                if !category.is_retryable() {
                    break;
                }
            }
        }

        failures += 1;
        let delay = shared.policy.delay_for(failures);
        debug!(%room, ?delay, "reconnecting");
        tokio::time::sleep(delay).await;
    }
}

/// One connected session. `Ok` means the server closed the link cleanly.
async fn session(shared: &Shared, url: &Url, failures: &mut u32) -> Result<()> {
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("connection to {url} failed"))?;
    *failures = 0;
    shared.connected.store(true, Ordering::SeqCst);
    info!(room = %shared.endpoint.room, "websocket connected");

    let (mut ws_tx, mut ws_rx) = ws.split();

    // encoded frames produced by local document and awareness changes
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let remote = Origin::from(REMOTE_ORIGIN);
    let updates_tx = frame_tx.clone();
    let _updates = shared
        .doc
        .observe_update_v1(move |txn, event| {
            if txn.origin() != Some(&remote) {
                let frame = Message::Sync(SyncMessage::Update(event.update.clone())).encode_v1();
                let _ = updates_tx.send(frame);
            }
        })
        .map_err(|e| anyhow!("document refused an update observer: {e:?}"))?;

    let local = shared.presence.client_id();
    let _presence = shared.presence.on_update(move |awareness, event, _origin| {
        let touches_local = event
            .added()
            .iter()
            .chain(event.updated())
            .chain(event.removed())
            .any(|client| *client == local);
        if !touches_local {
            return;
        }
        match awareness.update_with_clients([local]) {
            Ok(update) => {
                let _ = frame_tx.send(Message::Awareness(update).encode_v1());
            }
            Err(err) => debug!("cannot encode local awareness: {err}"),
        }
    });

    let step1 = {
        let txn = shared.doc.transact();
        Message::Sync(SyncMessage::SyncStep1(txn.state_vector())).encode_v1()
    };
    ws_tx.send(WsMessage::Binary(step1.into())).await?;
    ws_tx
        .send(WsMessage::Binary(awareness_frame(&shared.presence)?.into()))
        .await?;

    let mut synced = false;
    loop {
        tokio::select! {
            Some(frame) = frame_rx.recv() => {
                ws_tx.send(WsMessage::Binary(frame.into())).await?;
            }
            frame = ws_rx.next() => match frame {
                None | Some(Ok(WsMessage::Close(_))) => return Ok(()),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(WsMessage::Binary(bytes))) => {
                    if let Some(reply) = handle_frame(shared, &bytes, &mut synced)? {
                        ws_tx.send(WsMessage::Binary(reply.into())).await?;
                    }
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Full awareness state, as sent after step 1 and in answer to a query
fn awareness_frame(awareness: &Awareness) -> Result<Vec<u8>> {
    let update = awareness
        .update()
        .map_err(|e| anyhow!("cannot encode awareness: {e}"))?;
    Ok(Message::Awareness(update).encode_v1())
}

/// Apply one inbound frame; returns a reply to send back, if any
fn handle_frame(shared: &Shared, bytes: &[u8], synced: &mut bool) -> Result<Option<Vec<u8>>> {
    let message =
        Message::decode_v1(bytes).map_err(|e| anyhow!("cannot decode sync message: {e}"))?;
    match message {
        Message::Sync(SyncMessage::SyncStep1(remote_sv)) => {
            let update = shared.doc.transact().encode_state_as_update_v1(&remote_sv);
            Ok(Some(Message::Sync(SyncMessage::SyncStep2(update)).encode_v1()))
        }
        Message::Sync(SyncMessage::SyncStep2(update)) => {
            apply_remote(&shared.doc, &update)?;
            if !*synced {
                *synced = true;
                emit_connection_event(&shared.events, ConnectionEvent::Synced);
            }
            Ok(None)
        }
        Message::Sync(SyncMessage::Update(update)) => {
            apply_remote(&shared.doc, &update)?;
            Ok(None)
        }
        Message::Awareness(update) => {
            shared
                .presence
                .apply_update(update)
                .map_err(|e| anyhow!("cannot apply awareness update: {e}"))?;
            Ok(None)
        }
        Message::AwarenessQuery => Ok(Some(awareness_frame(&shared.presence)?)),
        // auth and custom frames are not used by this transport
        _ => Ok(None),
    }
}

fn apply_remote(doc: &Doc, update: &[u8]) -> Result<()> {
    let update = Update::decode_v1(update).map_err(|e| anyhow!("cannot decode update: {e}"))?;
    let mut txn = doc.transact_mut_with(REMOTE_ORIGIN);
    txn.apply_update(update)
        .map_err(|e| anyhow!("cannot apply update: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn shared() -> Shared {
        let doc = Doc::new();
        Shared {
            endpoint: Endpoint::new("ws://unused", "room"),
            presence: Arc::new(Awareness::new(Doc::new())),
            doc,
            events: ConnectionEvents::new(),
            policy: RetryPolicy::no_retry(),
            connected: AtomicBool::new(false),
        }
    }

    fn count_sync(shared: &Shared) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        shared.events.on("sync", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        hits
    }

    #[test]
    fn channel_url_joins_with_single_slash() {
        let url = channel_url(&Endpoint::new("ws://localhost:1234/", "proj--a1")).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:1234/proj--a1");
    }

    #[test]
    fn channel_url_rejects_non_websocket_schemes() {
        assert!(channel_url(&Endpoint::new("http://localhost", "room")).is_err());
        assert!(channel_url(&Endpoint::new("not a url", "room")).is_err());
    }

    #[test]
    fn step1_from_peer_gets_step2_reply() {
        let shared = shared();
        let peer = Doc::new();
        let sv = peer.transact().state_vector();
        let request = Message::Sync(SyncMessage::SyncStep1(sv)).encode_v1();

        let mut synced = false;
        let reply = handle_frame(&shared, &request, &mut synced).unwrap().unwrap();
        assert!(matches!(
            Message::decode_v1(&reply).unwrap(),
            Message::Sync(SyncMessage::SyncStep2(_))
        ));
        assert!(!synced);
    }

    #[test]
    fn first_step2_raises_sync_once() {
        let shared = shared();
        let hits = count_sync(&shared);

        let server = Doc::new();
        let step2 = {
            let txn = server.transact();
            let update = txn.encode_state_as_update_v1(&yrs::StateVector::default());
            Message::Sync(SyncMessage::SyncStep2(update)).encode_v1()
        };

        let mut synced = false;
        handle_frame(&shared, &step2, &mut synced).unwrap();
        handle_frame(&shared, &step2, &mut synced).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn broken_step2_fails_the_session_without_sync() {
        let shared = shared();
        let hits = count_sync(&shared);

        let broken = Message::Sync(SyncMessage::SyncStep2(vec![0xff, 0xff, 0xff])).encode_v1();
        let mut synced = false;

        assert!(handle_frame(&shared, &broken, &mut synced).is_err());
        assert!(!synced);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remote_awareness_is_applied_and_queries_answered() {
        let shared = shared();
        let peer = Awareness::new(Doc::new());
        peer.set_local_state(serde_json::json!({ "user": "bob" })).unwrap();
        let announce = Message::Awareness(peer.update().unwrap()).encode_v1();

        let bob = peer.client_id();
        let joined = Arc::new(AtomicUsize::new(0));
        let j = joined.clone();
        let _watch = shared.presence.on_update(move |_, event, _| {
            if event.added().contains(&bob) {
                j.fetch_add(1, Ordering::SeqCst);
            }
        });

        let mut synced = false;
        assert!(handle_frame(&shared, &announce, &mut synced).unwrap().is_none());
        assert_eq!(joined.load(Ordering::SeqCst), 1);

        let query = Message::AwarenessQuery.encode_v1();
        let reply = handle_frame(&shared, &query, &mut synced).unwrap().unwrap();
        assert!(matches!(
            Message::decode_v1(&reply).unwrap(),
            Message::Awareness(_)
        ));
    }
}
