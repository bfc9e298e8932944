// Room actor: one task per `siteId:version` owns the scene document, the
// connection table and the save schedule. Connection tasks talk to it only
// through its command channel, so updates are applied (and re-broadcast) in
// the order they were dequeued.

pub mod doc;
pub mod persistence;
pub mod presence;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use scenesync_common::protocol::ws::{
    close_code, decode_payload, encode_payload, error_code, PeerPresence, WsMessage,
};
use scenesync_common::room::RoomKey;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RoomConfig;
use crate::db::SnapshotStore;
use crate::metrics;
use crate::registry::RoomMap;
use doc::{merge_states, SceneDoc};
use persistence::{SaveOutcome, SaveTracker};
use presence::PresenceTable;

const LOAD_ATTEMPTS: u32 = 3;
const LOAD_RETRY_BASE: Duration = Duration::from_millis(200);
const TEARDOWN_RETRY: Duration = Duration::from_millis(5);
/// Consecutive save failures after which each further failure logs at error level.
const SAVE_FAILURE_ALERT_THRESHOLD: u32 = 5;

/// Caller identity for one socket.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    pub user_id: String,
    pub name: Option<String>,
    pub color: Option<String>,
}

/// Why the server closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseSignal {
    pub code: u16,
    pub reason: &'static str,
}

impl CloseSignal {
    pub const SLOW_CONSUMER: Self = Self { code: close_code::SLOW_CONSUMER, reason: "slow_consumer" };
    pub const GOING_AWAY: Self = Self { code: close_code::GOING_AWAY, reason: "server_shutdown" };
}

/// The room's way back to a connection task: a bounded frame queue plus a
/// one-shot close request used when the queue itself cannot be trusted.
pub struct ConnectionSink {
    pub outbound: mpsc::Sender<WsMessage>,
    pub close: oneshot::Sender<CloseSignal>,
}

impl ConnectionSink {
    pub fn channel(
        capacity: usize,
    ) -> (Self, mpsc::Receiver<WsMessage>, oneshot::Receiver<CloseSignal>) {
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        let (close, close_rx) = oneshot::channel();
        (Self { outbound, close }, outbound_rx, close_rx)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("room snapshot could not be decoded: {0}")]
    CorruptSnapshot(String),
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("room is no longer accepting connections")]
    RoomClosed,
}

impl JoinError {
    pub fn close_code(&self) -> u16 {
        match self {
            Self::ShuttingDown => close_code::GOING_AWAY,
            Self::CorruptSnapshot(_) | Self::RoomClosed => close_code::ROOM_JOIN_FAILED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomLifecycle {
    Loading,
    Active,
    Draining,
    Closing,
}

/// Read-only view published by the actor after every state change.
#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub room_id: String,
    pub site_id: String,
    pub version: String,
    pub state: RoomLifecycle,
    pub connections: usize,
    pub users: usize,
    pub dirty: bool,
    pub save_in_flight: bool,
    pub failed_save_attempts: u32,
    /// Initial load failed; the next save merges the stored snapshot back in.
    pub degraded: bool,
    pub document_bytes: usize,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RoomStats {
    fn initial(key: &RoomKey, created_at: DateTime<Utc>) -> Self {
        Self {
            room_id: key.room_id(),
            site_id: key.site_id().to_string(),
            version: key.version().to_string(),
            state: RoomLifecycle::Loading,
            connections: 0,
            users: 0,
            dirty: false,
            save_in_flight: false,
            failed_save_attempts: 0,
            degraded: false,
            document_bytes: 0,
            last_saved_at: None,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was unsaved.
    Clean,
    Saved,
    Failed,
}

pub(crate) enum RoomCommand {
    Join {
        info: ConnectionInfo,
        sink: ConnectionSink,
        reply: oneshot::Sender<Result<(), JoinError>>,
    },
    Frame {
        connection_id: Uuid,
        message: WsMessage,
    },
    Leave {
        connection_id: Uuid,
    },
    Shutdown {
        reply: oneshot::Sender<FlushOutcome>,
    },
}

#[derive(Clone, Debug)]
pub struct RoomHandle {
    room_id: Arc<str>,
    instance: Uuid,
    commands: mpsc::Sender<RoomCommand>,
    stats: watch::Receiver<RoomStats>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn stats(&self) -> RoomStats {
        self.stats.borrow().clone()
    }

    /// Forwards a client frame. `false` means the room is gone.
    pub async fn send_frame(&self, connection_id: Uuid, message: WsMessage) -> bool {
        self.commands.send(RoomCommand::Frame { connection_id, message }).await.is_ok()
    }

    pub async fn leave(&self, connection_id: Uuid) {
        let _ = self.commands.send(RoomCommand::Leave { connection_id }).await;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Waits for space in the room's queue and holds it for one Join.
    pub(crate) async fn reserve_join(&self) -> Result<JoinSlot, JoinError> {
        self.commands
            .clone()
            .reserve_owned()
            .await
            .map(JoinSlot)
            .map_err(|_| JoinError::RoomClosed)
    }

    pub(crate) fn same_room(&self, other: &RoomHandle) -> bool {
        self.is_instance(other.instance)
    }

    /// Flushes the room and stops it. `None` if the actor was already gone.
    pub(crate) async fn shutdown(&self) -> Option<FlushOutcome> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands.send(RoomCommand::Shutdown { reply }).await.ok()?;
        reply_rx.await.ok()
    }

    fn is_instance(&self, instance: Uuid) -> bool {
        self.instance == instance
    }
}

/// Queue capacity reserved for a single Join command.
pub(crate) struct JoinSlot(mpsc::OwnedPermit<RoomCommand>);

impl JoinSlot {
    pub(crate) fn send(
        self,
        info: ConnectionInfo,
        sink: ConnectionSink,
    ) -> oneshot::Receiver<Result<(), JoinError>> {
        let (reply, reply_rx) = oneshot::channel();
        self.0.send(RoomCommand::Join { info, sink, reply });
        reply_rx
    }
}

pub(crate) fn spawn_room(
    key: RoomKey,
    store: SnapshotStore,
    config: RoomConfig,
    rooms: RoomMap,
) -> RoomHandle {
    let room_id: Arc<str> = Arc::from(key.room_id());
    let instance = Uuid::new_v4();
    let created_at = Utc::now();
    let (commands_tx, commands_rx) = mpsc::channel(config.command_queue_capacity.max(1));
    let (stats_tx, stats_rx) = watch::channel(RoomStats::initial(&key, created_at));

    let actor = RoomActor {
        key,
        room_id: Arc::clone(&room_id),
        instance,
        config,
        store,
        rooms,
        commands: commands_rx,
        stats_tx,
        doc: SceneDoc::new(),
        members: HashMap::new(),
        presence: PresenceTable::default(),
        tracker: SaveTracker::default(),
        save_task: None,
        needs_rehydrate: false,
        load_error: None,
        loaded: false,
        empty_since: None,
        closing: false,
        document_bytes: 0,
        created_at,
    };
    metrics::adjust_active_rooms(1);
    tokio::spawn(actor.run());

    RoomHandle { room_id, instance, commands: commands_tx, stats: stats_rx }
}

struct Member {
    info: ConnectionInfo,
    outbound: mpsc::Sender<WsMessage>,
    close: oneshot::Sender<CloseSignal>,
}

struct SaveResult {
    generation: u64,
    ok: bool,
    /// Stored state merged in by a degraded room's first successful save.
    rehydrated: Option<Vec<u8>>,
    bytes: usize,
}

struct RoomActor {
    key: RoomKey,
    room_id: Arc<str>,
    instance: Uuid,
    config: RoomConfig,
    store: SnapshotStore,
    rooms: RoomMap,
    commands: mpsc::Receiver<RoomCommand>,
    stats_tx: watch::Sender<RoomStats>,
    doc: SceneDoc,
    members: HashMap<Uuid, Member>,
    presence: PresenceTable,
    tracker: SaveTracker,
    save_task: Option<JoinHandle<SaveResult>>,
    needs_rehydrate: bool,
    load_error: Option<String>,
    loaded: bool,
    empty_since: Option<Instant>,
    closing: bool,
    document_bytes: usize,
    created_at: DateTime<Utc>,
}

impl RoomActor {
    async fn run(mut self) {
        info!(room_id = %self.room_id, "room created");
        self.load().await;
        self.loaded = true;
        self.empty_since = Some(Instant::now());
        self.publish_stats();

        loop {
            let save_due = if self.closing {
                None
            } else {
                self.tracker.due_at(&self.config.persistence)
            };
            let drain_at = self.drain_deadline();

            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    if self.handle_command(command).await {
                        break;
                    }
                }
                result = wait_for_save(&mut self.save_task), if self.save_task.is_some() => {
                    self.save_task = None;
                    self.on_save_finished(result);
                }
                _ = sleep_until_opt(save_due), if save_due.is_some() => {
                    self.start_save();
                }
                _ = sleep_until_opt(drain_at), if drain_at.is_some() => {
                    if self.try_teardown().await {
                        break;
                    }
                }
            }
        }

        metrics::adjust_active_rooms(-1);
    }

    async fn load(&mut self) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.load_scene_graph(self.key.site_id(), self.key.version()).await {
                Ok(Some(snapshot)) => {
                    match SceneDoc::from_state(&snapshot.state) {
                        Ok(doc) => {
                            metrics::record_snapshot_load("ok");
                            self.doc = doc;
                            self.document_bytes = snapshot.state.len();
                            self.tracker.set_last_saved_at(snapshot.updated_at);
                            info!(
                                room_id = %self.room_id,
                                version_id = %snapshot.version_id,
                                bytes = snapshot.state.len(),
                                "room loaded from snapshot"
                            );
                        }
                        Err(error) => {
                            metrics::record_snapshot_load("corrupt");
                            error!(room_id = %self.room_id, %error, "stored snapshot is unreadable");
                            self.load_error = Some(error.to_string());
                        }
                    }
                    return;
                }
                Ok(None) => {
                    metrics::record_snapshot_load("missing");
                    debug!(room_id = %self.room_id, "no stored snapshot; starting empty");
                    return;
                }
                Err(error) if attempt < LOAD_ATTEMPTS => {
                    warn!(
                        room_id = %self.room_id,
                        attempt,
                        error = %format!("{error:#}"),
                        "snapshot load failed; retrying"
                    );
                    sleep(LOAD_RETRY_BASE * 2u32.pow(attempt - 1)).await;
                }
                Err(error) => {
                    metrics::record_snapshot_load("failed");
                    error!(
                        room_id = %self.room_id,
                        attempts = attempt,
                        error = %format!("{error:#}"),
                        "snapshot load failed; serving an empty document until the store recovers"
                    );
                    self.needs_rehydrate = true;
                    self.tracker.force_dirty();
                    return;
                }
            }
        }
    }

    /// Returns `true` when the actor should stop.
    async fn handle_command(&mut self, command: RoomCommand) -> bool {
        match command {
            RoomCommand::Join { info, sink, reply } => {
                self.handle_join(info, sink, reply);
                false
            }
            RoomCommand::Frame { connection_id, message } => {
                self.handle_frame(connection_id, message);
                false
            }
            RoomCommand::Leave { connection_id } => {
                self.remove_member(connection_id);
                false
            }
            RoomCommand::Shutdown { reply } => {
                let outcome = self.flush_for_shutdown().await;
                let _ = reply.send(outcome);
                true
            }
        }
    }

    fn handle_join(
        &mut self,
        info: ConnectionInfo,
        sink: ConnectionSink,
        reply: oneshot::Sender<Result<(), JoinError>>,
    ) {
        if self.closing {
            let _ = reply.send(Err(JoinError::ShuttingDown));
            return;
        }
        if let Some(reason) = &self.load_error {
            let _ = reply.send(Err(JoinError::CorruptSnapshot(reason.clone())));
            return;
        }

        let connection_id = info.connection_id;
        let peer = PeerPresence {
            connection_id,
            user_id: info.user_id.clone(),
            name: info.name.clone(),
            color: info.color.clone(),
            state: serde_json::Value::Null,
        };
        let initial = [
            WsMessage::Welcome {
                room_id: self.room_id.to_string(),
                connection_id,
                user_id: info.user_id.clone(),
            },
            WsMessage::SyncStep2 { update: encode_payload(&self.doc.encode_state()) },
            WsMessage::SyncStep1 { state_vector: encode_payload(&self.doc.encode_state_vector()) },
            WsMessage::Presence { peers: self.presence.snapshot() },
        ];

        if reply.send(Ok(())).is_err() {
            debug!(room_id = %self.room_id, %connection_id, "joiner went away before admission");
            return;
        }

        info!(
            room_id = %self.room_id,
            %connection_id,
            user_id = %info.user_id,
            connections = self.members.len() + 1,
            "connection joined room"
        );
        self.members.insert(
            connection_id,
            Member { info, outbound: sink.outbound, close: sink.close },
        );
        self.presence.insert(peer.clone());
        self.empty_since = None;

        for frame in initial {
            self.send_to(connection_id, frame);
        }
        self.broadcast(Some(connection_id), WsMessage::Presence { peers: vec![peer] });
        self.publish_stats();
    }

    fn handle_frame(&mut self, connection_id: Uuid, message: WsMessage) {
        if !self.members.contains_key(&connection_id) {
            return;
        }

        let kind = message.kind();
        let result = match message {
            WsMessage::SyncStep1 { state_vector } => {
                self.answer_sync_step1(connection_id, &state_vector)
            }
            WsMessage::SyncStep2 { update } | WsMessage::Update { update } => {
                self.apply_client_update(connection_id, &update)
            }
            WsMessage::Awareness { state } => {
                self.update_presence(connection_id, state);
                Ok(())
            }
            other => Err(WsMessage::error(
                error_code::UNSUPPORTED_MESSAGE,
                format!("`{}` frames are only sent by the server", other.kind()),
                false,
            )),
        };

        metrics::record_ws_frame(kind, result.is_err());
        if let Err(frame) = result {
            debug!(room_id = %self.room_id, %connection_id, kind, "rejected client frame");
            self.send_to(connection_id, frame);
        }
    }

    fn answer_sync_step1(&mut self, connection_id: Uuid, state_vector: &str) -> Result<(), WsMessage> {
        let state_vector = decode_payload(state_vector).map_err(|error| {
            WsMessage::error(error_code::INVALID_PAYLOAD, error.to_string(), false)
        })?;
        let diff = self.doc.encode_diff(&state_vector).map_err(|error| {
            WsMessage::error(error_code::INVALID_UPDATE, error.to_string(), false)
        })?;
        self.send_to(connection_id, WsMessage::SyncStep2 { update: encode_payload(&diff) });
        Ok(())
    }

    fn apply_client_update(&mut self, connection_id: Uuid, update: &str) -> Result<(), WsMessage> {
        let update = decode_payload(update).map_err(|error| {
            WsMessage::error(error_code::INVALID_PAYLOAD, error.to_string(), false)
        })?;
        let delta = self.doc.apply_update(&update).map_err(|error| {
            WsMessage::error(error_code::INVALID_UPDATE, error.to_string(), false)
        })?;

        if let Some(delta) = delta {
            let was_dirty = self.tracker.is_dirty();
            self.tracker.mark_dirty(Instant::now());
            self.broadcast(Some(connection_id), WsMessage::Update { update: encode_payload(&delta) });
            if !was_dirty {
                self.publish_stats();
            }
        }
        Ok(())
    }

    fn update_presence(&mut self, connection_id: Uuid, state: serde_json::Value) {
        if let Some(peer) = self.presence.update_state(connection_id, state) {
            self.broadcast(Some(connection_id), WsMessage::Presence { peers: vec![peer] });
        }
    }

    fn send_to(&mut self, connection_id: Uuid, message: WsMessage) {
        self.deliver(vec![connection_id], &message);
    }

    fn broadcast(&mut self, exclude: Option<Uuid>, message: WsMessage) {
        let targets: Vec<Uuid> =
            self.members.keys().filter(|id| Some(**id) != exclude).copied().collect();
        self.deliver(targets, &message);
    }

    fn deliver(&mut self, targets: Vec<Uuid>, message: &WsMessage) {
        let mut slow = Vec::new();
        for connection_id in targets {
            let Some(member) = self.members.get(&connection_id) else { continue };
            match member.outbound.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => slow.push(connection_id),
                // The connection task is already gone; its Leave is on the way.
                Err(TrySendError::Closed(_)) => {}
            }
        }
        for connection_id in slow {
            self.evict(connection_id, CloseSignal::SLOW_CONSUMER);
        }
    }

    fn evict(&mut self, connection_id: Uuid, signal: CloseSignal) {
        let Some(member) = self.members.remove(&connection_id) else { return };
        metrics::record_connection_eviction(signal.reason);
        warn!(
            room_id = %self.room_id,
            %connection_id,
            user_id = %member.info.user_id,
            reason = signal.reason,
            "evicting connection"
        );
        let _ = member.close.send(signal);
        self.after_member_removed(connection_id);
    }

    fn remove_member(&mut self, connection_id: Uuid) {
        let Some(member) = self.members.remove(&connection_id) else { return };
        info!(
            room_id = %self.room_id,
            %connection_id,
            user_id = %member.info.user_id,
            connections = self.members.len(),
            "connection left room"
        );
        self.after_member_removed(connection_id);
    }

    fn after_member_removed(&mut self, connection_id: Uuid) {
        self.presence.remove(connection_id);
        self.broadcast(None, WsMessage::PresenceRemoved { connection_id });
        if self.members.is_empty() {
            self.empty_since = Some(Instant::now());
            debug!(room_id = %self.room_id, "room is empty; draining");
        }
        self.publish_stats();
    }

    fn start_save(&mut self) {
        let generation = self.tracker.begin_save();
        let state = self.doc.encode_state();
        let store = self.store.clone();
        let key = self.key.clone();
        let rehydrate = self.needs_rehydrate;
        self.save_task = Some(tokio::spawn(persist_snapshot(store, key, state, generation, rehydrate)));
        self.publish_stats();
    }

    fn on_save_finished(&mut self, result: Result<SaveResult, tokio::task::JoinError>) {
        let result = result.unwrap_or_else(|join_error| {
            error!(room_id = %self.room_id, ?join_error, "save task panicked");
            SaveResult { generation: 0, ok: false, rehydrated: None, bytes: 0 }
        });
        metrics::record_snapshot_save(result.ok);

        if result.ok && self.needs_rehydrate {
            self.needs_rehydrate = false;
            if let Some(stored) = result.rehydrated {
                match self.doc.apply_update(&stored) {
                    Ok(Some(delta)) => {
                        info!(room_id = %self.room_id, "stored snapshot merged back into live room");
                        self.broadcast(None, WsMessage::Update { update: encode_payload(&delta) });
                    }
                    Ok(None) => {}
                    Err(error) => {
                        warn!(room_id = %self.room_id, %error, "stored snapshot could not be applied live")
                    }
                }
            }
        }

        match self.tracker.finish_save(
            result.generation,
            result.ok,
            Instant::now(),
            &self.config.persistence,
        ) {
            SaveOutcome::Saved { still_dirty } => {
                self.document_bytes = result.bytes;
                debug!(room_id = %self.room_id, bytes = result.bytes, still_dirty, "room saved");
            }
            SaveOutcome::Failed { attempt, retry_in } => {
                let retry_in_ms = retry_in.as_millis() as u64;
                if attempt >= SAVE_FAILURE_ALERT_THRESHOLD {
                    error!(room_id = %self.room_id, attempt, retry_in_ms, "room save keeps failing");
                } else {
                    warn!(room_id = %self.room_id, attempt, retry_in_ms, "room save failed; will retry");
                }
            }
        }
        self.publish_stats();
    }

    async fn flush_for_shutdown(&mut self) -> FlushOutcome {
        self.closing = true;
        self.publish_stats();

        let mut saved = false;
        if let Some(task) = self.save_task.take() {
            let result = task.await;
            saved = matches!(&result, Ok(SaveResult { ok: true, .. }));
            self.on_save_finished(result);
        }
        if self.tracker.is_dirty() {
            self.start_save();
            if let Some(task) = self.save_task.take() {
                let result = task.await;
                saved |= matches!(&result, Ok(SaveResult { ok: true, .. }));
                self.on_save_finished(result);
            }
        }

        let outcome = if self.tracker.is_dirty() {
            error!(room_id = %self.room_id, "room could not be flushed before shutdown");
            FlushOutcome::Failed
        } else if saved {
            info!(room_id = %self.room_id, "room flushed for shutdown");
            FlushOutcome::Saved
        } else {
            FlushOutcome::Clean
        };

        for (_, member) in self.members.drain() {
            let _ = member.close.send(CloseSignal::GOING_AWAY);
        }
        self.presence = PresenceTable::default();
        self.publish_stats();
        outcome
    }

    fn drain_deadline(&self) -> Option<Instant> {
        if !self.members.is_empty()
            || self.closing
            || self.tracker.is_dirty()
            || self.save_task.is_some()
        {
            return None;
        }
        let grace = if self.load_error.is_some() { Duration::ZERO } else { self.config.drain_grace };
        self.empty_since.map(|since| since + grace)
    }

    /// Removes the room from the registry if nothing is queued for it.
    /// Joins are only sent while the registry lock is held, so an empty
    /// queue under that lock means no connection can still arrive.
    async fn try_teardown(&mut self) -> bool {
        let Ok(mut rooms) = self.rooms.try_lock() else {
            sleep(TEARDOWN_RETRY).await;
            return false;
        };

        match self.commands.try_recv() {
            Ok(command) => {
                drop(rooms);
                return self.handle_command(command).await;
            }
            Err(TryRecvError::Disconnected) => return true,
            Err(TryRecvError::Empty) => {}
        }

        if rooms.get(&*self.room_id).is_some_and(|handle| handle.is_instance(self.instance)) {
            rooms.remove(&*self.room_id);
        }
        self.commands.close();
        drop(rooms);

        info!(room_id = %self.room_id, "room destroyed");
        true
    }

    fn publish_stats(&self) {
        let state = if self.closing {
            RoomLifecycle::Closing
        } else if !self.loaded {
            RoomLifecycle::Loading
        } else if self.members.is_empty() {
            RoomLifecycle::Draining
        } else {
            RoomLifecycle::Active
        };

        self.stats_tx.send_replace(RoomStats {
            room_id: self.room_id.to_string(),
            site_id: self.key.site_id().to_string(),
            version: self.key.version().to_string(),
            state,
            connections: self.members.len(),
            users: self.presence.distinct_users(),
            dirty: self.tracker.is_dirty(),
            save_in_flight: self.save_task.is_some(),
            failed_save_attempts: self.tracker.failed_attempts(),
            degraded: self.needs_rehydrate,
            document_bytes: self.document_bytes,
            last_saved_at: self.tracker.last_saved_at(),
            created_at: self.created_at,
        });
    }
}

async fn persist_snapshot(
    store: SnapshotStore,
    key: RoomKey,
    state: Vec<u8>,
    generation: u64,
    rehydrate: bool,
) -> SaveResult {
    let failed = SaveResult { generation, ok: false, rehydrated: None, bytes: 0 };
    let mut state = state;
    let mut rehydrated = None;

    if rehydrate {
        match store.load_scene_graph(key.site_id(), key.version()).await {
            Ok(Some(stored)) => match merge_states(&state, &stored.state) {
                Ok(merged) => {
                    state = merged;
                    rehydrated = Some(stored.state);
                }
                Err(error) => {
                    error!(room_id = %key, %error, "stored snapshot cannot be merged; leaving it untouched");
                    return failed;
                }
            },
            Ok(None) => {}
            Err(error) => {
                warn!(room_id = %key, error = %format!("{error:#}"), "store still unavailable for rehydrate");
                return failed;
            }
        }
    }

    if !store.save_scene_graph(key.site_id(), key.version(), &state).await {
        return failed;
    }
    SaveResult { generation, ok: true, rehydrated, bytes: state.len() }
}

async fn wait_for_save(
    task: &mut Option<JoinHandle<SaveResult>>,
) -> Result<SaveResult, tokio::task::JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
