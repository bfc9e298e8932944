// Room registry: owns the map of live rooms for this process.
//
// Room creation happens under the map lock, and so does every Join send.
// Queue space for the Join is reserved before the lock is taken, so a backed-up
// room never stalls other rooms. Rooms remove themselves under the same lock
// (see `RoomActor::try_teardown`), which keeps at most one room per key alive
// and never tears down a room a connection is about to join.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scenesync_common::room::RoomKey;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::RoomConfig;
use crate::db::SnapshotStore;
use crate::room::{
    spawn_room, ConnectionInfo, ConnectionSink, FlushOutcome, JoinError, RoomHandle, RoomStats,
};

pub(crate) type RoomMap = Arc<Mutex<HashMap<String, RoomHandle>>>;

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_rooms: usize,
    pub total_connections: usize,
    pub dirty_rooms: usize,
    pub rooms: Vec<RoomStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Rooms that ended clean, either saved during shutdown or already saved.
    pub flushed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

pub struct RoomRegistry {
    rooms: RoomMap,
    store: SnapshotStore,
    config: RoomConfig,
    shutting_down: AtomicBool,
}

impl RoomRegistry {
    pub fn new(store: SnapshotStore, config: RoomConfig) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            store,
            config,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Binds a connection to the room for `key`, creating (and loading) the
    /// room on first use. On success the joiner's queue already holds the
    /// welcome, full state, server state vector and peer presence frames.
    pub async fn handle_connection(
        &self,
        key: &RoomKey,
        info: ConnectionInfo,
        sink: ConnectionSink,
    ) -> Result<RoomHandle, JoinError> {
        let room_id = key.room_id();
        let (handle, reply) = loop {
            let handle = {
                let mut rooms = self.rooms.lock().await;
                if self.is_shutting_down() {
                    return Err(JoinError::ShuttingDown);
                }
                match rooms.get(&room_id) {
                    Some(handle) if !handle.is_closed() => handle.clone(),
                    _ => {
                        let handle = spawn_room(
                            key.clone(),
                            self.store.clone(),
                            self.config.clone(),
                            Arc::clone(&self.rooms),
                        );
                        rooms.insert(room_id.clone(), handle.clone());
                        handle
                    }
                }
            };

            let Ok(slot) = handle.reserve_join().await else { continue };

            let rooms = self.rooms.lock().await;
            if self.is_shutting_down() {
                return Err(JoinError::ShuttingDown);
            }
            // The room may have torn down (or been replaced) while we waited.
            if !rooms.get(&room_id).is_some_and(|current| current.same_room(&handle)) {
                continue;
            }
            break (handle, slot.send(info, sink));
        };

        reply.await.map_err(|_| JoinError::RoomClosed)??;
        Ok(handle)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Snapshot of every room's last published stats.
    pub async fn stats(&self) -> RegistryStats {
        let handles: Vec<RoomHandle> = self.rooms.lock().await.values().cloned().collect();
        let mut rooms: Vec<RoomStats> = handles.iter().map(RoomHandle::stats).collect();
        rooms.sort_by(|left, right| left.room_id.cmp(&right.room_id));

        RegistryStats {
            total_rooms: rooms.len(),
            total_connections: rooms.iter().map(|room| room.connections).sum(),
            dirty_rooms: rooms.iter().filter(|room| room.dirty).count(),
            rooms,
        }
    }

    pub async fn room_stats(&self, room_id: &str) -> Option<RoomStats> {
        self.rooms.lock().await.get(room_id).map(RoomHandle::stats)
    }

    /// Stops admitting connections and flushes every room, waiting at most
    /// `timeout` overall.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let handles: Vec<RoomHandle> = {
            let mut rooms = self.rooms.lock().await;
            self.shutting_down.store(true, Ordering::SeqCst);
            rooms.drain().map(|(_, handle)| handle).collect()
        };
        info!(rooms = handles.len(), timeout_ms = timeout.as_millis() as u64, "flushing rooms for shutdown");

        let deadline = tokio::time::Instant::now() + timeout;
        let mut flushes = JoinSet::new();
        for handle in handles {
            flushes.spawn(async move {
                let room_id = handle.room_id().to_string();
                let outcome = tokio::time::timeout_at(deadline, handle.shutdown()).await;
                (room_id, outcome)
            });
        }

        let mut report = ShutdownReport::default();
        while let Some(joined) = flushes.join_next().await {
            match joined {
                // An actor that already exited had nothing left to save.
                Ok((_, Ok(Some(FlushOutcome::Saved | FlushOutcome::Clean) | None))) => {
                    report.flushed += 1
                }
                Ok((room_id, Ok(Some(FlushOutcome::Failed)))) => {
                    warn!(%room_id, "room flush failed during shutdown");
                    report.failed += 1;
                }
                Ok((room_id, Err(_))) => {
                    warn!(%room_id, "room flush timed out during shutdown");
                    report.timed_out += 1;
                }
                Err(join_error) => {
                    warn!(?join_error, "room flush task panicked");
                    report.failed += 1;
                }
            }
        }

        info!(
            flushed = report.flushed,
            failed = report.failed,
            timed_out = report.timed_out,
            "room shutdown complete"
        );
        report
    }
}
