//! Document rooms and the process-wide room registry.
//!
//! A [`DocumentRoom`] owns the authoritative Yrs document for one note while
//! at least one connection is attached, plus the broadcast group and presence
//! map serving those connections. All document access goes through the room's
//! methods, which take Yrs transactions — nothing else touches the state.
//!
//! The [`RoomRegistry`] is the single owner of open rooms. Lifecycle:
//!
//! - created on first join, hydrated from the snapshot store *before* the
//!   room becomes visible to anyone (no update can reach an unhydrated doc)
//! - evicted only after a successful flush with zero members; a room with
//!   unflushed edits stays resident until some flush succeeds
//! - the periodic checkpoint flushes dirty rooms and sweeps empty ones

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::ReadTxn;

use crate::auth::Identity;
use crate::awareness::PresenceRoom;
use crate::broadcast::BroadcastGroup;
use crate::protocol::DocumentName;
use crate::storage::{SnapshotStore, StoreError};

/// Transient hydrate read failures are retried this many times.
const HYDRATE_RETRY_LIMIT: u32 = 3;
/// Initial hydrate retry backoff; doubles per attempt.
const HYDRATE_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Last-disconnect flush attempts before giving up and keeping the room.
const FLUSH_RETRY_LIMIT: u32 = 3;
/// Initial flush retry backoff; doubles per attempt.
const FLUSH_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Consecutive checkpoint flush failures before escalating to error severity.
const FLUSH_ALERT_THRESHOLD: u32 = 5;

/// Room-level errors.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Malformed CRDT update: {0}")]
    MalformedUpdate(String),
    #[error("Update rejected by merge engine: {0}")]
    MergeFailed(String),
    #[error("Malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One open collaborative document.
pub struct DocumentRoom {
    name: DocumentName,
    /// Authoritative Yrs document; the mutex serializes transactions so the
    /// room can be shared across connection tasks and in-flight flushes
    doc: Mutex<yrs::Doc>,
    /// Fan-out group for this room's connections
    pub broadcast: Arc<BroadcastGroup>,
    /// Ephemeral presence map
    pub presence: PresenceRoom,
    /// Updates applied since the last successful flush
    pending_edits: AtomicU64,
    /// Consecutive flush failures, for operator escalation
    flush_failures: AtomicU32,
    /// Identity of the most recent writer (flush attribution for checkpoints)
    last_editor: RwLock<Identity>,
}

impl DocumentRoom {
    pub fn new(name: DocumentName, broadcast_capacity: usize) -> Self {
        Self {
            name,
            doc: Mutex::new(yrs::Doc::new()),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
            presence: PresenceRoom::new(),
            pending_edits: AtomicU64::new(0),
            flush_failures: AtomicU32::new(0),
            last_editor: RwLock::new(Identity::anonymous()),
        }
    }

    pub fn name(&self) -> &DocumentName {
        &self.name
    }

    /// Apply a persisted snapshot during hydration.
    ///
    /// Does not mark the room dirty — the state came *from* the store.
    async fn hydrate_from(&self, snapshot: &[u8]) -> Result<(), RoomError> {
        let update = yrs::Update::decode_v1(snapshot)
            .map_err(|e| RoomError::MalformedUpdate(e.to_string()))?;
        let doc = self.doc.lock().await;
        let mut txn = yrs::Transact::transact_mut(&*doc);
        txn.apply_update(update)
            .map_err(|e| RoomError::MergeFailed(e.to_string()))?;
        Ok(())
    }

    /// Integrate an update from a connection into the document.
    pub async fn apply_update(&self, update: &[u8], editor: &Identity) -> Result<(), RoomError> {
        let decoded = yrs::Update::decode_v1(update)
            .map_err(|e| RoomError::MalformedUpdate(e.to_string()))?;
        {
            let doc = self.doc.lock().await;
            let mut txn = yrs::Transact::transact_mut(&*doc);
            txn.apply_update(decoded)
                .map_err(|e| RoomError::MergeFailed(e.to_string()))?;
        }
        self.pending_edits.fetch_add(1, Ordering::SeqCst);
        *self.last_editor.write().await = editor.clone();
        Ok(())
    }

    /// Encode the full document state as a single update.
    pub async fn encode_full_state(&self) -> Vec<u8> {
        let doc = self.doc.lock().await;
        let txn = yrs::Transact::transact(&*doc);
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }

    /// Encode the document's state vector.
    pub async fn state_vector(&self) -> Vec<u8> {
        let doc = self.doc.lock().await;
        let txn = yrs::Transact::transact(&*doc);
        txn.state_vector().encode_v1()
    }

    /// Encode a diff against a remote state vector.
    pub async fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, RoomError> {
        let sv = yrs::StateVector::decode_v1(remote_sv)
            .map_err(|e| RoomError::MalformedStateVector(e.to_string()))?;
        let doc = self.doc.lock().await;
        let txn = yrs::Transact::transact(&*doc);
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Updates applied since the last successful flush.
    pub fn pending_edits(&self) -> u64 {
        self.pending_edits.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.pending_edits() > 0
    }

    /// Identity of the most recent writer.
    pub async fn last_editor(&self) -> Identity {
        self.last_editor.read().await.clone()
    }

    /// Flush the current state to the store, attributed to `trigger`.
    ///
    /// Clears the dirty counter only for edits that were already applied
    /// when the state was captured; edits racing in stay pending.
    pub async fn flush(&self, store: &SnapshotStore, trigger: &Identity) -> Result<(), RoomError> {
        let captured = self.pending_edits.load(Ordering::SeqCst);
        let state = self.encode_full_state().await;
        store.save_snapshot(self.name.note_id(), &state, trigger)?;
        self.pending_edits.fetch_sub(captured, Ordering::SeqCst);
        self.flush_failures.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Record a failed flush; returns the consecutive failure count.
    fn record_flush_failure(&self) -> u32 {
        self.flush_failures.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Process-wide registry of open rooms.
///
/// Invariant: an entry exists iff at least one connection references the
/// room, or the room still holds unflushed state awaiting a successful flush.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<DocumentRoom>>>,
    store: Option<Arc<SnapshotStore>>,
    broadcast_capacity: usize,
}

impl RoomRegistry {
    pub fn new(store: Option<Arc<SnapshotStore>>, broadcast_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            broadcast_capacity,
        }
    }

    /// Get the room for a document, creating and hydrating it if cold.
    ///
    /// Hydration completes before the room is inserted into the registry, so
    /// no caller can apply an update to a doc that hasn't absorbed its
    /// persisted history yet. A racing create for the same document is
    /// resolved under the write lock; the loser's room is discarded unused.
    pub async fn open(&self, name: &DocumentName) -> Arc<DocumentRoom> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name.as_str()) {
                return room.clone();
            }
        }

        let room = Arc::new(DocumentRoom::new(name.clone(), self.broadcast_capacity));
        if let Some(ref store) = self.store {
            self.hydrate(&room, store).await;
        }

        let mut rooms = self.rooms.write().await;
        if let Some(existing) = rooms.get(name.as_str()) {
            return existing.clone();
        }
        rooms.insert(name.as_str().to_string(), room.clone());
        log::info!("Opened room {name}");
        room
    }

    /// Look up an open room without creating one.
    pub async fn get(&self, name: &str) -> Option<Arc<DocumentRoom>> {
        self.rooms.read().await.get(name).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn open_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Load persisted state into a fresh room, retrying transient failures.
    ///
    /// `NotFound` is the normal bootstrap for a brand-new note. A read that
    /// keeps failing falls back to an empty document — logged at error
    /// severity because starting empty over an existing snapshot is a
    /// correctness risk an operator needs to see.
    async fn hydrate(&self, room: &DocumentRoom, store: &SnapshotStore) {
        let note_id = room.name().note_id().to_string();
        let mut backoff = HYDRATE_RETRY_BACKOFF;

        for attempt in 1..=HYDRATE_RETRY_LIMIT {
            match store.load_snapshot(&note_id) {
                Ok(snapshot) => match room.hydrate_from(&snapshot).await {
                    Ok(()) => {
                        log::info!("Hydrated room {} from snapshot", room.name());
                        return;
                    }
                    Err(e) => {
                        // A snapshot that doesn't decode won't improve with
                        // retries; start empty and alert
                        log::error!(
                            "Snapshot for {} exists but is unreadable ({e}); \
                             starting from empty state",
                            room.name()
                        );
                        return;
                    }
                },
                Err(e) if e.is_not_found() => {
                    log::info!("No snapshot for {}; starting a new document", room.name());
                    return;
                }
                Err(e) if attempt < HYDRATE_RETRY_LIMIT => {
                    log::warn!(
                        "Hydrate read for {} failed (attempt {attempt}/{HYDRATE_RETRY_LIMIT}): {e}",
                        room.name()
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    log::error!(
                        "Hydrate for {} exhausted retries ({e}); starting from empty \
                         state despite a possibly existing snapshot",
                        room.name()
                    );
                    return;
                }
            }
        }
    }

    /// Handle a connection leaving its room.
    ///
    /// If the room still has members this is a no-op. Otherwise the room is
    /// flushed (with bounded retries) and evicted on success. Exhausted
    /// retries keep the room resident — in-memory state is never discarded —
    /// and the checkpoint task keeps retrying it.
    pub async fn release(&self, room: &Arc<DocumentRoom>, departing: &Identity) {
        if room.broadcast.member_count().await > 0 {
            return;
        }

        if let Some(ref store) = self.store {
            if room.is_dirty() || !store.snapshot_exists(room.name().note_id()).unwrap_or(true) {
                let mut backoff = FLUSH_RETRY_BACKOFF;
                let mut flushed = false;
                for attempt in 1..=FLUSH_RETRY_LIMIT {
                    match room.flush(store, departing).await {
                        Ok(()) => {
                            log::info!("Flushed {} on last disconnect", room.name());
                            flushed = true;
                            break;
                        }
                        Err(e) if attempt < FLUSH_RETRY_LIMIT => {
                            log::warn!(
                                "Flush of {} failed (attempt {attempt}/{FLUSH_RETRY_LIMIT}): {e}",
                                room.name()
                            );
                            tokio::time::sleep(backoff).await;
                            backoff *= 2;
                        }
                        Err(e) => {
                            room.record_flush_failure();
                            log::error!(
                                "Flush of {} exhausted retries ({e}); keeping room resident \
                                 with unflushed edits until a checkpoint flush succeeds",
                                room.name()
                            );
                        }
                    }
                }
                if !flushed {
                    return;
                }
            }
        }

        self.evict_if_idle(room).await;
    }

    /// Periodic checkpoint: flush dirty rooms, sweep empty clean ones.
    pub async fn checkpoint(&self) {
        let rooms: Vec<Arc<DocumentRoom>> =
            self.rooms.read().await.values().cloned().collect();

        for room in rooms {
            if let Some(ref store) = self.store {
                if room.is_dirty() {
                    let trigger = room.last_editor().await;
                    match room.flush(store, &trigger).await {
                        Ok(()) => log::debug!("Checkpoint flushed {}", room.name()),
                        Err(e) => {
                            let failures = room.record_flush_failure();
                            if failures >= FLUSH_ALERT_THRESHOLD {
                                log::error!(
                                    "Checkpoint flush of {} has failed {failures} times in a row: {e}",
                                    room.name()
                                );
                            } else {
                                log::warn!(
                                    "Checkpoint flush of {} failed, will retry: {e}",
                                    room.name()
                                );
                            }
                            continue;
                        }
                    }
                }
            }

            if room.broadcast.member_count().await == 0 {
                self.evict_if_idle(&room).await;
            }
        }
    }

    /// Best-effort flush of every open room (shutdown path).
    pub async fn flush_all(&self) {
        let store = match self.store {
            Some(ref s) => s.clone(),
            None => return,
        };

        let rooms: Vec<Arc<DocumentRoom>> =
            self.rooms.read().await.values().cloned().collect();
        for room in rooms {
            if !room.is_dirty() {
                continue;
            }
            let trigger = room.last_editor().await;
            match room.flush(&store, &trigger).await {
                Ok(()) => log::info!("Shutdown flush of {} complete", room.name()),
                Err(e) => log::error!("Shutdown flush of {} failed: {e}", room.name()),
            }
        }
    }

    /// Remove a room from the registry if it is still empty and clean.
    async fn evict_if_idle(&self, room: &Arc<DocumentRoom>) {
        let mut rooms = self.rooms.write().await;
        let still_current = rooms
            .get(room.name().as_str())
            .is_some_and(|current| Arc::ptr_eq(current, room));
        if !still_current {
            return;
        }
        // Re-check under the write lock: a join racing this eviction would
        // have gone through `open`, which holds the same lock to insert.
        // Unflushed edits only pin a room when there is a store to flush to
        let holds_unflushed = self.store.is_some() && room.is_dirty();
        if room.broadcast.member_count().await == 0 && !holds_unflushed {
            rooms.remove(room.name().as_str());
            log::info!("Room {} evicted (empty)", room.name());
        }
    }
}
