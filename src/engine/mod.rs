mod error;
mod materialize;
mod mutations;
mod policy;
mod queries;

pub use error::EngineError;
pub use materialize::{candidate_starts, day_of_week, day_start, expand_day};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedOwnerState = Arc<RwLock<OwnerState>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group
/// commit: block on the first append, drain whatever else is immediately
/// available, then a single fsync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the batch first so the non-append
                            // command sees a clean log.
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty
                    }
                }
                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub state: DashMap<Ulid, SharedOwnerState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: entity (slot/schedule) id → owner id.
    pub(super) entity_to_owner: DashMap<Ulid, Ulid>,
}

/// Apply an event directly to an OwnerState (no locking — caller holds
/// the owner's write lock).
fn apply_to_owner(os: &mut OwnerState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::TemplateSet {
            day, enabled, open, close, ..
        } => {
            os.templates[*day as usize] = Some(DayTemplate {
                enabled: *enabled,
                open: *open,
                close: *close,
            });
        }
        Event::TemplateCleared { day, .. } => {
            os.templates[*day as usize] = None;
        }
        Event::SlotAdded {
            id,
            owner_id,
            start,
            duration,
            auto_confirm,
        } => {
            os.insert_slot(FittingSlot {
                id: *id,
                start: *start,
                duration: *duration,
                booked: false,
                auto_confirm: *auto_confirm,
            });
            entity_map.insert(*id, *owner_id);
        }
        Event::SlotUpdated {
            id, start, auto_confirm, ..
        } => {
            // Remove and reinsert so the start-sorted order holds.
            if let Some(mut slot) = os.remove_slot(*id) {
                slot.start = *start;
                slot.auto_confirm = *auto_confirm;
                os.insert_slot(slot);
            }
        }
        Event::SlotRemoved { id, .. } => {
            os.remove_slot(*id);
            entity_map.remove(id);
        }
        Event::ScheduleCreated {
            id,
            owner_id,
            slot_id,
            customer_id,
            items,
            at,
        } => {
            if let Some(slot) = os.slot_mut(*slot_id) {
                slot.booked = true;
            }
            os.schedules.push(FittingSchedule {
                id: *id,
                slot_id: *slot_id,
                customer_id: *customer_id,
                status: ScheduleStatus::Scheduled,
                items: items.clone(),
                created_at: *at,
                updated_at: *at,
            });
            entity_map.insert(*id, *owner_id);
        }
        Event::ScheduleTransitioned { id, status, at, .. } => {
            let slot_id = os.schedule_mut(*id).map(|sch| {
                sch.status = *status;
                sch.updated_at = *at;
                sch.slot_id
            });
            // Cancellation releases the slot; completion keeps it booked
            // as history.
            if *status == ScheduleStatus::Cancelled
                && let Some(slot_id) = slot_id
                && let Some(slot) = os.slot_mut(slot_id)
            {
                slot.booked = false;
            }
        }
        Event::ScheduleMoved {
            id, from_slot, to_slot, at, ..
        } => {
            if let Some(sch) = os.schedule_mut(*id) {
                sch.slot_id = *to_slot;
                sch.updated_at = *at;
            }
            if let Some(slot) = os.slot_mut(*from_slot) {
                slot.booked = false;
            }
            if let Some(slot) = os.slot_mut(*to_slot) {
                slot.booked = true;
            }
        }
        Event::OwnerUpdated {
            name, slot_len, auto_confirm, ..
        } => {
            os.name = name.clone();
            os.slot_len = *slot_len;
            os.auto_confirm = *auto_confirm;
        }
        // OwnerCreated/Deleted are handled at the DashMap level, not here.
        Event::OwnerCreated { .. } | Event::OwnerDeleted { .. } => {}
    }
}

/// Extract the owner id from an event (for non-Create/Delete events).
fn event_owner_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::TemplateSet { owner_id, .. }
        | Event::TemplateCleared { owner_id, .. }
        | Event::SlotAdded { owner_id, .. }
        | Event::SlotUpdated { owner_id, .. }
        | Event::SlotRemoved { owner_id, .. }
        | Event::ScheduleCreated { owner_id, .. }
        | Event::ScheduleTransitioned { owner_id, .. }
        | Event::ScheduleMoved { owner_id, .. } => Some(*owner_id),
        Event::OwnerUpdated { id, .. } => Some(*id),
        Event::OwnerCreated { .. } | Event::OwnerDeleted { .. } => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            entity_to_owner: DashMap::new(),
        };

        // Replay — we're the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly. Never use blocking_read/blocking_write
        // here because this may run inside an async context (lazy tenant
        // creation).
        for event in &events {
            match event {
                Event::OwnerCreated {
                    id,
                    name,
                    slot_len,
                    auto_confirm,
                } => {
                    let os = OwnerState::new(*id, name.clone(), *slot_len, *auto_confirm);
                    engine.state.insert(*id, Arc::new(RwLock::new(os)));
                }
                Event::OwnerDeleted { id } => {
                    if let Some((_, os)) = engine.state.remove(id) {
                        let guard = os.try_read().expect("replay: uncontended read");
                        for slot in &guard.slots {
                            engine.entity_to_owner.remove(&slot.id);
                        }
                        for sch in &guard.schedules {
                            engine.entity_to_owner.remove(&sch.id);
                        }
                    }
                }
                other => {
                    if let Some(owner_id) = event_owner_id(other)
                        && let Some(entry) = engine.state.get(&owner_id)
                    {
                        let os = entry.value().clone();
                        let mut guard = os.try_write().expect("replay: uncontended write");
                        apply_to_owner(&mut guard, other, &engine.entity_to_owner);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub fn get_owner(&self, id: &Ulid) -> Option<SharedOwnerState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_owner_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_owner.get(entity_id).map(|e| *e.value())
    }

    pub fn owner_ids(&self) -> Vec<Ulid> {
        self.state.iter().map(|e| *e.key()).collect()
    }

    /// WAL-append + in-memory apply in one call. Notifications are
    /// dispatched by the caller afterwards — strictly post-commit.
    pub(super) async fn persist_and_apply(
        &self,
        os: &mut OwnerState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_owner(os, event, &self.entity_to_owner);
        Ok(())
    }

    /// Lookup entity → owner, fetch the owner state, acquire its write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<OwnerState>), EngineError> {
        let owner_id = self
            .get_owner_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let os = self
            .get_owner(&owner_id)
            .ok_or(EngineError::NotFound(owner_id))?;
        let guard = os.write_owned().await;
        Ok((owner_id, guard))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
