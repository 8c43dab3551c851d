use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;

use super::materialize::candidate_starts;
use super::{now_ms, policy, Engine, EngineError, SharedOwnerState, WalCommand};

fn validate_instant(t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

fn validate_name(name: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("owner name too long"));
    }
    Ok(())
}

fn validate_slot_len(len: Ms) -> Result<(), EngineError> {
    if !(MIN_SLOT_LEN_MS..=MAX_SLOT_LEN_MS).contains(&len) {
        return Err(EngineError::Validation("appointment length out of bounds"));
    }
    Ok(())
}

/// Acquire the owner's write lock with a bounded number of timed
/// attempts. Reservations surface contention instead of blocking forever.
async fn write_owned_bounded(
    os: SharedOwnerState,
    entity_id: Ulid,
) -> Result<tokio::sync::OwnedRwLockWriteGuard<OwnerState>, EngineError> {
    for attempt in 0..RESERVE_LOCK_ATTEMPTS {
        let acquire = Arc::clone(&os).write_owned();
        match tokio::time::timeout(Duration::from_millis(RESERVE_LOCK_TIMEOUT_MS), acquire).await {
            Ok(guard) => return Ok(guard),
            Err(_) => {
                tracing::debug!("write lock attempt {attempt} timed out for {entity_id}");
            }
        }
    }
    Err(EngineError::Contended(entity_id))
}

fn booking_payload(
    schedule_id: Ulid,
    owner_id: Ulid,
    slot_id: Ulid,
    customer_id: Ulid,
    start: Ms,
) -> serde_json::Value {
    json!({
        "schedule_id": schedule_id.to_string(),
        "owner_id": owner_id.to_string(),
        "slot_id": slot_id.to_string(),
        "customer_id": customer_id.to_string(),
        "start": start,
    })
}

impl Engine {
    // ── Owner records ────────────────────────────────────────

    pub async fn create_owner(
        &self,
        actor: &Actor,
        id: Ulid,
        name: Option<String>,
        slot_len: Ms,
        auto_confirm: bool,
    ) -> Result<(), EngineError> {
        policy::require_self_owner(actor, id)?;
        validate_name(&name)?;
        validate_slot_len(slot_len)?;
        if self.state.len() >= MAX_OWNERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many owners"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::OwnerCreated {
            id,
            name: name.clone(),
            slot_len,
            auto_confirm,
        };
        self.wal_append(&event).await?;
        let os = OwnerState::new(id, name, slot_len, auto_confirm);
        self.state.insert(id, Arc::new(RwLock::new(os)));
        Ok(())
    }

    pub async fn update_owner(
        &self,
        actor: &Actor,
        id: Ulid,
        name: Option<String>,
        slot_len: Option<Ms>,
        auto_confirm: Option<bool>,
    ) -> Result<(), EngineError> {
        policy::require_self_owner(actor, id)?;
        validate_name(&name)?;
        let os = self.get_owner(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = os.write_owned().await;

        let name = name.or_else(|| guard.name.clone());
        let slot_len = slot_len.unwrap_or(guard.slot_len);
        let auto_confirm = auto_confirm.unwrap_or(guard.auto_confirm);
        validate_slot_len(slot_len)?;

        let event = Event::OwnerUpdated {
            id,
            name,
            slot_len,
            auto_confirm,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Delete an owner record. Refused while any booking is still in
    /// flight; completed and cancelled history goes with the owner.
    pub async fn delete_owner(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        policy::require_self_owner(actor, id)?;
        let os = self.get_owner(&id).ok_or(EngineError::NotFound(id))?;
        let guard = os.write_owned().await;
        if let Some(sch) = guard
            .schedules
            .iter()
            .find(|s| matches!(s.status, ScheduleStatus::Scheduled | ScheduleStatus::InProgress))
        {
            return Err(EngineError::AlreadyBooked(sch.slot_id));
        }

        let event = Event::OwnerDeleted { id };
        self.wal_append(&event).await?;
        for slot in &guard.slots {
            self.entity_to_owner.remove(&slot.id);
        }
        for sch in &guard.schedules {
            self.entity_to_owner.remove(&sch.id);
        }
        drop(guard);
        self.state.remove(&id);
        self.notify.remove(&id);
        Ok(())
    }

    // ── Weekly templates ─────────────────────────────────────

    /// Set (or replace) the working-hours rule for one weekday. There is
    /// at most one rule per (owner, weekday); setting again overwrites.
    pub async fn set_template(
        &self,
        actor: &Actor,
        owner_id: Ulid,
        day: u8,
        enabled: bool,
        open: Ms,
        close: Ms,
    ) -> Result<(), EngineError> {
        policy::require_self_owner(actor, owner_id)?;
        if day > 6 {
            return Err(EngineError::Validation("weekday must be 0-6"));
        }
        if enabled && !(0 <= open && open < close && close <= DAY_MS) {
            return Err(EngineError::Validation(
                "enabled template requires 0 <= open < close <= 24h",
            ));
        }
        let os = self.get_owner(&owner_id).ok_or(EngineError::NotFound(owner_id))?;
        let mut guard = os.write_owned().await;

        let event = Event::TemplateSet {
            owner_id,
            day,
            enabled,
            open,
            close,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn clear_template(
        &self,
        actor: &Actor,
        owner_id: Ulid,
        day: u8,
    ) -> Result<(), EngineError> {
        policy::require_self_owner(actor, owner_id)?;
        if day > 6 {
            return Err(EngineError::Validation("weekday must be 0-6"));
        }
        let os = self.get_owner(&owner_id).ok_or(EngineError::NotFound(owner_id))?;
        let mut guard = os.write_owned().await;

        let event = Event::TemplateCleared { owner_id, day };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Materialization ──────────────────────────────────────

    pub async fn materialize(
        &self,
        actor: &Actor,
        owner_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<usize, EngineError> {
        policy::require_self_owner(actor, owner_id)?;
        self.materialize_range(owner_id, from, to).await
    }

    /// Expand the owner's weekly templates into concrete slots over
    /// `[from, to)`. Idempotent: candidates that already exist (by exact
    /// start, booked or not) or are not strictly in the future are
    /// skipped. A persistence failure on one candidate is logged and
    /// skipped; the call reports the count actually created.
    pub(crate) async fn materialize_range(
        &self,
        owner_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<usize, EngineError> {
        if to < from {
            return Err(EngineError::Validation("range end before range start"));
        }
        validate_instant(from)?;
        validate_instant(to)?;
        if to - from > MAX_MATERIALIZE_RANGE_MS {
            return Err(EngineError::LimitExceeded("materialize range too wide"));
        }
        let os = self.get_owner(&owner_id).ok_or(EngineError::NotFound(owner_id))?;
        let mut guard = os.write_owned().await;

        let now = now_ms();
        let mut created = 0usize;
        for start in candidate_starts(&guard.templates, guard.slot_len, from, to) {
            if start <= now || guard.has_slot_at(start) {
                continue;
            }
            if guard.slots.len() >= MAX_SLOTS_PER_OWNER {
                tracing::warn!("owner {owner_id}: slot cap reached, stopping materialization");
                break;
            }
            let event = Event::SlotAdded {
                id: Ulid::new(),
                owner_id,
                start,
                duration: guard.slot_len,
                auto_confirm: guard.auto_confirm,
            };
            match self.persist_and_apply(&mut guard, &event).await {
                Ok(()) => created += 1,
                Err(e) => {
                    tracing::warn!("owner {owner_id}: slot at {start} not persisted: {e}");
                }
            }
        }
        if created > 0 {
            metrics::counter!(crate::observability::SLOTS_MATERIALIZED_TOTAL)
                .increment(created as u64);
        }
        Ok(created)
    }

    // ── Slots ────────────────────────────────────────────────

    /// Ad hoc slot creation: same uniqueness and future rules as
    /// materialization, but bypasses templates entirely.
    pub async fn create_slot(
        &self,
        actor: &Actor,
        id: Ulid,
        owner_id: Ulid,
        start: Ms,
        duration: Option<Ms>,
    ) -> Result<(), EngineError> {
        policy::require_self_owner(actor, owner_id)?;
        validate_instant(start)?;
        let os = self.get_owner(&owner_id).ok_or(EngineError::NotFound(owner_id))?;
        let mut guard = os.write_owned().await;

        if guard.slots.len() >= MAX_SLOTS_PER_OWNER {
            return Err(EngineError::LimitExceeded("too many slots for owner"));
        }
        if self.entity_to_owner.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(existing) = guard.slot_at_start(start) {
            return Err(EngineError::AlreadyExists(existing.id));
        }
        if start <= now_ms() {
            return Err(EngineError::SlotInPast(id));
        }
        let duration = duration.unwrap_or(guard.slot_len);
        validate_slot_len(duration)?;

        let event = Event::SlotAdded {
            id,
            owner_id,
            start,
            duration,
            auto_confirm: guard.auto_confirm,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Move a slot or flip its confirmation policy. Only while unbooked.
    pub async fn update_slot(
        &self,
        actor: &Actor,
        id: Ulid,
        start: Option<Ms>,
        auto_confirm: Option<bool>,
    ) -> Result<(), EngineError> {
        let (owner_id, mut guard) = self.resolve_entity_write(&id).await?;
        policy::require_self_owner(actor, owner_id)?;
        let slot = guard.slot(id).ok_or(EngineError::NotFound(id))?;
        if slot.booked {
            return Err(EngineError::AlreadyBooked(id));
        }
        let current_start = slot.start;
        let current_auto = slot.auto_confirm;

        let new_start = start.unwrap_or(current_start);
        if new_start != current_start {
            validate_instant(new_start)?;
            if new_start <= now_ms() {
                return Err(EngineError::SlotInPast(id));
            }
            if let Some(existing) = guard.slot_at_start(new_start) {
                return Err(EngineError::AlreadyExists(existing.id));
            }
        }

        let event = Event::SlotUpdated {
            id,
            owner_id,
            start: new_start,
            auto_confirm: auto_confirm.unwrap_or(current_auto),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Delete a never-booked slot. Booked slots are permanent history.
    pub async fn delete_slot(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        let (owner_id, mut guard) = self.resolve_entity_write(&id).await?;
        policy::require_self_owner(actor, owner_id)?;
        let slot = guard.slot(id).ok_or(EngineError::NotFound(id))?;
        if slot.booked {
            return Err(EngineError::AlreadyBooked(id));
        }

        let event = Event::SlotRemoved { id, owner_id };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Booking ──────────────────────────────────────────────

    /// Atomically reserve a slot into a new schedule. The unbooked check
    /// and the booked-flip-plus-append happen under the owner's write
    /// lock: of N concurrent reserves on one slot exactly one wins, the
    /// rest see `AlreadyBooked`.
    pub async fn reserve(
        &self,
        actor: &Actor,
        id: Ulid,
        slot_id: Ulid,
        customer_id: Ulid,
        items: Option<String>,
    ) -> Result<ScheduleInfo, EngineError> {
        if let Some(ref payload) = items
            && payload.len() > MAX_ITEMS_LEN
        {
            return Err(EngineError::LimitExceeded("items payload too long"));
        }
        let owner_id = self
            .get_owner_for_entity(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        policy::authorize_reserve(actor, owner_id, customer_id)?;
        let os = self
            .get_owner(&owner_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let mut guard = write_owned_bounded(os, slot_id).await?;

        if guard.schedules.len() >= MAX_SCHEDULES_PER_OWNER {
            return Err(EngineError::LimitExceeded("too many schedules for owner"));
        }
        if self.entity_to_owner.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        // Re-check under the lock: the slot may have been deleted or
        // taken since the index lookup.
        let slot = guard.slot(slot_id).ok_or(EngineError::NotFound(slot_id))?;
        if slot.booked {
            return Err(EngineError::AlreadyBooked(slot_id));
        }
        let now = now_ms();
        if slot.start <= now {
            return Err(EngineError::SlotInPast(slot_id));
        }
        let start = slot.start;
        let auto_confirm = slot.auto_confirm;

        let event = Event::ScheduleCreated {
            id,
            owner_id,
            slot_id,
            customer_id,
            items: items.clone(),
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        // Post-commit: auto_confirm only decides which notifications
        // fire, never the schedule state.
        let payload = booking_payload(id, owner_id, slot_id, customer_id, start);
        self.notify.send(Notice {
            recipient: owner_id,
            event: if auto_confirm {
                "booking.created"
            } else {
                "booking.approval_requested"
            },
            payload: payload.clone(),
        });
        self.notify.send(Notice {
            recipient: customer_id,
            event: if auto_confirm {
                "booking.confirmed"
            } else {
                "booking.pending"
            },
            payload,
        });

        Ok(ScheduleInfo {
            id,
            owner_id,
            slot_id,
            customer_id,
            status: ScheduleStatus::Scheduled,
            items,
            created_at: now,
            updated_at: now,
        })
    }

    // ── Status transitions ───────────────────────────────────

    pub async fn transition(
        &self,
        actor: &Actor,
        schedule_id: Ulid,
        target: ScheduleStatus,
    ) -> Result<ScheduleInfo, EngineError> {
        let (owner_id, mut guard) = self.resolve_entity_write(&schedule_id).await?;
        let sch = guard
            .schedule(schedule_id)
            .ok_or(EngineError::NotFound(schedule_id))?;
        policy::authorize_transition(actor, owner_id, sch.customer_id, sch.status, target)?;
        let slot_id = sch.slot_id;
        let customer_id = sch.customer_id;
        let items = sch.items.clone();
        let created_at = sch.created_at;
        let slot_start = guard.slot(slot_id).map(|s| s.start).unwrap_or_default();

        let now = now_ms();
        let event = Event::ScheduleTransitioned {
            id: schedule_id,
            owner_id,
            status: target,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        let payload = booking_payload(schedule_id, owner_id, slot_id, customer_id, slot_start);
        match target {
            ScheduleStatus::Cancelled => {
                self.notify.send(Notice {
                    recipient: owner_id,
                    event: "schedule.cancelled",
                    payload: payload.clone(),
                });
                self.notify.send(Notice {
                    recipient: customer_id,
                    event: "schedule.cancelled",
                    payload,
                });
            }
            ScheduleStatus::InProgress => self.notify.send(Notice {
                recipient: customer_id,
                event: "schedule.in_progress",
                payload,
            }),
            ScheduleStatus::Completed => self.notify.send(Notice {
                recipient: customer_id,
                event: "schedule.completed",
                payload,
            }),
            ScheduleStatus::Scheduled => {}
        }

        Ok(ScheduleInfo {
            id: schedule_id,
            owner_id,
            slot_id,
            customer_id,
            status: target,
            items,
            created_at,
            updated_at: now,
        })
    }

    // ── Rescheduling ─────────────────────────────────────────

    /// Move a schedule to a different slot of the same owner as one
    /// atomic unit. Any validation failure leaves the old slot booked
    /// and the schedule untouched.
    pub async fn reschedule(
        &self,
        actor: &Actor,
        schedule_id: Ulid,
        new_slot_id: Ulid,
    ) -> Result<ScheduleInfo, EngineError> {
        let (owner_id, mut guard) = self.resolve_entity_write(&schedule_id).await?;
        let sch = guard
            .schedule(schedule_id)
            .ok_or(EngineError::NotFound(schedule_id))?;
        // Rescheduling requires exactly the rights cancelling would.
        policy::authorize_transition(
            actor,
            owner_id,
            sch.customer_id,
            sch.status,
            ScheduleStatus::Cancelled,
        )?;
        let from_slot = sch.slot_id;
        let customer_id = sch.customer_id;
        let items = sch.items.clone();
        let created_at = sch.created_at;
        let status = sch.status;

        if new_slot_id == from_slot {
            return Err(EngineError::Validation("schedule already uses this slot"));
        }
        match self.get_owner_for_entity(&new_slot_id) {
            None => return Err(EngineError::NotFound(new_slot_id)),
            Some(o) if o != owner_id => {
                return Err(EngineError::Validation("slot belongs to a different owner"));
            }
            Some(_) => {}
        }
        let new_slot = guard
            .slot(new_slot_id)
            .ok_or(EngineError::NotFound(new_slot_id))?;
        if new_slot.booked {
            return Err(EngineError::AlreadyBooked(new_slot_id));
        }
        let now = now_ms();
        if new_slot.start <= now {
            return Err(EngineError::SlotInPast(new_slot_id));
        }
        let new_start = new_slot.start;

        let event = Event::ScheduleMoved {
            id: schedule_id,
            owner_id,
            from_slot,
            to_slot: new_slot_id,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        let payload = booking_payload(schedule_id, owner_id, new_slot_id, customer_id, new_start);
        self.notify.send(Notice {
            recipient: owner_id,
            event: "schedule.moved",
            payload: payload.clone(),
        });
        self.notify.send(Notice {
            recipient: customer_id,
            event: "schedule.moved",
            payload,
        });

        Ok(ScheduleInfo {
            id: schedule_id,
            owner_id,
            slot_id: new_slot_id,
            customer_id,
            status,
            items,
            created_at,
            updated_at: now,
        })
    }

    // ── WAL compaction ───────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the
    /// current state. Per owner: the record itself, its templates and
    /// slots, then each schedule's creation plus its final status.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let owners: Vec<SharedOwnerState> =
            self.state.iter().map(|e| e.value().clone()).collect();

        let mut events = Vec::new();
        for os in owners {
            let guard = os.read().await;
            events.push(Event::OwnerCreated {
                id: guard.id,
                name: guard.name.clone(),
                slot_len: guard.slot_len,
                auto_confirm: guard.auto_confirm,
            });
            for (day, tpl) in guard.templates.iter().enumerate() {
                if let Some(tpl) = tpl {
                    events.push(Event::TemplateSet {
                        owner_id: guard.id,
                        day: day as u8,
                        enabled: tpl.enabled,
                        open: tpl.open,
                        close: tpl.close,
                    });
                }
            }
            for slot in &guard.slots {
                events.push(Event::SlotAdded {
                    id: slot.id,
                    owner_id: guard.id,
                    start: slot.start,
                    duration: slot.duration,
                    auto_confirm: slot.auto_confirm,
                });
            }
            for sch in &guard.schedules {
                events.push(Event::ScheduleCreated {
                    id: sch.id,
                    owner_id: guard.id,
                    slot_id: sch.slot_id,
                    customer_id: sch.customer_id,
                    items: sch.items.clone(),
                    at: sch.created_at,
                });
                if sch.status != ScheduleStatus::Scheduled {
                    events.push(Event::ScheduleTransitioned {
                        id: sch.id,
                        owner_id: guard.id,
                        status: sch.status,
                        at: sch.updated_at,
                    });
                }
            }
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }
}
