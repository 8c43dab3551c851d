use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub fn list_owners(&self) -> Vec<OwnerInfo> {
        self.state
            .iter()
            .map(|entry| {
                let os = entry.value().clone();
                let guard = os.try_read().expect("list_owners: uncontended read");
                OwnerInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                    slot_len: guard.slot_len,
                    auto_confirm: guard.auto_confirm,
                }
            })
            .collect()
    }

    pub async fn list_templates(&self, owner_id: Ulid) -> Result<Vec<TemplateInfo>, EngineError> {
        let os = match self.get_owner(&owner_id) {
            Some(os) => os,
            None => return Ok(vec![]),
        };
        let guard = os.read().await;
        Ok(guard
            .templates
            .iter()
            .enumerate()
            .filter_map(|(day, tpl)| {
                tpl.map(|tpl| TemplateInfo {
                    owner_id,
                    day: day as u8,
                    enabled: tpl.enabled,
                    open: tpl.open,
                    close: tpl.close,
                })
            })
            .collect())
    }

    /// Slots ordered by start ascending, optionally restricted to those
    /// lying fully inside `[from, to]` and/or to unbooked ones.
    pub async fn list_slots(
        &self,
        owner_id: Ulid,
        range: Option<(Ms, Ms)>,
        available_only: bool,
    ) -> Result<Vec<SlotInfo>, EngineError> {
        if let Some((from, to)) = range {
            if to < from {
                return Err(EngineError::Validation("range end before range start"));
            }
            if to - from > MAX_QUERY_WINDOW_MS {
                return Err(EngineError::LimitExceeded("query window too wide"));
            }
        }
        let os = match self.get_owner(&owner_id) {
            Some(os) => os,
            None => return Ok(vec![]),
        };
        let guard = os.read().await;

        let slots = match range {
            Some((from, to)) => guard.slots_between(from, to),
            None => &guard.slots[..],
        };
        Ok(slots
            .iter()
            .filter(|s| range.is_none_or(|(_, to)| s.end() <= to))
            .filter(|s| !available_only || !s.booked)
            .map(|s| SlotInfo {
                id: s.id,
                owner_id,
                start: s.start,
                duration: s.duration,
                booked: s.booked,
                auto_confirm: s.auto_confirm,
            })
            .collect())
    }

    pub async fn get_slot(&self, slot_id: Ulid) -> Result<SlotInfo, EngineError> {
        let owner_id = self
            .get_owner_for_entity(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let os = self
            .get_owner(&owner_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = os.read().await;
        let slot = guard.slot(slot_id).ok_or(EngineError::NotFound(slot_id))?;
        Ok(SlotInfo {
            id: slot.id,
            owner_id,
            start: slot.start,
            duration: slot.duration,
            booked: slot.booked,
            auto_confirm: slot.auto_confirm,
        })
    }

    /// All schedules for an owner, cancelled tombstones included.
    pub async fn list_schedules(&self, owner_id: Ulid) -> Result<Vec<ScheduleInfo>, EngineError> {
        self.schedules_where(owner_id, false).await
    }

    /// Only non-Cancelled schedules — the explicit "active" view; the
    /// cancelled tombstones never leak in implicitly.
    pub async fn list_active_schedules(
        &self,
        owner_id: Ulid,
    ) -> Result<Vec<ScheduleInfo>, EngineError> {
        self.schedules_where(owner_id, true).await
    }

    async fn schedules_where(
        &self,
        owner_id: Ulid,
        active_only: bool,
    ) -> Result<Vec<ScheduleInfo>, EngineError> {
        let os = match self.get_owner(&owner_id) {
            Some(os) => os,
            None => return Ok(vec![]),
        };
        let guard = os.read().await;
        Ok(guard
            .schedules
            .iter()
            .filter(|s| !active_only || s.is_active())
            .map(|s| schedule_info(owner_id, s))
            .collect())
    }

    pub async fn get_schedule(&self, schedule_id: Ulid) -> Result<ScheduleInfo, EngineError> {
        let owner_id = self
            .get_owner_for_entity(&schedule_id)
            .ok_or(EngineError::NotFound(schedule_id))?;
        let os = self
            .get_owner(&owner_id)
            .ok_or(EngineError::NotFound(schedule_id))?;
        let guard = os.read().await;
        let sch = guard
            .schedule(schedule_id)
            .ok_or(EngineError::NotFound(schedule_id))?;
        Ok(schedule_info(owner_id, sch))
    }
}

fn schedule_info(owner_id: Ulid, sch: &FittingSchedule) -> ScheduleInfo {
    ScheduleInfo {
        id: sch.id,
        owner_id,
        slot_id: sch.slot_id,
        customer_id: sch.customer_id,
        status: sch.status,
        items: sch.items.clone(),
        created_at: sch.created_at,
        updated_at: sch.updated_at,
    }
}
