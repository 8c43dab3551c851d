use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC — the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;

/// Who a verified caller is. The wire layer builds this from the
/// authenticated startup exchange; nothing else may construct one from
/// untrusted input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Customer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn owner(id: Ulid) -> Self {
        Self { id, role: Role::Owner }
    }

    pub fn customer(id: Ulid) -> Self {
        Self { id, role: Role::Customer }
    }

    /// Parse a login name of the form `owner_<ulid>` or `customer_<ulid>`.
    pub fn from_login(user: &str) -> Option<Self> {
        if let Some(rest) = user.strip_prefix("owner_") {
            return Ulid::from_string(rest).ok().map(Actor::owner);
        }
        if let Some(rest) = user.strip_prefix("customer_") {
            return Ulid::from_string(rest).ok().map(Actor::customer);
        }
        None
    }
}

/// One weekday's working hours. `open`/`close` are offsets from UTC
/// midnight in ms; the bookable window is `[open, close)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayTemplate {
    pub enabled: bool,
    pub open: Ms,
    pub close: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl ScheduleStatus {
    /// Completed and Cancelled accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, ScheduleStatus::Completed | ScheduleStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleStatus::Scheduled => "scheduled",
            ScheduleStatus::InProgress => "in_progress",
            ScheduleStatus::Completed => "completed",
            ScheduleStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(ScheduleStatus::Scheduled),
            "in_progress" => Some(ScheduleStatus::InProgress),
            "completed" => Some(ScheduleStatus::Completed),
            "cancelled" => Some(ScheduleStatus::Cancelled),
            _ => None,
        }
    }
}

/// A concrete bookable time instance. `auto_confirm` is the owner's
/// policy snapshot taken when the slot was created; it is never changed
/// by later owner-policy edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FittingSlot {
    pub id: Ulid,
    pub start: Ms,
    pub duration: Ms,
    pub booked: bool,
    pub auto_confirm: bool,
}

impl FittingSlot {
    pub fn end(&self) -> Ms {
        self.start + self.duration
    }
}

/// A customer's booking against a slot. Never physically deleted —
/// Cancelled is the terminal tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FittingSchedule {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub customer_id: Ulid,
    pub status: ScheduleStatus,
    /// Opaque payload: the products under trial, as JSON text.
    pub items: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl FittingSchedule {
    /// A non-Cancelled schedule keeps its slot booked.
    pub fn is_active(&self) -> bool {
        self.status != ScheduleStatus::Cancelled
    }
}

#[derive(Debug, Clone)]
pub struct OwnerState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Configured appointment length used when expanding templates.
    pub slot_len: Ms,
    /// Current policy, copied onto slots at creation time.
    pub auto_confirm: bool,
    /// At most one rule per weekday; index 0 = Sunday ... 6 = Saturday.
    pub templates: [Option<DayTemplate>; 7],
    /// All slots, sorted by `start`.
    pub slots: Vec<FittingSlot>,
    /// Append-only; Cancelled entries stay.
    pub schedules: Vec<FittingSchedule>,
}

impl OwnerState {
    pub fn new(id: Ulid, name: Option<String>, slot_len: Ms, auto_confirm: bool) -> Self {
        Self {
            id,
            name,
            slot_len,
            auto_confirm,
            templates: [None; 7],
            slots: Vec::new(),
            schedules: Vec::new(),
        }
    }

    /// Insert a slot maintaining sort order by start.
    pub fn insert_slot(&mut self, slot: FittingSlot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.start, |s| s.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, id: Ulid) -> Option<FittingSlot> {
        self.slots
            .iter()
            .position(|s| s.id == id)
            .map(|pos| self.slots.remove(pos))
    }

    pub fn slot(&self, id: Ulid) -> Option<&FittingSlot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn slot_mut(&mut self, id: Ulid) -> Option<&mut FittingSlot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }

    pub fn has_slot_at(&self, start: Ms) -> bool {
        self.slot_at_start(start).is_some()
    }

    pub fn slot_at_start(&self, start: Ms) -> Option<&FittingSlot> {
        self.slots
            .binary_search_by_key(&start, |s| s.start)
            .ok()
            .map(|pos| &self.slots[pos])
    }

    /// Slots with `start` in `[from, to)`. Uses binary search on the
    /// sorted vector to skip everything outside the window.
    pub fn slots_between(&self, from: Ms, to: Ms) -> &[FittingSlot] {
        let lo = self.slots.partition_point(|s| s.start < from);
        let hi = self.slots.partition_point(|s| s.start < to);
        &self.slots[lo..hi]
    }

    pub fn schedule(&self, id: Ulid) -> Option<&FittingSchedule> {
        self.schedules.iter().find(|s| s.id == id)
    }

    pub fn schedule_mut(&mut self, id: Ulid) -> Option<&mut FittingSchedule> {
        self.schedules.iter_mut().find(|s| s.id == id)
    }

    pub fn active_schedule_for_slot(&self, slot_id: Ulid) -> Option<&FittingSchedule> {
        self.schedules
            .iter()
            .find(|s| s.slot_id == slot_id && s.is_active())
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OwnerCreated {
        id: Ulid,
        name: Option<String>,
        slot_len: Ms,
        auto_confirm: bool,
    },
    OwnerUpdated {
        id: Ulid,
        name: Option<String>,
        slot_len: Ms,
        auto_confirm: bool,
    },
    OwnerDeleted {
        id: Ulid,
    },
    TemplateSet {
        owner_id: Ulid,
        day: u8,
        enabled: bool,
        open: Ms,
        close: Ms,
    },
    TemplateCleared {
        owner_id: Ulid,
        day: u8,
    },
    SlotAdded {
        id: Ulid,
        owner_id: Ulid,
        start: Ms,
        duration: Ms,
        auto_confirm: bool,
    },
    SlotUpdated {
        id: Ulid,
        owner_id: Ulid,
        start: Ms,
        auto_confirm: bool,
    },
    SlotRemoved {
        id: Ulid,
        owner_id: Ulid,
    },
    ScheduleCreated {
        id: Ulid,
        owner_id: Ulid,
        slot_id: Ulid,
        customer_id: Ulid,
        items: Option<String>,
        at: Ms,
    },
    ScheduleTransitioned {
        id: Ulid,
        owner_id: Ulid,
        status: ScheduleStatus,
        at: Ms,
    },
    ScheduleMoved {
        id: Ulid,
        owner_id: Ulid,
        from_slot: Ulid,
        to_slot: Ulid,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub slot_len: Ms,
    pub auto_confirm: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInfo {
    pub owner_id: Ulid,
    pub day: u8,
    pub enabled: bool,
    pub open: Ms,
    pub close: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub start: Ms,
    pub duration: Ms,
    pub booked: bool,
    pub auto_confirm: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleInfo {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub slot_id: Ulid,
    pub customer_id: Ulid,
    pub status: ScheduleStatus,
    pub items: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}
