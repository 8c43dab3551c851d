use crate::model::Ms;

// Per-tenant caps.
pub const MAX_TENANTS: usize = 128;
pub const MAX_TENANT_NAME_LEN: usize = 256;
pub const MAX_OWNERS_PER_TENANT: usize = 4096;

// Per-owner caps.
pub const MAX_SLOTS_PER_OWNER: usize = 100_000;
pub const MAX_SCHEDULES_PER_OWNER: usize = 200_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ITEMS_LEN: usize = 4096;

// Valid timestamp window: [1970-01-01, ~2100-01-01) in unix ms.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

// Appointment length bounds.
pub const MIN_SLOT_LEN_MS: Ms = 5 * 60_000;
pub const MAX_SLOT_LEN_MS: Ms = 86_400_000;
pub const DEFAULT_SLOT_LEN_MS: Ms = 30 * 60_000;

/// Widest range a single materialize call may cover (90 days).
pub const MAX_MATERIALIZE_RANGE_MS: Ms = 90 * 86_400_000;

/// Widest slot listing window (1 year).
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 86_400_000;

// Bounded lock acquisition for reservations: no reserve blocks forever.
pub const RESERVE_LOCK_ATTEMPTS: u32 = 3;
pub const RESERVE_LOCK_TIMEOUT_MS: u64 = 250;
