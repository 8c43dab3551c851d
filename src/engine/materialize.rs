use crate::model::*;

// ── Template expansion ───────────────────────────────────────────

/// Weekday of a UTC timestamp; 0 = Sunday ... 6 = Saturday.
/// 1970-01-01 was a Thursday, hence the +4.
pub fn day_of_week(t: Ms) -> u8 {
    (t.div_euclid(DAY_MS) + 4).rem_euclid(7) as u8
}

/// UTC midnight at or before `t`.
pub fn day_start(t: Ms) -> Ms {
    t.div_euclid(DAY_MS) * DAY_MS
}

/// Partition one day's `[open, close)` window into `slot_len` increments.
/// A trailing remainder shorter than `slot_len` is discarded. Disabled
/// templates expand to nothing.
pub fn expand_day(tpl: &DayTemplate, day: Ms, slot_len: Ms) -> Vec<Ms> {
    let mut starts = Vec::new();
    if !tpl.enabled || slot_len <= 0 {
        return starts;
    }
    let close = day + tpl.close;
    let mut t = day + tpl.open;
    while t + slot_len <= close {
        starts.push(t);
        t += slot_len;
    }
    starts
}

/// Expand the weekly template set over `[from, to)`: every candidate
/// start produced by the matching weekday rule, clamped to the range.
/// Days with a missing or disabled rule contribute nothing.
pub fn candidate_starts(
    templates: &[Option<DayTemplate>; 7],
    slot_len: Ms,
    from: Ms,
    to: Ms,
) -> Vec<Ms> {
    let mut out = Vec::new();
    let mut day = day_start(from);
    while day < to {
        if let Some(tpl) = &templates[day_of_week(day) as usize] {
            for start in expand_day(tpl, day, slot_len) {
                if start >= from && start < to {
                    out.push(start);
                }
            }
        }
        day += DAY_MS;
    }
    out
}
