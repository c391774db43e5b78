use crate::domain::ledger::ExtensionLedger;
use crate::domain::models::{AgendaItem, ScheduleState, ScheduledSlot};
use chrono::{DateTime, Duration, Utc};

const MILLIS_PER_MINUTE: f64 = 60_000.0;

/// Minutes elapsed since `meeting_start`, never negative.
pub fn elapsed_minutes(meeting_start: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    if now <= meeting_start {
        return 0.0;
    }
    (now - meeting_start).num_milliseconds() as f64 / MILLIS_PER_MINUTE
}

/// `meeting_start` shifted by `minutes`, saturating at the representable
/// range instead of overflowing.
pub fn offset_instant(meeting_start: DateTime<Utc>, minutes: f64) -> DateTime<Utc> {
    let millis = (minutes * MILLIS_PER_MINUTE).round() as i64;
    let limit = if millis < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    };
    Duration::try_milliseconds(millis)
        .and_then(|offset| meeting_start.checked_add_signed(offset))
        .unwrap_or(limit)
}

/// Cumulative end boundary, in minutes from the meeting start, of every item.
/// Strictly increasing: durations are clamped positive and ledger shifts only
/// grow with the index.
pub fn end_boundaries(items: &[AgendaItem], ledger: &ExtensionLedger) -> Vec<f64> {
    let mut cumulative = 0.0;
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            cumulative += item.scheduled_minutes();
            cumulative + ledger.shift_for(index)
        })
        .collect()
}

pub fn schedule_length_minutes(items: &[AgendaItem], ledger: &ExtensionLedger) -> f64 {
    end_boundaries(items, ledger).last().copied().unwrap_or(0.0)
}

/// Maps the agenda, start instant, ledger and clock reading to the active
/// item. Returns `None` for an empty agenda.
///
/// The active item is the first one whose end boundary lies after the elapsed
/// time; once the whole agenda has elapsed the last item stays active.
pub fn compute_schedule(
    items: &[AgendaItem],
    meeting_start: DateTime<Utc>,
    now: DateTime<Utc>,
    ledger: &ExtensionLedger,
) -> Option<ScheduleState> {
    let boundaries = end_boundaries(items, ledger);
    let last_index = boundaries.len().checked_sub(1)?;
    let elapsed = elapsed_minutes(meeting_start, now);

    let active_index = boundaries
        .iter()
        .position(|end| elapsed < *end)
        .unwrap_or(last_index);
    let time_remaining_minutes = (boundaries[active_index] - elapsed).max(0.0);

    Some(ScheduleState {
        active_index,
        time_remaining_minutes,
        elapsed_minutes: elapsed,
    })
}

pub fn scheduled_slots(
    items: &[AgendaItem],
    meeting_start: DateTime<Utc>,
    ledger: &ExtensionLedger,
) -> Vec<ScheduledSlot> {
    let mut start_minutes = 0.0;
    end_boundaries(items, ledger)
        .into_iter()
        .enumerate()
        .map(|(index, end_minutes)| {
            let slot = ScheduledSlot {
                index,
                start_at: offset_instant(meeting_start, start_minutes),
                end_at: offset_instant(meeting_start, end_minutes),
            };
            start_minutes = end_minutes;
            slot
        })
        .collect()
}
