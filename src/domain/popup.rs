use crate::domain::models::{PopupResolution, PopupState, ScheduleState};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

/// The "time running out" prompt. Shown at most once per item index for the
/// lifetime of a meeting.
#[derive(Debug, Clone)]
pub struct PopupStateMachine {
    state: PopupState,
    shown_for: BTreeSet<usize>,
    lead_minutes: f64,
    auto_resolve_after: Duration,
}

impl PopupStateMachine {
    pub fn new(lead_minutes: f64, auto_resolve_after: Duration) -> Self {
        Self {
            state: PopupState::Hidden,
            shown_for: BTreeSet::new(),
            lead_minutes,
            auto_resolve_after,
        }
    }

    pub fn state(&self) -> PopupState {
        self.state
    }

    pub fn is_visible(&self) -> bool {
        matches!(self.state, PopupState::Visible { .. })
    }

    pub fn has_shown(&self, index: usize) -> bool {
        self.shown_for.contains(&index)
    }

    /// True when the prompt should appear for `index` given the latest
    /// schedule. Items near time zero are skipped, and an item whose window
    /// already closed gets no prompt.
    pub fn should_open(&self, index: usize, schedule: &ScheduleState) -> bool {
        !self.is_visible()
            && !self.has_shown(index)
            && schedule.active_index == index
            && schedule.time_remaining_minutes > 0.0
            && schedule.time_remaining_minutes <= self.lead_minutes
            && schedule.elapsed_minutes >= self.lead_minutes
    }

    pub fn open(&mut self, index: usize, now: DateTime<Utc>) -> bool {
        if self.is_visible() || self.has_shown(index) {
            return false;
        }
        self.shown_for.insert(index);
        self.state = PopupState::Visible {
            index,
            opened_at: now,
        };
        true
    }

    /// Index of the visible prompt once it has waited long enough for the
    /// automatic "more time" answer.
    pub fn due_for_auto_resolve(&self, now: DateTime<Utc>) -> Option<usize> {
        match self.state {
            PopupState::Visible { index, opened_at } if now - opened_at >= self.auto_resolve_after => {
                Some(index)
            }
            _ => None,
        }
    }

    /// Hides the prompt. A second resolution against a hidden prompt is a
    /// no-op and returns `None`.
    pub fn resolve(&mut self, resolution: PopupResolution) -> Option<(usize, PopupResolution)> {
        let PopupState::Visible { index, .. } = self.state else {
            return None;
        };
        self.state = PopupState::Hidden;
        Some((index, resolution))
    }

    pub fn clear(&mut self) {
        self.state = PopupState::Hidden;
        self.shown_for.clear();
    }
}
