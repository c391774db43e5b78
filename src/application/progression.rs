use crate::domain::ledger::ExtensionLedger;
use crate::domain::models::{
    AgendaItem, MeetingEvent, MeetingPhase, MeetingPolicy, MeetingSnapshot, PopupResolution,
    PopupState,
};
use crate::domain::popup::PopupStateMachine;
use crate::domain::schedule::{compute_schedule, scheduled_slots};
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerPhase {
    Idle,
    /// Started without an explicit start instant; the first tick sets it.
    Pending,
    Running {
        meeting_start: DateTime<Utc>,
        active_index: usize,
    },
}

/// Clock-driven driver of a meeting agenda.
///
/// Every `tick` recomputes the schedule, completes items whose window has
/// closed (each exactly once, in ascending order) and evaluates the
/// time-running-out prompt. While the prompt is visible for an item, that
/// item is held open until the prompt is answered or times out.
#[derive(Debug, Clone)]
pub struct ProgressionController {
    policy: MeetingPolicy,
    items: Vec<AgendaItem>,
    phase: ControllerPhase,
    ledger: ExtensionLedger,
    popup: PopupStateMachine,
}

impl ProgressionController {
    pub fn new(policy: MeetingPolicy) -> Self {
        let popup = PopupStateMachine::new(policy.popup_lead_minutes(), policy.auto_resolve_after());
        Self {
            policy,
            items: Vec::new(),
            phase: ControllerPhase::Idle,
            ledger: ExtensionLedger::new(),
            popup,
        }
    }

    pub fn policy(&self) -> &MeetingPolicy {
        &self.policy
    }

    pub fn items(&self) -> &[AgendaItem] {
        &self.items
    }

    pub fn ledger(&self) -> &ExtensionLedger {
        &self.ledger
    }

    pub fn popup_state(&self) -> PopupState {
        self.popup.state()
    }

    pub fn phase(&self) -> MeetingPhase {
        match self.phase {
            ControllerPhase::Idle => MeetingPhase::Idle,
            ControllerPhase::Pending => MeetingPhase::Pending,
            ControllerPhase::Running { .. } => MeetingPhase::Running,
        }
    }

    pub fn meeting_start(&self) -> Option<DateTime<Utc>> {
        match self.phase {
            ControllerPhase::Running { meeting_start, .. } => Some(meeting_start),
            _ => None,
        }
    }

    pub fn active_index(&self) -> Option<usize> {
        match self.phase {
            ControllerPhase::Idle => None,
            ControllerPhase::Pending => Some(0),
            ControllerPhase::Running { active_index, .. } => Some(active_index),
        }
    }

    /// True once the final item has been completed.
    pub fn is_finished(&self) -> bool {
        matches!(self.phase, ControllerPhase::Running { .. })
            && self.items.last().is_some_and(|item| item.completed)
    }

    /// Loads the agenda and arms the meeting. An empty agenda leaves the
    /// controller idle.
    pub fn start(
        &mut self,
        items: Vec<AgendaItem>,
        meeting_start: Option<DateTime<Utc>>,
    ) -> Result<Vec<MeetingEvent>, InfraError> {
        if self.phase != ControllerPhase::Idle {
            return Err(InfraError::InvalidInput(
                "meeting is already in progress".to_string(),
            ));
        }

        self.reset();
        if items.is_empty() {
            info!("agenda is empty; meeting stays idle");
            return Ok(Vec::new());
        }
        self.items = items;

        match meeting_start {
            Some(start_at) => {
                self.phase = ControllerPhase::Running {
                    meeting_start: start_at,
                    active_index: 0,
                };
                info!(items = self.items.len(), %start_at, "meeting started");
                Ok(vec![MeetingEvent::MeetingStarted { start_at }])
            }
            None => {
                self.phase = ControllerPhase::Pending;
                info!(items = self.items.len(), "meeting armed; start set on first tick");
                Ok(Vec::new())
            }
        }
    }

    /// Stops the meeting: back to idle, prompt hidden, ledger cleared.
    pub fn reset(&mut self) {
        self.phase = ControllerPhase::Idle;
        self.items.clear();
        self.ledger = ExtensionLedger::new();
        self.popup.clear();
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<MeetingEvent> {
        let mut events = Vec::new();
        let (meeting_start, mut active_index) = match self.phase {
            ControllerPhase::Idle => return events,
            ControllerPhase::Pending => {
                self.phase = ControllerPhase::Running {
                    meeting_start: now,
                    active_index: 0,
                };
                info!(start_at = %now, "meeting started on first tick");
                events.push(MeetingEvent::MeetingStarted { start_at: now });
                (now, 0)
            }
            ControllerPhase::Running {
                meeting_start,
                active_index,
            } => (meeting_start, active_index),
        };

        if let Some(index) = self.popup.due_for_auto_resolve(now) {
            debug!(index, "time prompt timed out; extending");
            self.resolve_visible(PopupResolution::ExtendTime, true, &mut events);
        }

        let Some(schedule) = compute_schedule(&self.items, meeting_start, now, &self.ledger) else {
            return events;
        };

        if self.popup.is_visible() {
            return events;
        }

        if schedule.active_index > active_index {
            for index in active_index..schedule.active_index {
                self.complete_item(index, now, &mut events);
            }
            events.push(MeetingEvent::ActiveIndexChanged {
                from: active_index,
                to: schedule.active_index,
            });
            active_index = schedule.active_index;
            self.phase = ControllerPhase::Running {
                meeting_start,
                active_index,
            };
        }

        let last_index = self.items.len() - 1;
        if active_index == last_index
            && schedule.active_index == last_index
            && schedule.time_remaining_minutes <= 0.0
        {
            self.complete_item(last_index, now, &mut events);
        }

        let item_open = self
            .items
            .get(active_index)
            .is_some_and(|item| !item.completed);
        if item_open && self.popup.should_open(active_index, &schedule) && self.popup.open(active_index, now) {
            info!(
                index = active_index,
                remaining_minutes = schedule.time_remaining_minutes,
                "time running out prompt shown"
            );
            events.push(MeetingEvent::PopupOpened {
                index: active_index,
                opened_at: now,
            });
        }

        events
    }

    /// Answers the visible prompt, then re-evaluates the schedule at `now`.
    /// Answering a hidden prompt does nothing, so a human answer racing the
    /// timeout never grants twice.
    pub fn resolve_popup(&mut self, resolution: PopupResolution, now: DateTime<Utc>) -> Vec<MeetingEvent> {
        let mut events = Vec::new();
        if !self.popup.is_visible() {
            debug!(resolution = resolution.as_str(), "ignoring answer for hidden prompt");
            return events;
        }
        self.resolve_visible(resolution, false, &mut events);
        events.extend(self.tick(now));
        events
    }

    /// Grants extra minutes to the active item and everything after it.
    pub fn grant_extension(&mut self, minutes: f64) -> Result<MeetingEvent, InfraError> {
        let Some(index) = self.active_index() else {
            return Err(InfraError::InvalidInput(
                "meeting is not in progress".to_string(),
            ));
        };
        self.apply_extension(index, minutes)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> MeetingSnapshot {
        let (schedule, slots) = match self.phase {
            ControllerPhase::Running { meeting_start, .. } => (
                compute_schedule(&self.items, meeting_start, now, &self.ledger),
                scheduled_slots(&self.items, meeting_start, &self.ledger),
            ),
            _ => (None, Vec::new()),
        };
        MeetingSnapshot {
            phase: self.phase(),
            meeting_start: self.meeting_start(),
            active_index: self.active_index(),
            schedule,
            popup: self.popup.state(),
            total_extension_minutes: self.ledger.total_extension_minutes(),
            items: self.items.clone(),
            slots,
            finished: self.is_finished(),
        }
    }

    fn resolve_visible(&mut self, resolution: PopupResolution, automatic: bool, events: &mut Vec<MeetingEvent>) {
        let Some((index, resolution)) = self.popup.resolve(resolution) else {
            return;
        };
        info!(index, resolution = resolution.as_str(), automatic, "time prompt resolved");
        events.push(MeetingEvent::PopupResolved {
            index,
            resolution,
            automatic,
        });

        if resolution == PopupResolution::ExtendTime {
            match self.apply_extension(index, self.policy.extension_minutes) {
                Ok(event) => events.push(event),
                Err(error) => warn!(index, %error, "could not apply prompt extension"),
            }
        }
    }

    fn apply_extension(&mut self, index: usize, minutes: f64) -> Result<MeetingEvent, InfraError> {
        let total_minutes = self
            .ledger
            .grant_extension(index, minutes)
            .map_err(InfraError::InvalidInput)?;
        info!(index, minutes, total_minutes, "extension granted");
        Ok(MeetingEvent::ExtensionGranted {
            index,
            minutes,
            total_minutes,
        })
    }

    fn complete_item(&mut self, index: usize, now: DateTime<Utc>, events: &mut Vec<MeetingEvent>) {
        let Some(item) = self.items.get_mut(index) else {
            return;
        };
        if item.completed {
            return;
        }
        item.completed = true;
        info!(index, item_id = %item.id, title = %item.title, "agenda item completed");
        events.push(MeetingEvent::ItemCompleted {
            index,
            item_id: item.id.clone(),
            title: item.title.clone(),
            completed_at: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schedule::offset_instant;
    use chrono::Duration;
    use proptest::prelude::*;

    fn meeting_start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-16T09:00:00Z")
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn at_minutes(minutes: f64) -> DateTime<Utc> {
        offset_instant(meeting_start(), minutes)
    }

    fn at_seconds(seconds: i64) -> DateTime<Utc> {
        meeting_start() + Duration::seconds(seconds)
    }

    fn agenda(minutes: &[f64]) -> Vec<AgendaItem> {
        minutes
            .iter()
            .enumerate()
            .map(|(index, value)| AgendaItem::new(format!("itm-{index}"), format!("Item {index}"), *value))
            .collect()
    }

    fn started(minutes: &[f64]) -> ProgressionController {
        let mut controller = ProgressionController::new(MeetingPolicy::default());
        controller
            .start(agenda(minutes), Some(meeting_start()))
            .expect("start meeting");
        controller
    }

    fn completed_indices(events: &[MeetingEvent]) -> Vec<usize> {
        events
            .iter()
            .filter_map(|event| match event {
                MeetingEvent::ItemCompleted { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }

    fn opened_indices(events: &[MeetingEvent]) -> Vec<usize> {
        events
            .iter()
            .filter_map(|event| match event {
                MeetingEvent::PopupOpened { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn first_item_active_one_minute_in() {
        let mut controller = started(&[2.0, 3.0]);
        let events = controller.tick(at_minutes(1.0));
        assert!(events.is_empty());

        let snapshot = controller.snapshot(at_minutes(1.0));
        let schedule = snapshot.schedule.expect("schedule");
        assert_eq!(snapshot.active_index, Some(0));
        assert!((schedule.time_remaining_minutes - 1.0).abs() < 1e-9);
    }

    #[test]
    fn crossing_boundary_completes_previous_item_once() {
        let mut controller = started(&[2.0, 3.0]);
        let mut events = controller.tick(at_minutes(1.0));
        events.extend(controller.tick(at_minutes(2.5)));
        events.extend(controller.tick(at_minutes(2.6)));

        assert_eq!(completed_indices(&events), vec![0]);
        assert!(events.contains(&MeetingEvent::ActiveIndexChanged { from: 0, to: 1 }));
        assert_eq!(controller.active_index(), Some(1));
        assert!(controller.items()[0].completed);
        assert!(!controller.items()[1].completed);

        let schedule = controller.snapshot(at_minutes(2.5)).schedule.expect("schedule");
        assert!((schedule.time_remaining_minutes - 2.5).abs() < 1e-9);
    }

    #[test]
    fn unanswered_prompt_extends_after_timeout() {
        let mut controller = started(&[1.0]);
        assert!(controller.tick(at_minutes(0.0)).is_empty());

        let opened = controller.tick(at_minutes(0.6));
        assert_eq!(
            opened,
            vec![MeetingEvent::PopupOpened {
                index: 0,
                opened_at: at_minutes(0.6)
            }]
        );

        // Held open past its boundary while the prompt waits.
        assert!(controller.tick(at_minutes(1.3)).is_empty());
        assert!(!controller.items()[0].completed);

        let resolved = controller.tick(at_minutes(1.6));
        assert_eq!(
            resolved,
            vec![
                MeetingEvent::PopupResolved {
                    index: 0,
                    resolution: PopupResolution::ExtendTime,
                    automatic: true
                },
                MeetingEvent::ExtensionGranted {
                    index: 0,
                    minutes: 1.0,
                    total_minutes: 1.0
                },
            ]
        );
        assert_eq!(controller.ledger().total_extension_minutes(), 1.0);
        let snapshot = controller.snapshot(at_minutes(1.6));
        assert_eq!(snapshot.slots[0].end_at, at_minutes(2.0));
        assert_eq!(snapshot.popup, PopupState::Hidden);

        let finished = controller.tick(at_minutes(2.0));
        assert_eq!(completed_indices(&finished), vec![0]);
        assert!(controller.is_finished());
    }

    #[test]
    fn sequential_extensions_push_later_items() {
        let mut controller = started(&[1.0, 1.0]);
        controller.tick(at_minutes(0.2));
        controller.grant_extension(1.0).expect("first grant");
        controller.grant_extension(1.0).expect("second grant");

        let snapshot = controller.snapshot(at_minutes(0.2));
        assert_eq!(snapshot.total_extension_minutes, 2.0);
        assert_eq!(snapshot.slots[0].end_at, at_minutes(3.0));
        assert_eq!(snapshot.slots[1].end_at, at_minutes(4.0));
    }

    #[test]
    fn stalled_clock_completes_skipped_items_in_order() {
        let mut controller = started(&[1.0, 1.0, 1.0, 1.0]);
        controller.tick(at_minutes(0.1));
        let events = controller.tick(at_minutes(3.4));

        assert_eq!(completed_indices(&events), vec![0, 1, 2]);
        assert!(events.contains(&MeetingEvent::ActiveIndexChanged { from: 0, to: 3 }));
        assert!(opened_indices(&events).is_empty());
        assert_eq!(controller.active_index(), Some(3));
    }

    #[test]
    fn stall_past_final_boundary_finishes_everything_without_prompt() {
        let mut controller = started(&[1.0, 1.0]);
        controller.tick(at_minutes(0.1));
        let events = controller.tick(at_minutes(10.0));
        assert_eq!(completed_indices(&events), vec![0, 1]);
        assert!(opened_indices(&events).is_empty());
        assert!(controller.is_finished());

        assert!(controller.tick(at_minutes(11.0)).is_empty());
        assert!(controller.tick(at_minutes(20.0)).is_empty());
    }

    #[test]
    fn dense_ticking_shows_each_prompt_once() {
        let mut controller = started(&[1.0, 1.0]);
        let mut events = Vec::new();
        for second in 0..=600 {
            events.extend(controller.tick(at_seconds(second)));
        }

        assert_eq!(opened_indices(&events), vec![0, 1]);
        assert_eq!(completed_indices(&events), vec![0, 1]);
        assert_eq!(controller.ledger().total_extension_minutes(), 2.0);
        assert!(controller.is_finished());
    }

    #[test]
    fn decide_releases_held_item_immediately() {
        let mut controller = started(&[1.0, 2.0]);
        controller.tick(at_minutes(0.6));
        assert!(controller.popup_state() != PopupState::Hidden);

        assert!(controller.tick(at_minutes(1.2)).is_empty());
        let events = controller.resolve_popup(PopupResolution::Decide, at_minutes(1.2));

        assert_eq!(
            events[0],
            MeetingEvent::PopupResolved {
                index: 0,
                resolution: PopupResolution::Decide,
                automatic: false
            }
        );
        assert_eq!(completed_indices(&events), vec![0]);
        assert_eq!(controller.active_index(), Some(1));
        assert_eq!(controller.ledger().total_extension_minutes(), 0.0);
    }

    #[test]
    fn answer_racing_timeout_grants_once() {
        let mut controller = started(&[1.0, 1.0]);
        controller.tick(at_minutes(0.6));

        let timed_out = controller.tick(at_minutes(1.6));
        assert_eq!(controller.ledger().total_extension_minutes(), 1.0);
        assert!(timed_out.iter().any(|event| matches!(event, MeetingEvent::ExtensionGranted { .. })));

        let late_answer = controller.resolve_popup(PopupResolution::ExtendTime, at_minutes(1.6));
        assert!(late_answer.is_empty());
        assert!(controller.resolve_popup(PopupResolution::Decide, at_minutes(1.6)).is_empty());
        assert_eq!(controller.ledger().total_extension_minutes(), 1.0);
    }

    #[test]
    fn explicit_more_time_extends_current_item() {
        let mut controller = started(&[1.0, 1.0]);
        controller.tick(at_minutes(0.6));
        let events = controller.resolve_popup(PopupResolution::ExtendTime, at_minutes(0.7));

        assert!(events.contains(&MeetingEvent::ExtensionGranted {
            index: 0,
            minutes: 1.0,
            total_minutes: 1.0
        }));
        let snapshot = controller.snapshot(at_minutes(0.7));
        assert_eq!(snapshot.slots[0].end_at, at_minutes(2.0));
        assert_eq!(snapshot.slots[1].end_at, at_minutes(3.0));
        assert!(opened_indices(&controller.tick(at_minutes(1.8))).is_empty());
    }

    #[test]
    fn no_prompt_for_item_ending_near_start() {
        let mut controller = started(&[0.4, 2.0]);
        assert!(opened_indices(&controller.tick(at_minutes(0.0))).is_empty());
        assert!(opened_indices(&controller.tick(at_minutes(0.2))).is_empty());
        let events = controller.tick(at_minutes(0.45));
        assert_eq!(completed_indices(&events), vec![0]);
        assert!(opened_indices(&events).is_empty());
    }

    #[test]
    fn empty_agenda_stays_idle() {
        let mut controller = ProgressionController::new(MeetingPolicy::default());
        let events = controller.start(Vec::new(), Some(meeting_start())).expect("start");
        assert!(events.is_empty());
        assert_eq!(controller.phase(), MeetingPhase::Idle);
        assert_eq!(controller.active_index(), None);
        assert!(controller.tick(at_minutes(5.0)).is_empty());
        assert!(controller.grant_extension(1.0).is_err());
    }

    #[test]
    fn start_instant_defaults_to_first_tick() {
        let mut controller = ProgressionController::new(MeetingPolicy::default());
        controller.start(agenda(&[1.0]), None).expect("start");
        assert_eq!(controller.phase(), MeetingPhase::Pending);
        assert_eq!(controller.meeting_start(), None);

        let events = controller.tick(at_minutes(3.0));
        assert_eq!(
            events,
            vec![MeetingEvent::MeetingStarted {
                start_at: at_minutes(3.0)
            }]
        );
        assert_eq!(controller.meeting_start(), Some(at_minutes(3.0)));
        assert_eq!(completed_indices(&controller.tick(at_minutes(4.0))), vec![0]);
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut controller = started(&[1.0]);
        assert!(matches!(
            controller.start(agenda(&[1.0]), None),
            Err(InfraError::InvalidInput(_))
        ));
    }

    #[test]
    fn reset_hides_prompt_and_stops_progress() {
        let mut controller = started(&[1.0, 1.0]);
        controller.tick(at_minutes(0.6));
        assert!(controller.popup_state() != PopupState::Hidden);

        controller.reset();
        assert_eq!(controller.popup_state(), PopupState::Hidden);
        assert_eq!(controller.phase(), MeetingPhase::Idle);
        assert!(controller.tick(at_minutes(5.0)).is_empty());
    }

    #[test]
    fn invalid_extension_is_rejected() {
        let mut controller = started(&[1.0]);
        assert!(matches!(
            controller.grant_extension(0.0),
            Err(InfraError::InvalidInput(_))
        ));
        assert!(controller.grant_extension(-2.0).is_err());
        assert_eq!(controller.ledger().total_extension_minutes(), 0.0);
    }

    #[test]
    fn already_completed_items_are_not_reported_again() {
        let mut items = agenda(&[1.0, 1.0]);
        items[0].completed = true;
        let mut controller = ProgressionController::new(MeetingPolicy::default());
        controller.start(items, Some(meeting_start())).expect("start");

        let events = controller.tick(at_minutes(1.5));
        assert!(completed_indices(&events).is_empty());
        assert_eq!(controller.active_index(), Some(1));
    }

    proptest! {
        #[test]
        fn completions_are_unique_and_ascending(
            durations in prop::collection::vec(0.1f64..3.0, 1..6),
            mut offsets in prop::collection::vec(0i64..1_800, 1..80),
            answers in prop::collection::vec(0u8..3, 80)
        ) {
            let mut controller = started(&durations);
            offsets.sort_unstable();

            let mut events = Vec::new();
            for (position, seconds) in offsets.iter().enumerate() {
                let now = at_seconds(*seconds);
                events.extend(controller.tick(now));
                match answers[position] {
                    1 => events.extend(controller.resolve_popup(PopupResolution::Decide, now)),
                    2 => events.extend(controller.resolve_popup(PopupResolution::ExtendTime, now)),
                    _ => {}
                }
            }

            let completed = completed_indices(&events);
            prop_assert!(completed.windows(2).all(|pair| pair[0] < pair[1]));

            let mut opened = opened_indices(&events);
            let opened_count = opened.len();
            opened.sort_unstable();
            opened.dedup();
            prop_assert_eq!(opened.len(), opened_count);

            let extend_answers = events
                .iter()
                .filter(|event| matches!(
                    event,
                    MeetingEvent::PopupResolved { resolution: PopupResolution::ExtendTime, .. }
                ))
                .count();
            let grants = events
                .iter()
                .filter(|event| matches!(event, MeetingEvent::ExtensionGranted { .. }))
                .count();
            prop_assert_eq!(extend_answers, grants);
        }
    }
}
