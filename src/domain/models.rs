use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Smallest duration an agenda item may occupy on the schedule (one second).
pub const MIN_ESTIMATED_MINUTES: f64 = 1.0 / 60.0;
/// Largest duration accepted for an item or an extension (one week).
pub const MAX_ESTIMATED_MINUTES: f64 = 7.0 * 24.0 * 60.0;

pub const DEFAULT_POPUP_LEAD_SECONDS: u32 = 30;
pub const DEFAULT_AUTO_RESOLVE_SECONDS: u32 = 60;
pub const DEFAULT_EXTENSION_MINUTES: f64 = 1.0;
pub const DEFAULT_TICK_MILLIS: u64 = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgendaItem {
    pub id: String,
    pub title: String,
    pub estimated_minutes: f64,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
}

impl AgendaItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>, estimated_minutes: f64) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            estimated_minutes,
            completed: false,
            complexity: None,
            goal: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "agenda_item.id")?;
        validate_non_empty(&self.title, "agenda_item.title")?;
        validate_positive_minutes(self.estimated_minutes, "agenda_item.estimated_minutes")?;
        if let Some(complexity) = self.complexity {
            validate_complexity(complexity)?;
        }
        Ok(())
    }

    /// Duration used for scheduling. Non-positive or non-finite estimates are
    /// clamped so an item can never start and end on the same instant.
    pub fn scheduled_minutes(&self) -> f64 {
        if self.estimated_minutes.is_finite() && self.estimated_minutes >= MIN_ESTIMATED_MINUTES {
            self.estimated_minutes
        } else {
            MIN_ESTIMATED_MINUTES
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeetingPolicy {
    pub popup_lead_seconds: u32,
    pub auto_resolve_seconds: u32,
    pub extension_minutes: f64,
    pub tick_millis: u64,
}

impl Default for MeetingPolicy {
    fn default() -> Self {
        Self {
            popup_lead_seconds: DEFAULT_POPUP_LEAD_SECONDS,
            auto_resolve_seconds: DEFAULT_AUTO_RESOLVE_SECONDS,
            extension_minutes: DEFAULT_EXTENSION_MINUTES,
            tick_millis: DEFAULT_TICK_MILLIS,
        }
    }
}

impl MeetingPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.popup_lead_seconds == 0 {
            return Err("policy.popup_lead_seconds must be > 0".to_string());
        }
        if self.auto_resolve_seconds == 0 {
            return Err("policy.auto_resolve_seconds must be > 0".to_string());
        }
        validate_positive_minutes(self.extension_minutes, "policy.extension_minutes")?;
        if self.tick_millis == 0 {
            return Err("policy.tick_millis must be > 0".to_string());
        }
        Ok(())
    }

    pub fn popup_lead_minutes(&self) -> f64 {
        f64::from(self.popup_lead_seconds) / 60.0
    }

    pub fn auto_resolve_after(&self) -> Duration {
        Duration::seconds(i64::from(self.auto_resolve_seconds))
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_millis)
    }
}

/// Derived view of where the meeting stands at one instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScheduleState {
    pub active_index: usize,
    pub time_remaining_minutes: f64,
    pub elapsed_minutes: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScheduledSlot {
    pub index: usize,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PopupState {
    Hidden,
    Visible {
        index: usize,
        opened_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PopupResolution {
    Decide,
    ExtendTime,
}

impl PopupResolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decide => "decide",
            Self::ExtendTime => "extend_time",
        }
    }
}

/// Events emitted by the progression controller, in the order they happened
/// within one tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum MeetingEvent {
    MeetingStarted {
        start_at: DateTime<Utc>,
    },
    ActiveIndexChanged {
        from: usize,
        to: usize,
    },
    /// One-shot per item index for the lifetime of a meeting.
    ItemCompleted {
        index: usize,
        item_id: String,
        title: String,
        completed_at: DateTime<Utc>,
    },
    PopupOpened {
        index: usize,
        opened_at: DateTime<Utc>,
    },
    PopupResolved {
        index: usize,
        resolution: PopupResolution,
        automatic: bool,
    },
    ExtensionGranted {
        index: usize,
        minutes: f64,
        total_minutes: f64,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MeetingPhase {
    Idle,
    Pending,
    Running,
}

impl MeetingPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Running => "running",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MeetingSnapshot {
    pub phase: MeetingPhase,
    pub meeting_start: Option<DateTime<Utc>>,
    pub active_index: Option<usize>,
    pub schedule: Option<ScheduleState>,
    pub popup: PopupState,
    pub total_extension_minutes: f64,
    pub items: Vec<AgendaItem>,
    pub slots: Vec<ScheduledSlot>,
    pub finished: bool,
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

pub fn validate_positive_minutes(value: f64, field_name: &str) -> Result<(), String> {
    if !value.is_finite() || value <= 0.0 {
        return Err(format!("{field_name} must be a positive number of minutes"));
    }
    if value > MAX_ESTIMATED_MINUTES {
        return Err(format!(
            "{field_name} must not exceed {MAX_ESTIMATED_MINUTES} minutes"
        ));
    }
    Ok(())
}

pub fn validate_complexity(value: u8) -> Result<(), String> {
    if !(1..=10).contains(&value) {
        return Err("agenda_item.complexity must be between 1 and 10".to_string());
    }
    Ok(())
}
