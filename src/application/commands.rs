use crate::application::analysis::{CompletedItem, CompletionHandler};
use crate::application::bootstrap::{bootstrap_workspace, BootstrapResult};
use crate::application::meeting_runner::SharedController;
use crate::application::progression::ProgressionController;
use crate::domain::ledger::ExtensionLedger;
use crate::domain::models::{
    validate_complexity, validate_positive_minutes, AgendaItem, MeetingEvent, MeetingPhase,
    MeetingPolicy, MeetingSnapshot, PopupResolution, ScheduledSlot,
};
use crate::domain::schedule::{schedule_length_minutes, scheduled_slots};
use crate::infrastructure::analysis_client::ReqwestAnalysisClient;
use crate::infrastructure::config::{read_analysis_settings, read_default_agenda, read_meeting_policy};
use crate::infrastructure::decision_repository::{
    DecisionRecord, DecisionRepository, SqliteDecisionRepository,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::transcript::{InMemoryTranscript, TranscriptSource};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

type LiveCompletionHandler = CompletionHandler<ReqwestAnalysisClient, SqliteDecisionRepository>;
type AnalysisHandle = JoinHandle<Result<DecisionRecord, InfraError>>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id(prefix: &str) -> String {
    let sequence = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{sequence}", Utc::now().timestamp_micros())
}

/// Everything a running app needs: the goal store, the meeting controller and
/// the collaborators that turn completions into recorded decisions.
///
/// Lock order is `runtime` before `controller`; neither is held across an
/// await.
pub struct AppState {
    config_dir: PathBuf,
    database_path: PathBuf,
    runtime: Mutex<RuntimeState>,
    controller: SharedController,
    transcript: Arc<InMemoryTranscript>,
    completion_handler: LiveCompletionHandler,
    analyses: Mutex<Vec<AnalysisHandle>>,
}

impl AppState {
    /// Bootstraps `workspace_root` and builds the state, reading secrets
    /// through `lookup`.
    pub fn with_lookup<F>(workspace_root: PathBuf, lookup: F) -> Result<Self, InfraError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_bootstrap(bootstrap_workspace(&workspace_root)?, lookup)
    }

    /// Builds the state over an already bootstrapped workspace.
    pub fn from_bootstrap<F>(bootstrap: BootstrapResult, lookup: F) -> Result<Self, InfraError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let policy = read_meeting_policy(&bootstrap.config_dir)?;
        let analysis_settings = read_analysis_settings(&bootstrap.config_dir, lookup)?;
        if analysis_settings.api_key.is_none() {
            warn!("no analysis api key configured; decisions will be recorded as failed");
        }

        let transcript = Arc::new(InMemoryTranscript::default());
        let completion_handler = CompletionHandler::new(
            transcript.clone(),
            Arc::new(ReqwestAnalysisClient::new(analysis_settings)),
            Arc::new(SqliteDecisionRepository::new(&bootstrap.database_path)),
        );

        Ok(Self {
            config_dir: bootstrap.config_dir,
            database_path: bootstrap.database_path,
            runtime: Mutex::new(RuntimeState::default()),
            controller: Arc::new(Mutex::new(ProgressionController::new(policy))),
            transcript,
            completion_handler,
            analyses: Mutex::new(Vec::new()),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn controller(&self) -> &SharedController {
        &self.controller
    }

    pub fn policy(&self) -> Result<MeetingPolicy, InfraError> {
        Ok(lock_controller(self)?.policy().clone())
    }

    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        error!(command, %error, "command failed");
        error.to_string()
    }

    /// Hands every completion in `events` to the analysis pipeline. Must run
    /// inside a tokio runtime.
    pub fn dispatch_completions(&self, events: &[MeetingEvent]) -> Result<usize, InfraError> {
        let completions = events
            .iter()
            .filter_map(|event| match event {
                MeetingEvent::ItemCompleted {
                    index,
                    item_id,
                    title,
                    ..
                } => Some((*index, item_id.clone(), title.clone())),
                _ => None,
            })
            .collect::<Vec<_>>();
        if completions.is_empty() {
            return Ok(0);
        }

        // Completions can arrive after the meeting ended; they belong to the
        // meeting that produced them.
        let meeting_id = {
            let runtime = lock_runtime(self)?;
            runtime
                .meeting_id
                .clone()
                .or_else(|| runtime.last_meeting_id.clone())
                .unwrap_or_else(|| "unknown".to_string())
        };
        let mut analyses = lock_analyses(self)?;
        for (index, item_id, title) in &completions {
            analyses.push(self.completion_handler.on_item_completed(CompletedItem {
                meeting_id: meeting_id.clone(),
                index: *index,
                item_id: item_id.clone(),
                title: title.clone(),
            }));
        }
        Ok(completions.len())
    }

    /// Waits for every dispatched analysis and returns the records written.
    pub async fn wait_for_analyses(&self) -> Result<Vec<DecisionRecord>, InfraError> {
        let pending = std::mem::take(&mut *lock_analyses(self)?);
        let mut records = Vec::with_capacity(pending.len());
        for handle in pending {
            match handle.await {
                Ok(Ok(record)) => records.push(record),
                Ok(Err(error)) => warn!(%error, "decision could not be recorded"),
                Err(error) => warn!(%error, "analysis task did not finish"),
            }
        }
        Ok(records)
    }
}

#[derive(Debug, Default)]
struct RuntimeState {
    items: HashMap<String, AgendaItem>,
    item_order: Vec<String>,
    meeting_id: Option<String>,
    last_meeting_id: Option<String>,
}

impl RuntimeState {
    fn ordered_items(&self) -> Vec<AgendaItem> {
        self.item_order
            .iter()
            .filter_map(|item_id| self.items.get(item_id).cloned())
            .collect()
    }

    fn replace_items(&mut self, items: Vec<AgendaItem>) {
        self.items.clear();
        self.item_order.clear();
        for item in items {
            self.item_order.push(item.id.clone());
            self.items.insert(item.id.clone(), item);
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgendaSummary {
    pub item_count: usize,
    pub completed_count: usize,
    pub remaining_count: usize,
    pub total_estimated_minutes: f64,
    pub total_extension_minutes: f64,
    pub total_meeting_minutes: f64,
    pub progress_percent: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MeetingStateResponse {
    pub meeting_id: Option<String>,
    #[serde(flatten)]
    pub snapshot: MeetingSnapshot,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StartMeetingResponse {
    pub meeting_id: String,
    pub events: Vec<MeetingEvent>,
    pub phase: MeetingPhase,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EndMeetingResponse {
    pub meeting_id: Option<String>,
    pub completed_items: usize,
    pub total_items: usize,
}

pub fn create_item_impl(
    state: &AppState,
    title: String,
    estimated_minutes: f64,
    complexity: Option<u8>,
    goal: Option<String>,
) -> Result<AgendaItem, InfraError> {
    let title = normalized_title(&title)?;
    validate_positive_minutes(estimated_minutes, "estimated_minutes").map_err(InfraError::InvalidInput)?;
    if let Some(complexity) = complexity {
        validate_complexity(complexity).map_err(InfraError::InvalidInput)?;
    }

    let item = AgendaItem {
        id: next_id("itm"),
        title,
        estimated_minutes,
        completed: false,
        complexity,
        goal: normalized_goal(goal),
    };

    {
        let mut runtime = lock_runtime(state)?;
        ensure_meeting_idle(state)?;
        runtime.item_order.push(item.id.clone());
        runtime.items.insert(item.id.clone(), item.clone());
    }

    info!(item_id = %item.id, minutes = item.estimated_minutes, "agenda item created");
    Ok(item)
}

/// Agenda in meeting order. While a meeting runs this is the controller's
/// copy, so completion flags are live.
pub fn list_items_impl(state: &AppState) -> Result<Vec<AgendaItem>, InfraError> {
    let runtime = lock_runtime(state)?;
    let controller = lock_controller(state)?;
    if controller.phase() != MeetingPhase::Idle {
        return Ok(controller.items().to_vec());
    }
    Ok(runtime.ordered_items())
}

pub fn update_item_impl(
    state: &AppState,
    item_id: String,
    title: Option<String>,
    estimated_minutes: Option<f64>,
    complexity: Option<u8>,
    goal: Option<String>,
) -> Result<AgendaItem, InfraError> {
    let item_id = item_id.trim();
    if item_id.is_empty() {
        return Err(InfraError::InvalidInput("item_id must not be empty".to_string()));
    }
    let title = title.as_deref().map(normalized_title).transpose()?;
    if let Some(minutes) = estimated_minutes {
        validate_positive_minutes(minutes, "estimated_minutes").map_err(InfraError::InvalidInput)?;
    }
    if let Some(complexity) = complexity {
        validate_complexity(complexity).map_err(InfraError::InvalidInput)?;
    }

    let mut runtime = lock_runtime(state)?;
    ensure_meeting_idle(state)?;
    let Some(item) = runtime.items.get_mut(item_id) else {
        return Err(InfraError::NotFound(format!("agenda item not found: {item_id}")));
    };

    if let Some(title) = title {
        item.title = title;
    }
    if let Some(minutes) = estimated_minutes {
        item.estimated_minutes = minutes;
    }
    if let Some(complexity) = complexity {
        item.complexity = Some(complexity);
    }
    if goal.is_some() {
        item.goal = normalized_goal(goal);
    }

    let updated = item.clone();
    drop(runtime);
    info!(item_id, "agenda item updated");
    Ok(updated)
}

pub fn delete_item_impl(state: &AppState, item_id: String) -> Result<bool, InfraError> {
    let item_id = item_id.trim();
    if item_id.is_empty() {
        return Err(InfraError::InvalidInput("item_id must not be empty".to_string()));
    }

    let mut runtime = lock_runtime(state)?;
    ensure_meeting_idle(state)?;
    if runtime.items.remove(item_id).is_none() {
        return Ok(false);
    }
    runtime.item_order.retain(|candidate| candidate != item_id);

    info!(item_id, "agenda item deleted");
    Ok(true)
}

/// Replaces the agenda with the entries from `agenda.json`.
pub fn load_default_agenda_impl(state: &AppState) -> Result<Vec<AgendaItem>, InfraError> {
    let drafts = read_default_agenda(&state.config_dir)?;
    let items = drafts
        .into_iter()
        .map(|draft| AgendaItem {
            id: next_id("itm"),
            title: draft.title,
            estimated_minutes: draft.estimated_minutes,
            completed: false,
            complexity: draft.complexity,
            goal: normalized_goal(draft.goal),
        })
        .collect::<Vec<_>>();

    let mut runtime = lock_runtime(state)?;
    ensure_meeting_idle(state)?;
    runtime.replace_items(items.clone());
    drop(runtime);

    info!(items = items.len(), "default agenda loaded");
    Ok(items)
}

pub fn get_agenda_summary_impl(state: &AppState) -> Result<AgendaSummary, InfraError> {
    let items = list_items_impl(state)?;
    let ledger = lock_controller(state)?.ledger().clone();

    let item_count = items.len();
    let completed_count = items.iter().filter(|item| item.completed).count();
    let total_estimated_minutes = items.iter().map(|item| item.estimated_minutes).sum::<f64>();
    let progress_percent = if item_count == 0 {
        0.0
    } else {
        completed_count as f64 * 100.0 / item_count as f64
    };

    Ok(AgendaSummary {
        item_count,
        completed_count,
        remaining_count: item_count - completed_count,
        total_estimated_minutes,
        total_extension_minutes: ledger.total_extension_minutes(),
        total_meeting_minutes: schedule_length_minutes(&items, &ledger),
        progress_percent,
    })
}

/// Scheduled start and end of every item. A running meeting reports its real
/// schedule, extensions included; otherwise the agenda is previewed as if it
/// started at `start` (default now).
pub fn get_scheduled_times_impl(
    state: &AppState,
    start: Option<String>,
) -> Result<Vec<ScheduledSlot>, InfraError> {
    let runtime = lock_runtime(state)?;
    let controller = lock_controller(state)?;
    if let Some(meeting_start) = controller.meeting_start() {
        return Ok(scheduled_slots(controller.items(), meeting_start, controller.ledger()));
    }
    let items = if controller.phase() == MeetingPhase::Idle {
        runtime.ordered_items()
    } else {
        controller.items().to_vec()
    };
    drop(controller);
    drop(runtime);

    let preview_start = parse_instant(start.as_deref(), "start")?;
    Ok(scheduled_slots(&items, preview_start, &ExtensionLedger::new()))
}

/// Starts a meeting over the current agenda. Without `start`, the first tick
/// fixes the meeting start.
pub fn start_meeting_impl(
    state: &AppState,
    start: Option<String>,
) -> Result<StartMeetingResponse, InfraError> {
    let meeting_start = start
        .as_deref()
        .map(|value| parse_rfc3339(value, "start"))
        .transpose()?;

    let mut runtime = lock_runtime(state)?;
    let items = runtime.ordered_items();
    if items.is_empty() {
        return Err(InfraError::InvalidInput("agenda is empty".to_string()));
    }

    let mut controller = lock_controller(state)?;
    let events = controller.start(items, meeting_start)?;
    let phase = controller.phase();
    drop(controller);

    let meeting_id = next_id("mtg");
    runtime.meeting_id = Some(meeting_id.clone());
    runtime.last_meeting_id = Some(meeting_id.clone());
    drop(runtime);

    if let Err(error) = state.transcript.take() {
        warn!(%error, "could not clear transcript at meeting start");
    }
    info!(%meeting_id, phase = phase.as_str(), "meeting started");
    Ok(StartMeetingResponse {
        meeting_id,
        events,
        phase,
    })
}

/// Advances the meeting to `now` (default: current time) and dispatches any
/// completions for analysis. Must run inside a tokio runtime.
pub fn tick_meeting_impl(state: &AppState, now: Option<String>) -> Result<Vec<MeetingEvent>, InfraError> {
    let now = parse_instant(now.as_deref(), "now")?;
    let events = lock_controller(state)?.tick(now);
    state.dispatch_completions(&events)?;
    Ok(events)
}

pub fn get_meeting_state_impl(
    state: &AppState,
    now: Option<String>,
) -> Result<MeetingStateResponse, InfraError> {
    let now = parse_instant(now.as_deref(), "now")?;
    let meeting_id = lock_runtime(state)?.meeting_id.clone();
    let snapshot = lock_controller(state)?.snapshot(now);
    Ok(MeetingStateResponse {
        meeting_id,
        snapshot,
    })
}

/// Answers the time prompt with `decide` or `extend_time` (`more_time`).
/// Must run inside a tokio runtime.
pub fn resolve_popup_impl(
    state: &AppState,
    resolution: String,
    now: Option<String>,
) -> Result<Vec<MeetingEvent>, InfraError> {
    let resolution = parse_resolution(&resolution)?;
    let now = parse_instant(now.as_deref(), "now")?;
    let events = lock_controller(state)?.resolve_popup(resolution, now);
    state.dispatch_completions(&events)?;
    Ok(events)
}

/// Grants extra minutes to the active item; `minutes` defaults to the policy's
/// extension increment.
pub fn grant_extension_impl(state: &AppState, minutes: Option<f64>) -> Result<MeetingEvent, InfraError> {
    let mut controller = lock_controller(state)?;
    let minutes = minutes.unwrap_or(controller.policy().extension_minutes);
    validate_positive_minutes(minutes, "minutes").map_err(InfraError::InvalidInput)?;
    controller.grant_extension(minutes)
}

/// Ends the meeting. Completion flags are written back to the agenda.
pub fn end_meeting_impl(state: &AppState) -> Result<EndMeetingResponse, InfraError> {
    let mut runtime = lock_runtime(state)?;
    let mut controller = lock_controller(state)?;
    if controller.phase() == MeetingPhase::Idle {
        return Err(InfraError::InvalidInput("meeting is not in progress".to_string()));
    }

    let finished_items = controller.items().to_vec();
    controller.reset();
    drop(controller);

    for finished in &finished_items {
        if let Some(item) = runtime.items.get_mut(&finished.id) {
            item.completed = finished.completed;
        }
    }
    let meeting_id = runtime.meeting_id.take();
    drop(runtime);

    if let Err(error) = state.transcript.take() {
        warn!(%error, "could not clear transcript at meeting end");
    }

    let completed_items = finished_items.iter().filter(|item| item.completed).count();
    info!(
        meeting_id = meeting_id.as_deref().unwrap_or("unknown"),
        completed_items,
        "meeting ended"
    );
    Ok(EndMeetingResponse {
        meeting_id,
        completed_items,
        total_items: finished_items.len(),
    })
}

pub fn append_transcript_impl(state: &AppState, text: String) -> Result<(), InfraError> {
    state.transcript.append(&text)
}

/// Decisions for `meeting_id`, or for the current (or most recent) meeting.
pub fn list_decisions_impl(
    state: &AppState,
    meeting_id: Option<String>,
) -> Result<Vec<DecisionRecord>, InfraError> {
    let meeting_id = match meeting_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        Some(value) => value.to_string(),
        None => {
            let runtime = lock_runtime(state)?;
            match runtime.meeting_id.clone().or_else(|| runtime.last_meeting_id.clone()) {
                Some(value) => value,
                None => return Ok(Vec::new()),
            }
        }
    };
    state
        .completion_handler
        .decisions()
        .list_for_meeting(&meeting_id)
}

/// Replaces the meeting policy. Only allowed between meetings.
pub fn update_policy_impl(
    state: &AppState,
    popup_lead_seconds: Option<u32>,
    auto_resolve_seconds: Option<u32>,
    extension_minutes: Option<f64>,
    tick_millis: Option<u64>,
) -> Result<MeetingPolicy, InfraError> {
    let mut controller = lock_controller(state)?;
    if controller.phase() != MeetingPhase::Idle {
        return Err(InfraError::InvalidInput(
            "policy cannot change while a meeting is running".to_string(),
        ));
    }

    let mut policy = controller.policy().clone();
    if let Some(value) = popup_lead_seconds {
        policy.popup_lead_seconds = value;
    }
    if let Some(value) = auto_resolve_seconds {
        policy.auto_resolve_seconds = value;
    }
    if let Some(value) = extension_minutes {
        policy.extension_minutes = value;
    }
    if let Some(value) = tick_millis {
        policy.tick_millis = value;
    }
    policy.validate().map_err(InfraError::InvalidInput)?;

    *controller = ProgressionController::new(policy.clone());
    info!(?policy, "meeting policy updated");
    Ok(policy)
}

fn lock_runtime(state: &AppState) -> Result<MutexGuard<'_, RuntimeState>, InfraError> {
    state
        .runtime
        .lock()
        .map_err(|error| InfraError::LockPoisoned(format!("runtime lock poisoned: {error}")))
}

fn lock_controller(state: &AppState) -> Result<MutexGuard<'_, ProgressionController>, InfraError> {
    state
        .controller
        .lock()
        .map_err(|error| InfraError::LockPoisoned(format!("controller lock poisoned: {error}")))
}

fn lock_analyses(state: &AppState) -> Result<MutexGuard<'_, Vec<AnalysisHandle>>, InfraError> {
    state
        .analyses
        .lock()
        .map_err(|error| InfraError::LockPoisoned(format!("analysis queue lock poisoned: {error}")))
}

fn ensure_meeting_idle(state: &AppState) -> Result<(), InfraError> {
    if lock_controller(state)?.phase() != MeetingPhase::Idle {
        return Err(InfraError::InvalidInput(
            "agenda cannot be edited while a meeting is running".to_string(),
        ));
    }
    Ok(())
}

fn normalized_title(title: &str) -> Result<String, InfraError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(InfraError::InvalidInput("title must not be empty".to_string()));
    }
    Ok(title.to_string())
}

fn normalized_goal(goal: Option<String>) -> Option<String> {
    goal.as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn parse_rfc3339(value: &str, field_name: &str) -> Result<DateTime<Utc>, InfraError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| InfraError::InvalidInput(format!("{field_name} must be RFC3339: {error}")))
}

fn parse_instant(value: Option<&str>, field_name: &str) -> Result<DateTime<Utc>, InfraError> {
    match value {
        Some(value) => parse_rfc3339(value, field_name),
        None => Ok(Utc::now()),
    }
}

fn parse_resolution(value: &str) -> Result<PopupResolution, InfraError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "decide" => Ok(PopupResolution::Decide),
        "extend_time" | "more_time" => Ok(PopupResolution::ExtendTime),
        other => Err(InfraError::InvalidInput(format!(
            "unknown popup resolution '{other}'"
        ))),
    }
}
