pub mod application;
pub mod domain;
pub mod infrastructure;

use application::bootstrap::bootstrap_workspace;
use application::commands::{
    append_transcript_impl, end_meeting_impl, get_agenda_summary_impl, get_meeting_state_impl,
    grant_extension_impl, list_decisions_impl, load_default_agenda_impl, resolve_popup_impl,
    start_meeting_impl, AppState,
};
use application::meeting_runner::{system_clock, MeetingRunner};
use domain::models::{MeetingEvent, PopupState};
use infrastructure::config::read_app_name;
use infrastructure::error::InfraError;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "huddle=info";

/// Installs the global subscriber: `RUST_LOG` (default `huddle=info`) to
/// stderr, plus plain-text lines appended to `log_path` when given.
pub fn init_tracing(log_path: Option<&Path>) -> Result<(), InfraError> {
    let file_layer = match log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|error| InfraError::InvalidConfig(format!("failed to install log subscriber: {error}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputOutcome {
    Continue,
    Quit,
    Finished,
}

/// Why the console loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Finished,
    Quit,
    Interrupted,
    ClockStopped,
}

/// Runs one meeting over the default agenda in `workspace_root`.
///
/// Lines typed on stdin are added to the transcript, except for the
/// commands `/decide`, `/more`, `/extend [minutes]`, `/status` and `/quit`.
/// Returns once the final item completes, on `/quit`, or on Ctrl-C.
pub async fn run(workspace_root: PathBuf) -> Result<(), InfraError> {
    let bootstrap = bootstrap_workspace(&workspace_root)?;
    init_tracing(Some(&bootstrap.log_path()))?;
    let app_name = read_app_name(&bootstrap.config_dir)?;

    let state = AppState::from_bootstrap(bootstrap, |key| std::env::var(key).ok())?;
    let agenda = load_default_agenda_impl(&state).map_err(|error| {
        state.command_error("load_default_agenda", &error);
        error
    })?;
    if agenda.is_empty() {
        warn!("default agenda is empty; nothing to run");
        return Ok(());
    }
    println!("{app_name}: {} agenda items", agenda.len());
    for (index, item) in agenda.iter().enumerate() {
        println!("{:>2}. {} ({} min)", index + 1, item.title, item.estimated_minutes);
    }
    let final_index = agenda.len() - 1;

    let started = start_meeting_impl(&state, None).map_err(|error| {
        state.command_error("start_meeting", &error);
        error
    })?;
    let policy = state.policy()?;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut runner = MeetingRunner::spawn(
        Arc::clone(state.controller()),
        policy.tick_interval(),
        system_clock(),
        events_tx,
    );

    let interrupted = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let exit = drive_meeting(
        &state,
        &mut events_rx,
        BufReader::new(tokio::io::stdin()),
        final_index,
        interrupted,
    )
    .await;
    info!(?exit, "console loop finished");

    dispatch_ready_events(&state, &mut events_rx);
    let ended = end_meeting_impl(&state).map_err(|error| {
        state.command_error("end_meeting", &error);
        error
    })?;
    runner.stop().await;
    drain_events(&state, &mut events_rx).await;
    state.wait_for_analyses().await?;

    println!(
        "{app_name} meeting {} ended: {}/{} items completed.",
        started.meeting_id, ended.completed_items, ended.total_items
    );
    for record in list_decisions_impl(&state, Some(started.meeting_id))? {
        println!("- {}: {}", record.item_title, record.decision);
    }
    Ok(())
}

/// Feeds runner events and console lines to the meeting until the final item
/// completes, the user quits, `shutdown` resolves, or the runner goes away.
///
/// Every event received is dispatched before the loop decides to stop, so a
/// batch that finishes the meeting is never cut short.
async fn drive_meeting<R, S>(
    state: &AppState,
    events_rx: &mut mpsc::UnboundedReceiver<MeetingEvent>,
    input: R,
    final_index: usize,
    shutdown: S,
) -> LoopExit
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut lines = input.lines();
    let mut input_open = true;

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else {
                    return LoopExit::ClockStopped;
                };
                let events = std::slice::from_ref(&event);
                apply_events(state, events);
                if completes_final_item(events, final_index) {
                    info!("final agenda item completed");
                    return LoopExit::Finished;
                }
            }
            line = lines.next_line(), if input_open => {
                match line {
                    Ok(Some(line)) => match handle_input(state, &line, final_index) {
                        InputOutcome::Continue => {}
                        InputOutcome::Quit => return LoopExit::Quit,
                        InputOutcome::Finished => return LoopExit::Finished,
                    },
                    Ok(None) => input_open = false,
                    Err(error) => {
                        warn!(%error, "stdin closed with error; transcript input disabled");
                        input_open = false;
                    }
                }
            }
            _ = &mut shutdown => {
                info!("interrupted; ending meeting");
                return LoopExit::Interrupted;
            }
        }
    }
}

fn apply_events(state: &AppState, events: &[MeetingEvent]) {
    events.iter().for_each(report_event);
    if let Err(error) = state.dispatch_completions(events) {
        state.command_error("dispatch_completions", &error);
    }
}

/// Applies whatever is already queued without waiting.
fn dispatch_ready_events(state: &AppState, events_rx: &mut mpsc::UnboundedReceiver<MeetingEvent>) -> usize {
    let mut applied = 0;
    while let Ok(event) = events_rx.try_recv() {
        apply_events(state, std::slice::from_ref(&event));
        applied += 1;
    }
    applied
}

/// Applies everything left until the runner drops its sender.
async fn drain_events(state: &AppState, events_rx: &mut mpsc::UnboundedReceiver<MeetingEvent>) -> usize {
    let mut applied = 0;
    while let Some(event) = events_rx.recv().await {
        apply_events(state, std::slice::from_ref(&event));
        applied += 1;
    }
    if applied > 0 {
        debug!(applied, "late meeting events dispatched");
    }
    applied
}

fn completes_final_item(events: &[MeetingEvent], final_index: usize) -> bool {
    events
        .iter()
        .any(|event| matches!(event, MeetingEvent::ItemCompleted { index, .. } if *index == final_index))
}

fn handle_input(state: &AppState, line: &str, final_index: usize) -> InputOutcome {
    let line = line.trim();
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();

    let result = match command {
        "/quit" => return InputOutcome::Quit,
        "/decide" | "/more" => {
            let resolution = if command == "/decide" { "decide" } else { "more_time" };
            match resolve_popup_impl(state, resolution.to_string(), None) {
                Ok(events) => {
                    events.iter().for_each(report_event);
                    if completes_final_item(&events, final_index) {
                        return InputOutcome::Finished;
                    }
                    Ok(())
                }
                Err(error) => Err(state.command_error("resolve_popup", &error)),
            }
        }
        "/extend" => {
            let minutes = match parts.next().map(str::parse::<f64>).transpose() {
                Ok(minutes) => minutes,
                Err(error) => {
                    let error = InfraError::InvalidInput(format!("minutes must be a number: {error}"));
                    println!("! {}", state.command_error("grant_extension", &error));
                    return InputOutcome::Continue;
                }
            };
            grant_extension_impl(state, minutes)
                .map(|event| report_event(&event))
                .map_err(|error| state.command_error("grant_extension", &error))
        }
        "/status" => report_status(state),
        _ => append_transcript_impl(state, line.to_string())
            .map_err(|error| state.command_error("append_transcript", &error)),
    };

    if let Err(message) = result {
        println!("! {message}");
    }
    InputOutcome::Continue
}

fn report_status(state: &AppState) -> Result<(), String> {
    let meeting = get_meeting_state_impl(state, None)
        .map_err(|error| state.command_error("get_meeting_state", &error))?;
    let summary = get_agenda_summary_impl(state)
        .map_err(|error| state.command_error("get_agenda_summary", &error))?;

    let snapshot = meeting.snapshot;
    if let (Some(index), Some(schedule)) = (snapshot.active_index, snapshot.schedule) {
        let title = snapshot
            .items
            .get(index)
            .map(|item| item.title.as_str())
            .unwrap_or_default();
        println!(
            "Now: {title} ({:.1} min left), {:.0}% done, {:.1} extra min granted",
            schedule.time_remaining_minutes, summary.progress_percent, summary.total_extension_minutes
        );
    } else {
        println!("Meeting has not started yet.");
    }
    if let PopupState::Visible { index, .. } = snapshot.popup {
        println!("Time is almost up for item {}: /decide or /more", index + 1);
    }
    Ok(())
}

fn report_event(event: &MeetingEvent) {
    match event {
        MeetingEvent::MeetingStarted { start_at } => println!("Meeting started at {start_at}"),
        MeetingEvent::ActiveIndexChanged { to, .. } => println!("Now discussing item {}", to + 1),
        MeetingEvent::ItemCompleted { index, title, .. } => {
            println!("Item {} done: {title}", index + 1)
        }
        MeetingEvent::PopupOpened { index, .. } => {
            println!("Time is almost up for item {}: /decide or /more", index + 1)
        }
        MeetingEvent::PopupResolved {
            index,
            resolution,
            automatic,
        } => {
            let source = if *automatic { "automatically" } else { "by request" };
            println!("Item {} prompt answered {source}: {}", index + 1, resolution.as_str())
        }
        MeetingEvent::ExtensionGranted {
            minutes,
            total_minutes,
            ..
        } => println!("Added {minutes} min ({total_minutes} min extra in total)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use application::commands::{create_item_impl, tick_meeting_impl};
    use chrono::{DateTime, Utc};
    use domain::schedule::offset_instant;
    use infrastructure::decision_repository::DecisionStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_WORKSPACE: AtomicUsize = AtomicUsize::new(0);

    struct TempWorkspace {
        path: PathBuf,
    }

    impl TempWorkspace {
        fn new() -> Self {
            let sequence = NEXT_TEMP_WORKSPACE.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "huddle-console-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&path).expect("create temp workspace");
            Self { path }
        }

        fn app_state(&self) -> AppState {
            AppState::with_lookup(self.path.clone(), |_| None).expect("initialize app state")
        }
    }

    impl Drop for TempWorkspace {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    const START: &str = "2026-02-16T09:00:00Z";

    fn at_minutes(minutes: f64) -> DateTime<Utc> {
        let start = DateTime::parse_from_rfc3339(START)
            .expect("valid datetime")
            .with_timezone(&Utc);
        offset_instant(start, minutes)
    }

    fn started_meeting(state: &AppState, minutes: &[f64]) -> String {
        for (index, value) in minutes.iter().enumerate() {
            create_item_impl(state, format!("Topic {index}"), *value, None, None).expect("create item");
        }
        start_meeting_impl(state, Some(START.to_string()))
            .expect("start")
            .meeting_id
    }

    /// Ticks the controller the way the runner does and queues the batch.
    fn queue_tick(state: &AppState, tx: &mpsc::UnboundedSender<MeetingEvent>, minutes: f64) {
        let batch = state.controller().lock().expect("controller").tick(at_minutes(minutes));
        for event in batch {
            tx.send(event).expect("queue event");
        }
    }

    fn extension_minutes(state: &AppState) -> f64 {
        get_agenda_summary_impl(state).expect("summary").total_extension_minutes
    }

    #[tokio::test]
    async fn finishing_batch_is_dispatched_in_full() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state();
        started_meeting(&state, &[1.0, 1.0, 1.0]);
        append_transcript_impl(&state, "launch date stays in March".to_string()).expect("append");

        let (tx, mut rx) = mpsc::unbounded_channel();
        queue_tick(&state, &tx, 5.0);
        assert!(state.controller().lock().expect("controller").is_finished());

        let exit = drive_meeting(&state, &mut rx, &b""[..], 2, std::future::pending::<()>()).await;
        assert_eq!(exit, LoopExit::Finished);

        let mut records = state.wait_for_analyses().await.expect("wait");
        records.sort_by_key(|record| record.item_index);
        assert_eq!(
            records.iter().map(|record| record.item_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(records[0].status, DecisionStatus::Failed);
        assert_eq!(records[2].status, DecisionStatus::NoTranscript);
    }

    #[tokio::test]
    async fn events_left_after_quit_are_recorded_for_the_meeting() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state();
        let meeting_id = started_meeting(&state, &[1.0, 1.0]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let exit = drive_meeting(&state, &mut rx, &b"/quit\n"[..], 1, std::future::pending::<()>()).await;
        assert_eq!(exit, LoopExit::Quit);

        queue_tick(&state, &tx, 3.0);
        end_meeting_impl(&state).expect("end");
        drop(tx);
        assert_eq!(drain_events(&state, &mut rx).await, 3);

        let records = state.wait_for_analyses().await.expect("wait");
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|record| record.meeting_id == meeting_id));
    }

    #[tokio::test]
    async fn queued_events_are_applied_without_waiting() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state();
        started_meeting(&state, &[1.0, 1.0]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        queue_tick(&state, &tx, 1.2);
        assert_eq!(dispatch_ready_events(&state, &mut rx), 2);
        assert_eq!(dispatch_ready_events(&state, &mut rx), 0);

        let records = state.wait_for_analyses().await.expect("wait");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].item_index, 0);
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown_or_when_runner_is_gone() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state();
        started_meeting(&state, &[1.0]);

        let (tx, mut rx) = mpsc::unbounded_channel::<MeetingEvent>();
        let exit = drive_meeting(&state, &mut rx, &b""[..], 0, std::future::ready(())).await;
        assert_eq!(exit, LoopExit::Interrupted);

        drop(tx);
        let exit = drive_meeting(&state, &mut rx, &b""[..], 0, std::future::pending::<()>()).await;
        assert_eq!(exit, LoopExit::ClockStopped);
    }

    #[tokio::test]
    async fn console_commands_drive_the_meeting() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state();
        started_meeting(&state, &[5.0, 5.0]);

        assert_eq!(handle_input(&state, "/extend 2.5", 1), InputOutcome::Continue);
        assert_eq!(extension_minutes(&state), 2.5);
        assert_eq!(handle_input(&state, "/extend abc", 1), InputOutcome::Continue);
        assert_eq!(handle_input(&state, "/extend -1", 1), InputOutcome::Continue);
        assert_eq!(extension_minutes(&state), 2.5);

        assert_eq!(handle_input(&state, "/more", 1), InputOutcome::Continue);
        assert_eq!(extension_minutes(&state), 2.5);
        assert_eq!(handle_input(&state, "/status", 1), InputOutcome::Continue);
        assert_eq!(handle_input(&state, "we move the review to Friday", 1), InputOutcome::Continue);
        assert_eq!(handle_input(&state, "  /quit  ", 1), InputOutcome::Quit);
    }

    #[tokio::test]
    async fn deciding_on_the_last_item_finishes_the_meeting() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state();
        started_meeting(&state, &[1.0]);

        let opened = tick_meeting_impl(&state, Some(at_minutes(0.6).to_rfc3339())).expect("tick");
        assert!(opened
            .iter()
            .any(|event| matches!(event, MeetingEvent::PopupOpened { index: 0, .. })));

        assert_eq!(handle_input(&state, "/decide", 0), InputOutcome::Finished);
        let records = state.wait_for_analyses().await.expect("wait");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].item_index, 0);
    }
}
