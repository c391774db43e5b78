use crate::application::meeting_runner::NowProvider;
use crate::infrastructure::analysis_client::{AnalysisClient, AnalysisRequest};
use crate::infrastructure::decision_repository::{DecisionRecord, DecisionRepository, DecisionStatus};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::transcript::TranscriptSource;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration as TokioDuration};
use tracing::{info, warn};

pub const NO_TRANSCRIPT_MESSAGE: &str = "No transcript available for analysis.";
pub const NO_DECISION_MESSAGE: &str = "No clear decision identified.";
pub const ANALYSIS_FAILED_MESSAGE: &str = "Unable to analyze transcript at this time.";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

/// An agenda item the controller just marked complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedItem {
    pub meeting_id: String,
    pub index: usize,
    pub item_id: String,
    pub title: String,
}

/// Reacts to item completions: captures the item's transcript, asks the
/// analysis service for a decision, and records the outcome.
///
/// Runs outside the progression controller; nothing here can block a tick.
pub struct CompletionHandler<C, R>
where
    C: AnalysisClient,
    R: DecisionRepository,
{
    transcript: Arc<dyn TranscriptSource>,
    analysis_client: Arc<C>,
    decisions: Arc<R>,
    retry_policy: RetryPolicy,
    now_provider: NowProvider,
}

impl<C, R> Clone for CompletionHandler<C, R>
where
    C: AnalysisClient,
    R: DecisionRepository,
{
    fn clone(&self) -> Self {
        Self {
            transcript: Arc::clone(&self.transcript),
            analysis_client: Arc::clone(&self.analysis_client),
            decisions: Arc::clone(&self.decisions),
            retry_policy: self.retry_policy.clone(),
            now_provider: Arc::clone(&self.now_provider),
        }
    }
}

impl<C, R> CompletionHandler<C, R>
where
    C: AnalysisClient + 'static,
    R: DecisionRepository + 'static,
{
    pub fn new(
        transcript: Arc<dyn TranscriptSource>,
        analysis_client: Arc<C>,
        decisions: Arc<R>,
    ) -> Self {
        Self {
            transcript,
            analysis_client,
            decisions,
            retry_policy: RetryPolicy::default(),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn decisions(&self) -> &Arc<R> {
        &self.decisions
    }

    /// Takes the transcript synchronously so the next item starts clean, then
    /// runs the analysis on a background task.
    pub fn on_item_completed(&self, item: CompletedItem) -> JoinHandle<Result<DecisionRecord, InfraError>> {
        let transcript = match self.transcript.take() {
            Ok(transcript) => transcript,
            Err(error) => {
                warn!(%error, item_index = item.index, "failed to capture transcript; analyzing without it");
                String::new()
            }
        };
        let handler = self.clone();
        tokio::spawn(async move { handler.process(item, transcript).await })
    }

    pub async fn process(&self, item: CompletedItem, transcript: String) -> Result<DecisionRecord, InfraError> {
        let (status, decision) = if transcript.trim().is_empty() {
            (DecisionStatus::NoTranscript, NO_TRANSCRIPT_MESSAGE.to_string())
        } else {
            let request = AnalysisRequest {
                item_title: item.title.clone(),
                transcript,
            };
            match self.summarize_with_retry(&request).await {
                Ok(Some(decision)) => (DecisionStatus::Analyzed, decision),
                Ok(None) => (DecisionStatus::Analyzed, NO_DECISION_MESSAGE.to_string()),
                Err(error) => {
                    warn!(%error, item_index = item.index, title = %item.title, "transcript analysis failed");
                    (DecisionStatus::Failed, ANALYSIS_FAILED_MESSAGE.to_string())
                }
            }
        };

        let record = DecisionRecord {
            meeting_id: item.meeting_id,
            item_index: item.index,
            item_id: item.item_id,
            item_title: item.title,
            status,
            decision,
            recorded_at: (self.now_provider)(),
        };
        self.decisions.save(&record)?;
        info!(
            meeting_id = %record.meeting_id,
            item_index = record.item_index,
            status = record.status.as_str(),
            "decision recorded"
        );
        Ok(record)
    }

    async fn summarize_with_retry(&self, request: &AnalysisRequest) -> Result<Option<String>, InfraError> {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u8 = 0;

        loop {
            match self.analysis_client.summarize_decision(request).await {
                Ok(answer) => return Ok(answer),
                Err(error) if should_retry(&error) && attempt + 1 < max_attempts => {
                    let delay = self
                        .retry_policy
                        .base_delay_ms
                        .saturating_mul(2u64.saturating_pow(attempt as u32));
                    warn!(%error, attempt = attempt + 1, delay_ms = delay, "retrying analysis request");
                    sleep(TokioDuration::from_millis(delay)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

fn should_retry(error: &InfraError) -> bool {
    match error {
        InfraError::Analysis(message) => {
            let message = message.to_ascii_lowercase();
            message.contains("network error")
                || message.contains("timeout")
                || message.contains("timed out")
                || message.contains("temporarily unavailable")
                || message.contains("connection reset")
                || message.contains("http 429")
                || message.contains("http 503")
        }
        _ => false,
    }
}
