use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Analyzed,
    NoTranscript,
    Failed,
}

impl DecisionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analyzed => "analyzed",
            Self::NoTranscript => "no_transcript",
            Self::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self, InfraError> {
        match value {
            "analyzed" => Ok(Self::Analyzed),
            "no_transcript" => Ok(Self::NoTranscript),
            "failed" => Ok(Self::Failed),
            other => Err(InfraError::InvalidConfig(format!(
                "unknown decision status '{other}'"
            ))),
        }
    }
}

/// Outcome of analyzing one finished agenda item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecisionRecord {
    pub meeting_id: String,
    pub item_index: usize,
    pub item_id: String,
    pub item_title: String,
    pub status: DecisionStatus,
    pub decision: String,
    pub recorded_at: DateTime<Utc>,
}

pub trait DecisionRepository: Send + Sync {
    /// Stores the record, replacing any earlier one for the same item.
    fn save(&self, record: &DecisionRecord) -> Result<(), InfraError>;
    /// Records for one meeting, in agenda order.
    fn list_for_meeting(&self, meeting_id: &str) -> Result<Vec<DecisionRecord>, InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteDecisionRepository {
    db_path: PathBuf,
}

impl SqliteDecisionRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }
}

impl DecisionRepository for SqliteDecisionRepository {
    fn save(&self, record: &DecisionRecord) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO decisions (meeting_id, item_index, item_id, item_title, status, decision, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(meeting_id, item_index) DO UPDATE SET
               item_id = excluded.item_id,
               item_title = excluded.item_title,
               status = excluded.status,
               decision = excluded.decision,
               recorded_at = excluded.recorded_at",
            params![
                record.meeting_id,
                record.item_index as i64,
                record.item_id,
                record.item_title,
                record.status.as_str(),
                record.decision,
                record.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn list_for_meeting(&self, meeting_id: &str) -> Result<Vec<DecisionRecord>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT meeting_id, item_index, item_id, item_title, status, decision, recorded_at
             FROM decisions WHERE meeting_id = ?1 ORDER BY item_index ASC",
        )?;
        let rows = statement.query_map(params![meeting_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (meeting_id, item_index, item_id, item_title, status, decision, recorded_at_raw) = row?;
            let recorded_at = DateTime::parse_from_rfc3339(&recorded_at_raw).map_err(|error| {
                InfraError::InvalidConfig(format!(
                    "invalid decisions.recorded_at '{}': {error}",
                    recorded_at_raw
                ))
            })?;
            let item_index = usize::try_from(item_index).map_err(|_| {
                InfraError::InvalidConfig(format!("invalid decisions.item_index {item_index}"))
            })?;
            records.push(DecisionRecord {
                meeting_id,
                item_index,
                item_id,
                item_title,
                status: DecisionStatus::parse(&status)?,
                decision,
                recorded_at: recorded_at.with_timezone(&Utc),
            });
        }
        Ok(records)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDecisionRepository {
    records: Mutex<BTreeMap<(String, usize), DecisionRecord>>,
}

impl DecisionRepository for InMemoryDecisionRepository {
    fn save(&self, record: &DecisionRecord) -> Result<(), InfraError> {
        let mut records = self
            .records
            .lock()
            .map_err(|error| InfraError::LockPoisoned(format!("decision log lock poisoned: {error}")))?;
        records.insert(
            (record.meeting_id.clone(), record.item_index),
            record.clone(),
        );
        Ok(())
    }

    fn list_for_meeting(&self, meeting_id: &str) -> Result<Vec<DecisionRecord>, InfraError> {
        let records = self
            .records
            .lock()
            .map_err(|error| InfraError::LockPoisoned(format!("decision log lock poisoned: {error}")))?;
        Ok(records
            .values()
            .filter(|record| record.meeting_id == meeting_id)
            .cloned()
            .collect())
    }
}
