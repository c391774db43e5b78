use crate::domain::models::{validate_complexity, validate_positive_minutes, MeetingPolicy};
use crate::infrastructure::analysis_client::AnalysisSettings;
use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

const APP_JSON: &str = "app.json";
const POLICIES_JSON: &str = "policies.json";
const AGENDA_JSON: &str = "agenda.json";

pub const API_KEY_ENV_KEYS: &[&str] = &["HUDDLE_OPENAI_API_KEY", "OPENAI_API_KEY"];
pub const BASE_URL_ENV_KEYS: &[&str] = &["HUDDLE_ANALYSIS_BASE_URL"];

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBundle {
    pub app: serde_json::Value,
    pub policies: serde_json::Value,
    pub agenda: serde_json::Value,
}

/// One agenda entry as written in `agenda.json`, before it is given an id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgendaDraft {
    pub title: String,
    pub estimated_minutes: f64,
    #[serde(default)]
    pub complexity: Option<u8>,
    #[serde(default)]
    pub goal: Option<String>,
}

impl AgendaDraft {
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("agenda.items[].title must not be empty".to_string());
        }
        validate_positive_minutes(self.estimated_minutes, "agenda.items[].estimatedMinutes")?;
        if let Some(complexity) = self.complexity {
            validate_complexity(complexity)?;
        }
        Ok(())
    }
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "appName": "Huddle",
                "analysis": {
                    "baseUrl": "https://api.openai.com/v1",
                    "model": "gpt-3.5-turbo",
                    "maxTokens": 150,
                    "temperature": 0.3
                }
            }),
        ),
        (
            POLICIES_JSON,
            serde_json::json!({
                "schema": 1,
                "popupLeadSeconds": 30,
                "autoResolveSeconds": 60,
                "extensionMinutes": 1,
                "tickMillis": 1000
            }),
        ),
        (
            AGENDA_JSON,
            serde_json::json!({
                "schema": 1,
                "items": [
                    {
                        "title": "Problem Identification",
                        "estimatedMinutes": 0.5,
                        "complexity": 5,
                        "goal": "Define the core meeting efficiency problem we're solving"
                    },
                    {
                        "title": "Solution Architecture",
                        "estimatedMinutes": 0.5,
                        "complexity": 8,
                        "goal": "Explain how the assistant keeps meetings efficient and builds consensus in real time"
                    },
                    {
                        "title": "Feature Demonstration",
                        "estimatedMinutes": 0.5,
                        "complexity": 6,
                        "goal": "Show key capabilities"
                    },
                    {
                        "title": "Conclusion",
                        "estimatedMinutes": 0.5,
                        "complexity": 3,
                        "goal": "Summarize and close"
                    }
                ]
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_configs(config_dir: &Path) -> Result<ConfigBundle, InfraError> {
    Ok(ConfigBundle {
        app: read_config(&config_dir.join(APP_JSON))?,
        policies: read_config(&config_dir.join(POLICIES_JSON))?,
        agenda: read_config(&config_dir.join(AGENDA_JSON))?,
    })
}

/// Reads `policies.json`. Fields that are missing or out of range keep their
/// defaults.
pub fn read_meeting_policy(config_dir: &Path) -> Result<MeetingPolicy, InfraError> {
    let parsed = read_config(&config_dir.join(POLICIES_JSON))?;
    let mut policy = MeetingPolicy::default();

    if let Some(value) = positive_u64(&parsed, "popupLeadSeconds") {
        policy.popup_lead_seconds = value.min(u64::from(u32::MAX)) as u32;
    }
    if let Some(value) = positive_u64(&parsed, "autoResolveSeconds") {
        policy.auto_resolve_seconds = value.min(u64::from(u32::MAX)) as u32;
    }
    if let Some(value) = parsed
        .get("extensionMinutes")
        .and_then(serde_json::Value::as_f64)
        .filter(|value| value.is_finite() && *value > 0.0)
    {
        policy.extension_minutes = value;
    }
    if let Some(value) = positive_u64(&parsed, "tickMillis") {
        policy.tick_millis = value;
    }

    Ok(policy)
}

fn positive_u64(parsed: &serde_json::Value, key: &str) -> Option<u64> {
    parsed
        .get(key)
        .and_then(serde_json::Value::as_u64)
        .filter(|value| *value > 0)
}

/// Reads the default agenda from `agenda.json`, skipping invalid entries.
pub fn read_default_agenda(config_dir: &Path) -> Result<Vec<AgendaDraft>, InfraError> {
    let path = config_dir.join(AGENDA_JSON);
    let parsed = read_config(&path)?;
    let Some(items) = parsed.get("items").and_then(serde_json::Value::as_array) else {
        return Err(InfraError::InvalidConfig(format!(
            "missing items array in {}",
            path.display()
        )));
    };

    let mut drafts = Vec::with_capacity(items.len());
    for (position, raw) in items.iter().enumerate() {
        let draft = match serde_json::from_value::<AgendaDraft>(raw.clone()) {
            Ok(draft) => draft,
            Err(error) => {
                warn!(position, %error, "skipping unreadable agenda entry");
                continue;
            }
        };
        if let Err(message) = draft.validate() {
            warn!(position, %message, "skipping invalid agenda entry");
            continue;
        }
        drafts.push(AgendaDraft {
            title: draft.title.trim().to_string(),
            ..draft
        });
    }
    Ok(drafts)
}

pub fn read_analysis_settings<F>(config_dir: &Path, lookup: F) -> Result<AnalysisSettings, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let app = read_config(&config_dir.join(APP_JSON))?;
    let mut settings = AnalysisSettings::default();
    let analysis = app.get("analysis");

    if let Some(base_url) = analysis
        .and_then(|value| value.get("baseUrl"))
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        settings.base_url = base_url.to_string();
    }
    if let Some(model) = analysis
        .and_then(|value| value.get("model"))
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        settings.model = model.to_string();
    }
    if let Some(max_tokens) = analysis
        .and_then(|value| value.get("maxTokens"))
        .and_then(serde_json::Value::as_u64)
        .filter(|value| *value > 0)
    {
        settings.max_tokens = max_tokens.min(u64::from(u32::MAX)) as u32;
    }
    if let Some(temperature) = analysis
        .and_then(|value| value.get("temperature"))
        .and_then(serde_json::Value::as_f64)
        .filter(|value| value.is_finite() && *value >= 0.0)
    {
        settings.temperature = temperature;
    }

    if let Some(base_url) = optional_lookup_value(&lookup, BASE_URL_ENV_KEYS) {
        settings.base_url = base_url;
    }
    settings.api_key = optional_lookup_value(&lookup, API_KEY_ENV_KEYS);
    Ok(settings)
}

pub fn read_app_name(config_dir: &Path) -> Result<String, InfraError> {
    let app = read_config(&config_dir.join(APP_JSON))?;
    let name = app
        .get("appName")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("Huddle");
    Ok(name.to_string())
}

fn optional_lookup_value<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    for key in keys {
        if let Some(value) = lookup(key) {
            let normalized = value.trim();
            if !normalized.is_empty() {
                return Some(normalized.to_string());
            }
        }
    }
    None
}
