use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Build,
    Deploy,
    Container,
    Database,
    System,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Build => "build",
            EventType::Deploy => "deploy",
            EventType::Container => "container",
            EventType::Database => "database",
            EventType::System => "system",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(EventType::Build),
            "deploy" => Ok(EventType::Deploy),
            "container" => Ok(EventType::Container),
            "database" => Ok(EventType::Database),
            "system" => Ok(EventType::System),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// One append-only lifecycle event row, keyed by preview.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub id: i64,
    pub preview_ref: String,
    pub pull_request_number: Option<i64>,
    #[sqlx(rename = "event_type")]
    #[serde(rename = "type")]
    pub event_type_raw: String,
    pub message: String,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn event_type(&self) -> EventType {
        self.event_type_raw
            .parse()
            .unwrap_or(EventType::System)
    }
}
