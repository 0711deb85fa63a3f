use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::user::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Agent,
    System,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Chat,
    Guidance,
    ToolLog,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "agent" | "assistant" => Some(Self::Agent),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

impl TurnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Guidance => "guidance",
            Self::ToolLog => "tool_log",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "chat" => Some(Self::Chat),
            "guidance" => Some(Self::Guidance),
            "tool_log" => Some(Self::ToolLog),
            _ => None,
        }
    }
}

/// A turn as stored. Turns are never mutated once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: i64,
    pub user_id: UserId,
    pub role: TurnRole,
    pub kind: TurnKind,
    pub content: String,
    pub visible: bool,
    pub created_at: DateTime<Utc>,
}

/// A turn waiting to be appended; the store assigns id and timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewTurn {
    pub role: TurnRole,
    pub kind: TurnKind,
    pub content: String,
    pub visible: bool,
}

impl NewTurn {
    pub fn user_chat(content: impl Into<String>) -> Self {
        Self { role: TurnRole::User, kind: TurnKind::Chat, content: content.into(), visible: true }
    }

    pub fn agent_chat(content: impl Into<String>) -> Self {
        Self { role: TurnRole::Agent, kind: TurnKind::Chat, content: content.into(), visible: true }
    }

    pub fn tool_log(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::System,
            kind: TurnKind::ToolLog,
            content: content.into(),
            visible: false,
        }
    }

    pub fn guidance(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::System,
            kind: TurnKind::Guidance,
            content: content.into(),
            visible: true,
        }
    }
}

/// Returns a timestamp strictly after `last`, bumping `now` by one microsecond when needed.
pub fn next_monotonic_timestamp(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = truncate_to_micros(now);
    match last {
        Some(last) if now <= last => last + Duration::microseconds(1),
        _ => now,
    }
}

/// Storage keeps microsecond precision, so timestamps are compared at that resolution.
pub fn truncate_to_micros(value: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(value.timestamp_micros()).unwrap_or(value)
}
