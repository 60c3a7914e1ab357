use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Area, QuestionId, QuestionView, SessionKind};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CreatePracticeStopRequest {
    pub area: Area,
    pub subtopic: String,
    pub level: u8,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CreateSimulationRequest {
    pub area: Area,
    /// Empty means the area's whole curriculum.
    #[serde(default)]
    pub subtopics: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CreateChallengeRequest {
    pub area: Area,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SubmittedAnswer {
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_option: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_spent_seconds: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CloseSessionRequest {
    pub answers: Vec<SubmittedAnswer>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: Uuid,
    pub kind: SessionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<Area>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtopic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    pub started_at: DateTime<Utc>,
    pub total_questions: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CreatedSession {
    pub session: SessionSummary,
    pub questions: Vec<QuestionView>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct CloseOutcome {
    pub passed: bool,
    pub correct_count: u32,
    pub percentage: u8,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct AreaScore {
    pub correct: u32,
    pub total: u32,
    pub percentage: u8,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct QuestionResult {
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<QuestionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<Area>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_option: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_option: Option<String>,
    pub correct: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DiagnosticReport {
    pub session_id: Uuid,
    pub per_area_score: BTreeMap<Area, AreaScore>,
    pub overall_score: u8,
    pub passed: bool,
    pub per_question: Vec<QuestionResult>,
}

/// Offline client state reported on reconnect.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SyncRequest {
    #[serde(default)]
    pub levels: BTreeMap<Area, u8>,
    #[serde(default)]
    pub lives: BTreeMap<Area, BTreeMap<u8, u8>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub levels_applied: u32,
    pub lives_applied: u32,
}

pub type UnlockedLevels = BTreeMap<Area, u8>;

pub type LivesByArea = BTreeMap<Area, BTreeMap<u8, u8>>;
