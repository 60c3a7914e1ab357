pub mod api;
pub mod curriculum;
pub mod text_cleanup;

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::text_cleanup::fold_accents;

/// Bank question identifier.
pub type QuestionId = i64;

/// Number of lives a level starts with.
pub const MAX_LIVES: u8 = 3;

/// Highest level index. Levels 1..=5 follow the curriculum, level 6 is the capstone.
pub const MAX_LEVEL: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Serialize,
    Deserialize,
    Hash,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    schemars::JsonSchema,
)]
#[serde(try_from = "String")]
pub enum Area {
    #[serde(rename = "Matematicas")]
    Math,
    #[serde(rename = "Lenguaje")]
    Language,
    #[serde(rename = "Ciencias")]
    Science,
    #[serde(rename = "Sociales")]
    SocialStudies,
    #[serde(rename = "Ingles")]
    English,
}

impl Area {
    /// All areas, in the order the diagnostic presents them.
    pub const ALL: [Area; 5] = [
        Area::Math,
        Area::Language,
        Area::Science,
        Area::SocialStudies,
        Area::English,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Area::Math => "Matematicas",
            Area::Language => "Lenguaje",
            Area::Science => "Ciencias",
            Area::SocialStudies => "Sociales",
            Area::English => "Ingles",
        }
    }
}

impl std::fmt::Display for Area {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Area {
    type Err = ParseEnumError;

    /// Accent and case insensitive, so "Matemáticas", "matematicas" and "Math" all parse.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match fold_accents(s.trim()).as_str() {
            "matematicas" | "math" | "mathematics" => Ok(Area::Math),
            "lenguaje" | "language" | "lectura critica" => Ok(Area::Language),
            "ciencias" | "ciencias naturales" | "science" => Ok(Area::Science),
            "sociales" | "ciencias sociales" | "social studies" => Ok(Area::SocialStudies),
            "ingles" | "english" => Ok(Area::English),
            _ => Err(ParseEnumError::new("area", s)),
        }
    }
}

impl TryFrom<String> for Area {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Serialize,
    Deserialize,
    Hash,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }

    /// Difficulty a practice stop asks for at a given level.
    pub fn for_level(level: u8) -> Self {
        match level {
            0..=2 => Difficulty::Easy,
            3..=4 => Difficulty::Medium,
            _ => Difficulty::Hard,
        }
    }
}

impl FromStr for Difficulty {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            _ => Err(ParseEnumError::new("difficulty", s)),
        }
    }
}

#[derive(
    Clone, Copy, Debug, Serialize, Deserialize, Hash, Eq, PartialEq, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum LearningStyle {
    Visual,
    Auditory,
    ReadWrite,
    Kinesthetic,
}

impl LearningStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            LearningStyle::Visual => "visual",
            LearningStyle::Auditory => "auditory",
            LearningStyle::ReadWrite => "read_write",
            LearningStyle::Kinesthetic => "kinesthetic",
        }
    }
}

impl FromStr for LearningStyle {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "visual" => Ok(LearningStyle::Visual),
            "auditory" => Ok(LearningStyle::Auditory),
            "read_write" | "reading" => Ok(LearningStyle::ReadWrite),
            "kinesthetic" => Ok(LearningStyle::Kinesthetic),
            _ => Err(ParseEnumError::new("learning style", s)),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Hash, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Diagnostic,
    PracticeStop,
    Simulation,
    Challenge,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Diagnostic => "diagnostic",
            SessionKind::PracticeStop => "practice_stop",
            SessionKind::Simulation => "simulation",
            SessionKind::Challenge => "challenge",
        }
    }
}

impl FromStr for SessionKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "diagnostic" => Ok(SessionKind::Diagnostic),
            "practice_stop" => Ok(SessionKind::PracticeStop),
            "simulation" => Ok(SessionKind::Simulation),
            "challenge" => Ok(SessionKind::Challenge),
            _ => Err(ParseEnumError::new("session kind", s)),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Hash, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressState {
    Pending,
    InProgress,
    Passed,
    FailedLocked,
}

impl ProgressState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressState::Pending => "pending",
            ProgressState::InProgress => "in_progress",
            ProgressState::Passed => "passed",
            ProgressState::FailedLocked => "failed_locked",
        }
    }
}

impl FromStr for ProgressState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProgressState::Pending),
            "in_progress" => Ok(ProgressState::InProgress),
            "passed" => Ok(ProgressState::Passed),
            "failed_locked" => Ok(ProgressState::FailedLocked),
            _ => Err(ParseEnumError::new("progress state", s)),
        }
    }
}

/// Role of an already-authenticated caller.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Hash, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Student,
    Teacher,
    Admin,
}

impl FromStr for Role {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "student" | "estudiante" | "authenticated" => Ok(Role::Student),
            "teacher" | "docente" => Ok(Role::Teacher),
            "admin" | "administrador" => Ok(Role::Admin),
            _ => Err(ParseEnumError::new("role", s)),
        }
    }
}

/// The validated identity every operation runs on behalf of.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub user_id: uuid::Uuid,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institution: Option<String>,
}

impl Actor {
    pub fn student(user_id: uuid::Uuid) -> Self {
        Self {
            user_id,
            role: Role::Student,
            institution: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, schemars::JsonSchema)]
pub struct QuestionOption {
    pub label: String,
    pub text: String,
}

/// A bank item. Immutable once created.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Question {
    pub id: QuestionId,
    pub area: Area,
    pub subtopic: String,
    pub difficulty: Difficulty,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_style: Option<LearningStyle>,
    pub prompt: String,
    pub options: Vec<QuestionOption>,
    pub correct_option: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_seconds: Option<u32>,
}

/// What a student sees: a question without its answer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionView {
    pub order: u32,
    pub id: QuestionId,
    pub area: Area,
    pub subtopic: String,
    pub difficulty: Difficulty,
    pub prompt: String,
    pub options: Vec<QuestionOption>,
    pub time_limit_seconds: u32,
}

impl QuestionView {
    pub fn new(order: u32, question: &Question, time_limit_seconds: u32) -> Self {
        Self {
            order,
            id: question.id,
            area: question.area,
            subtopic: question.subtopic.clone(),
            difficulty: question.difficulty,
            prompt: question.prompt.clone(),
            options: question.options.clone(),
            time_limit_seconds,
        }
    }
}
