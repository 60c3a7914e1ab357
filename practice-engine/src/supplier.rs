//! The generative candidate supplier seam.
//!
//! The supplier is external and unreliable: it may return fewer candidates
//! than asked for, malformed ones, or fail outright. The cascade swallows all
//! of that and falls through to the bank.

use futures::future::{self, BoxFuture, FutureExt};
use practice_utils::{Area, Difficulty, LearningStyle, QuestionId, QuestionOption};
use serde::{Deserialize, Serialize};

use crate::bank::{NewQuestion, Origin};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerateRequest {
    pub area: Area,
    /// Empty means any subtopic in the area.
    pub subtopics: Vec<String>,
    pub difficulty: Difficulty,
    pub style_hint: Option<LearningStyle>,
    pub count: usize,
    pub institution: Option<String>,
    pub exclude_ids: Vec<QuestionId>,
}

/// A question proposed by the supplier, not yet in the bank.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CandidateQuestion {
    pub subtopic: String,
    pub difficulty: Difficulty,
    #[serde(default)]
    pub learning_style: Option<LearningStyle>,
    pub prompt: String,
    pub options: Vec<QuestionOption>,
    pub correct_option: String,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub time_limit_seconds: Option<u32>,
}

impl CandidateQuestion {
    pub fn into_new_question(self, area: Area) -> NewQuestion {
        NewQuestion {
            area,
            subtopic: self.subtopic,
            difficulty: self.difficulty,
            learning_style: self.learning_style,
            prompt: self.prompt,
            options: self.options,
            correct_option: self.correct_option,
            explanation: self.explanation,
            time_limit_seconds: self.time_limit_seconds,
            origin: Origin::Generated,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SupplierError {
    #[error("supplier unavailable: {0}")]
    Unavailable(String),

    #[error("supplier timed out")]
    TimedOut,
}

pub trait CandidateSupplier: Send + Sync {
    fn generate(
        &self,
        request: GenerateRequest,
    ) -> BoxFuture<'_, Result<Vec<CandidateQuestion>, SupplierError>>;
}

/// A supplier that never has anything; every selection is served from the bank.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSupplier;

impl CandidateSupplier for NoSupplier {
    fn generate(
        &self,
        _request: GenerateRequest,
    ) -> BoxFuture<'_, Result<Vec<CandidateQuestion>, SupplierError>> {
        future::ready(Ok(Vec::new())).boxed()
    }
}
