//! Adaptive practice: question selection, graded sessions and level/lives
//! progression for each student and area.

pub mod bank;
pub mod cascade;
pub mod config;
pub mod diagnostic;
pub mod error;
pub mod learning_style;
pub mod progress;
pub mod session;
pub mod store;
pub mod supplier;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use practice_utils::api::{
    CloseOutcome, CreatedSession, DiagnosticReport, LivesByArea, SubmittedAnswer, SyncReport,
    SyncRequest, UnlockedLevels,
};
use practice_utils::curriculum;
use practice_utils::{
    Actor, Area, Difficulty, LearningStyle, MAX_LEVEL, Question, QuestionId, SessionKind,
};
use uuid::Uuid;

pub use config::{ConfigError, EngineConfig, PassPolicy, PassRule};
pub use error::{EngineError, EngineResult};
pub use progress::{LevelInProgressOutcome, LevelProgress};
pub use store::Store;
pub use supplier::{CandidateQuestion, CandidateSupplier, GenerateRequest, NoSupplier, SupplierError};

use cascade::{Cascade, SelectionRequest};
use progress::Reconciler;
use session::{GradedSession, NewSession};

pub struct PracticeEngine {
    store: Store,
    supplier: Arc<dyn CandidateSupplier>,
    config: EngineConfig,
}

impl PracticeEngine {
    pub fn new(store: Store, supplier: Arc<dyn CandidateSupplier>, config: EngineConfig) -> Self {
        Self {
            store,
            supplier,
            config,
        }
    }

    /// Open (or create) the database at `path`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        supplier: Arc<dyn CandidateSupplier>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        let store = Store::open(path, config.busy_timeout)?;
        Ok(Self::new(store, supplier, config))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn cascade(&self) -> Cascade<'_> {
        Cascade::new(&self.store, &*self.supplier, self.config.supplier_timeout)
    }

    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(&self.store, self.config.write_attempts)
    }

    /// Style hint and the ids of the user's previous session on the same unit.
    fn selection_context(
        &self,
        user_id: Uuid,
        area: Area,
        subtopic: Option<&str>,
    ) -> EngineResult<(Option<LearningStyle>, HashSet<QuestionId>)> {
        let conn = self.store.connect()?;
        let style_hint = learning_style::learning_style(&conn, user_id)?;
        let exclude_ids = session::recent_question_ids(&conn, user_id, area, subtopic)?;
        Ok((style_hint, exclude_ids))
    }

    fn persist(&self, new: &NewSession, questions: &[Question]) -> EngineResult<CreatedSession> {
        session::persist_session(
            &self.store,
            new,
            questions,
            self.config.default_time_limit_secs,
        )
    }

    fn close(
        &self,
        actor: &Actor,
        kind: SessionKind,
        session_id: Uuid,
        answers: &[SubmittedAnswer],
    ) -> EngineResult<GradedSession> {
        session::close_session(
            &self.store,
            actor,
            kind,
            session_id,
            answers,
            self.config.pass_policy.rule_for(kind),
        )
    }

    pub async fn create_practice_stop(
        &self,
        actor: &Actor,
        area: Area,
        subtopic: &str,
        level: u8,
    ) -> EngineResult<CreatedSession> {
        if !(1..=MAX_LEVEL).contains(&level) {
            return Err(EngineError::validation(format!(
                "level {level} is outside 1..={MAX_LEVEL}"
            )));
        }
        let subtopic = subtopic.trim();
        if subtopic.is_empty() {
            return Err(EngineError::validation("subtopic is empty"));
        }

        let (style_hint, exclude_ids) =
            self.selection_context(actor.user_id, area, Some(subtopic))?;
        let questions = self
            .cascade()
            .select(&SelectionRequest {
                area,
                subtopics: vec![subtopic.to_string()],
                difficulty: Difficulty::for_level(level),
                style_hint,
                count: self.config.stop_size,
                exclude_ids,
                institution: actor.institution.clone(),
            })
            .await?;

        self.persist(
            &NewSession {
                user_id: actor.user_id,
                kind: SessionKind::PracticeStop,
                area: Some(area),
                subtopic: Some(subtopic.to_string()),
                level: Some(level),
            },
            &questions,
        )
    }

    /// Grade a stop. A passing or failing result is also recorded against the
    /// stop's level, in the same transaction as the close: if the progress
    /// write fails the session stays open and the close can be retried.
    pub fn close_practice_stop(
        &self,
        actor: &Actor,
        session_id: Uuid,
        answers: &[SubmittedAnswer],
    ) -> EngineResult<CloseOutcome> {
        let kind = SessionKind::PracticeStop;
        let graded = session::close_session_with(
            &self.store,
            actor,
            kind,
            session_id,
            answers,
            self.config.pass_policy.rule_for(kind),
            |conn, session, outcome| {
                if let (Some(area), Some(level)) = (session.area, session.level) {
                    progress::record_attempt_in(
                        conn,
                        session.user_id,
                        area,
                        level,
                        outcome.passed,
                        session_id,
                    )
                    .inspect_err(|e| {
                        log::warn!("Not closing session {session_id}, attempt not recorded: {e}")
                    })?;
                }
                Ok(())
            },
        )?;

        Ok(graded.outcome)
    }

    /// A full-area simulation. No subtopics means the area's whole curriculum.
    pub async fn create_simulation(
        &self,
        actor: &Actor,
        area: Area,
        subtopics: &[String],
    ) -> EngineResult<CreatedSession> {
        let subtopics = if subtopics.is_empty() {
            curriculum::subtopics(area)
                .iter()
                .map(|subtopic| subtopic.to_string())
                .collect::<Vec<_>>()
        } else {
            subtopics
                .iter()
                .map(|subtopic| subtopic.trim().to_string())
                .collect()
        };
        if subtopics.iter().any(String::is_empty) {
            return Err(EngineError::validation("empty subtopic in simulation request"));
        }

        let (style_hint, exclude_ids) = self.selection_context(actor.user_id, area, None)?;
        let questions = self
            .cascade()
            .select(&SelectionRequest {
                area,
                subtopics,
                difficulty: Difficulty::Medium,
                style_hint,
                count: self.config.simulation_size,
                exclude_ids,
                institution: actor.institution.clone(),
            })
            .await?;

        self.persist(
            &NewSession {
                user_id: actor.user_id,
                kind: SessionKind::Simulation,
                area: Some(area),
                subtopic: None,
                level: None,
            },
            &questions,
        )
    }

    pub fn close_simulation(
        &self,
        actor: &Actor,
        session_id: Uuid,
        answers: &[SubmittedAnswer],
    ) -> EngineResult<CloseOutcome> {
        Ok(self
            .close(actor, SessionKind::Simulation, session_id, answers)?
            .outcome)
    }

    /// Area-wide questions for every area, in the fixed area order.
    pub async fn create_diagnostic(&self, actor: &Actor) -> EngineResult<CreatedSession> {
        let style_hint = {
            let conn = self.store.connect()?;
            learning_style::learning_style(&conn, actor.user_id)?
        };

        let mut questions = Vec::with_capacity(Area::ALL.len() * self.config.diagnostic_per_area);
        for area in Area::ALL {
            let picked = self
                .cascade()
                .select(&SelectionRequest {
                    area,
                    subtopics: Vec::new(),
                    difficulty: Difficulty::Medium,
                    style_hint,
                    count: self.config.diagnostic_per_area,
                    exclude_ids: HashSet::new(),
                    institution: actor.institution.clone(),
                })
                .await?;
            questions.extend(picked);
        }

        self.persist(
            &NewSession {
                user_id: actor.user_id,
                kind: SessionKind::Diagnostic,
                area: None,
                subtopic: None,
                level: None,
            },
            &questions,
        )
    }

    pub fn close_diagnostic(
        &self,
        actor: &Actor,
        session_id: Uuid,
        answers: &[SubmittedAnswer],
    ) -> EngineResult<DiagnosticReport> {
        let graded = self.close(actor, SessionKind::Diagnostic, session_id, answers)?;
        Ok(diagnostic::report(graded))
    }

    /// Hard questions from anywhere in the area.
    pub async fn create_challenge(&self, actor: &Actor, area: Area) -> EngineResult<CreatedSession> {
        let (style_hint, exclude_ids) = self.selection_context(actor.user_id, area, None)?;
        let questions = self
            .cascade()
            .select(&SelectionRequest {
                area,
                subtopics: Vec::new(),
                difficulty: Difficulty::Hard,
                style_hint,
                count: self.config.challenge_size,
                exclude_ids,
                institution: actor.institution.clone(),
            })
            .await?;

        self.persist(
            &NewSession {
                user_id: actor.user_id,
                kind: SessionKind::Challenge,
                area: Some(area),
                subtopic: None,
                level: None,
            },
            &questions,
        )
    }

    pub fn close_challenge(
        &self,
        actor: &Actor,
        session_id: Uuid,
        answers: &[SubmittedAnswer],
    ) -> EngineResult<CloseOutcome> {
        Ok(self
            .close(actor, SessionKind::Challenge, session_id, answers)?
            .outcome)
    }

    pub fn get_unlocked_levels(&self, actor: &Actor) -> EngineResult<UnlockedLevels> {
        self.reconciler().unlocked_levels(actor.user_id)
    }

    pub fn get_lives(&self, actor: &Actor) -> EngineResult<LivesByArea> {
        self.reconciler().lives(actor.user_id)
    }

    pub fn report_sync(&self, actor: &Actor, request: &SyncRequest) -> EngineResult<SyncReport> {
        self.reconciler().sync_all(actor.user_id, request)
    }

    pub fn set_level_in_progress(
        &self,
        actor: &Actor,
        area: Area,
        level: u8,
    ) -> EngineResult<LevelInProgressOutcome> {
        self.reconciler()
            .set_level_in_progress(actor.user_id, area, level, "client")
    }

    pub fn set_lives(
        &self,
        actor: &Actor,
        area: Area,
        level: u8,
        lives: u8,
    ) -> EngineResult<LevelProgress> {
        self.reconciler()
            .set_lives(actor.user_id, area, level, lives, "client")
    }

    pub fn rebuild_progress(&self, actor: &Actor, area: Area) -> EngineResult<Vec<LevelProgress>> {
        self.reconciler()
            .rebuild_current_from_history(actor.user_id, area)
    }

    pub fn record_learning_style(&self, actor: &Actor, style: LearningStyle) -> EngineResult<()> {
        let conn = self.store.connect()?;
        learning_style::record_learning_style(&conn, actor.user_id, style)
    }
}
