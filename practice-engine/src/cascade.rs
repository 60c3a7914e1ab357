//! Question selection cascade.
//!
//! Tiers, strict to loose. Each one only runs while the pool is still short:
//!
//! 1. the generative supplier, filtered by area, subtopics, difficulty and style;
//! 2. the bank, same area, fuzzy subtopic match;
//! 3. the bank, any subtopic in the area;
//! 4. only if the pool is still *empty*: the supplier again without the
//!    subtopic filter, then a terminal random area-only bank draw that may
//!    repeat excluded questions.
//!
//! The pool is an explicit [`Selection`] accumulator passed through each tier.

use std::collections::HashSet;
use std::time::Duration;

use practice_utils::text_cleanup::subtopic_key;
use practice_utils::{Area, Difficulty, LearningStyle, Question, QuestionId};
use rand::seq::SliceRandom;

use crate::bank;
use crate::error::{EngineError, EngineResult};
use crate::store::Store;
use crate::supplier::{CandidateQuestion, CandidateSupplier, GenerateRequest, SupplierError};

/// Questions chosen so far, in the order they were accepted.
#[derive(Debug)]
pub struct Selection {
    wanted: usize,
    excluded: HashSet<QuestionId>,
    chosen: Vec<Question>,
    chosen_ids: HashSet<QuestionId>,
}

impl Selection {
    pub fn new(wanted: usize, excluded: HashSet<QuestionId>) -> Self {
        Self {
            wanted,
            excluded,
            chosen: Vec::with_capacity(wanted),
            chosen_ids: HashSet::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.wanted.saturating_sub(self.chosen.len())
    }

    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    pub fn is_empty(&self) -> bool {
        self.chosen.is_empty()
    }

    /// Ids already chosen or excluded; anything in here is refused by [`Selection::offer`].
    pub fn unavailable_ids(&self) -> Vec<QuestionId> {
        let mut ids = self
            .excluded
            .iter()
            .chain(self.chosen_ids.iter())
            .copied()
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Accept `question` unless the selection is full, it is excluded, or it was already chosen.
    pub fn offer(&mut self, question: Question) -> bool {
        if self.is_full()
            || self.excluded.contains(&question.id)
            || !self.chosen_ids.insert(question.id)
        {
            return false;
        }
        self.chosen.push(question);
        true
    }

    /// Stop refusing excluded ids. Returns how many were excluded.
    pub fn release_exclusions(&mut self) -> usize {
        let released = self.excluded.len();
        self.excluded.clear();
        released
    }

    pub fn questions(&self) -> &[Question] {
        &self.chosen
    }

    pub fn into_questions(self) -> Vec<Question> {
        self.chosen
    }
}

#[derive(Clone, Debug)]
pub struct SelectionRequest {
    pub area: Area,
    /// Empty for area-wide selections (diagnostics, challenges).
    pub subtopics: Vec<String>,
    pub difficulty: Difficulty,
    pub style_hint: Option<LearningStyle>,
    pub count: usize,
    pub exclude_ids: HashSet<QuestionId>,
    pub institution: Option<String>,
}

pub struct Cascade<'a> {
    store: &'a Store,
    supplier: &'a dyn CandidateSupplier,
    supplier_timeout: Duration,
}

impl<'a> Cascade<'a> {
    pub fn new(
        store: &'a Store,
        supplier: &'a dyn CandidateSupplier,
        supplier_timeout: Duration,
    ) -> Self {
        Self {
            store,
            supplier,
            supplier_timeout,
        }
    }

    /// Up to `request.count` distinct questions. None of them is in
    /// `request.exclude_ids` unless only the terminal tier could fill the pool.
    ///
    /// Fails only when every tier, including the terminal bank draw, came up empty.
    pub async fn select(&self, request: &SelectionRequest) -> EngineResult<Vec<Question>> {
        let mut selection = Selection::new(request.count, request.exclude_ids.clone());
        if request.count == 0 {
            return Ok(Vec::new());
        }

        let candidates = self
            .ask_supplier(request, request.subtopics.clone(), &selection)
            .await;
        self.accept_candidates(request.area, candidates, &mut selection)?;

        if !selection.is_full() && !request.subtopics.is_empty() {
            self.draw_subtopics(request, &mut selection)?;
        }

        if !selection.is_full() {
            let conn = self.store.connect()?;
            bank::draw(&conn, request.area, None, usize::MAX, &mut selection)?;
        }

        if selection.is_empty() {
            log::warn!(
                "Cascade found nothing for {} {:?}; retrying supplier area-wide",
                request.area,
                request.subtopics
            );
            let candidates = self.ask_supplier(request, Vec::new(), &selection).await;
            self.accept_candidates(request.area, candidates, &mut selection)?;

            // Terminal tier: repeats beat an empty session.
            if selection.is_empty() {
                let released = selection.release_exclusions();
                if released > 0 {
                    log::info!(
                        "Drawing {} questions again, ignoring {released} recent ones",
                        request.area
                    );
                }
                let conn = self.store.connect()?;
                bank::draw(&conn, request.area, None, usize::MAX, &mut selection)?;
            }
        }

        if selection.is_empty() {
            log::error!("Question content exhausted for {}", request.area);
            return Err(EngineError::ContentExhausted { area: request.area });
        }

        if !selection.is_full() {
            log::info!(
                "Cascade for {} returned {} of {} questions",
                request.area,
                selection.questions().len(),
                request.count
            );
        }

        Ok(selection.into_questions())
    }

    /// Never fails: supplier errors and timeouts come back as an empty list.
    async fn ask_supplier(
        &self,
        request: &SelectionRequest,
        subtopics: Vec<String>,
        selection: &Selection,
    ) -> Vec<CandidateQuestion> {
        let generate = GenerateRequest {
            area: request.area,
            subtopics,
            difficulty: request.difficulty,
            style_hint: request.style_hint,
            count: selection.remaining(),
            institution: request.institution.clone(),
            exclude_ids: selection.unavailable_ids(),
        };

        let result = tokio::time::timeout(self.supplier_timeout, self.supplier.generate(generate))
            .await
            .unwrap_or(Err(SupplierError::TimedOut));

        match result {
            Ok(candidates) => candidates,
            Err(e) => {
                log::warn!("Supplier gave no candidates for {}: {e}", request.area);
                Vec::new()
            }
        }
    }

    /// Persist acceptable candidates into the bank (grading reads answers from
    /// there) and offer them to the selection.
    fn accept_candidates(
        &self,
        area: Area,
        mut candidates: Vec<CandidateQuestion>,
        selection: &mut Selection,
    ) -> EngineResult<()> {
        if candidates.is_empty() || selection.is_full() {
            return Ok(());
        }
        candidates.shuffle(&mut rand::rng());

        let mut conn = self.store.connect()?;
        let tx = conn.transaction()?;
        let mut prompts = HashSet::new();
        for candidate in candidates {
            if selection.is_full() {
                break;
            }
            if !prompts.insert(subtopic_key(&candidate.prompt)) {
                continue;
            }
            match bank::insert_question(&tx, &candidate.into_new_question(area)) {
                Ok(question) => {
                    selection.offer(question);
                }
                Err(EngineError::Validation(reason)) => {
                    log::warn!("Dropping malformed supplier candidate: {reason}");
                }
                Err(e) => return Err(e),
            }
        }
        tx.commit()?;

        Ok(())
    }

    /// Tier 2. The need is spread evenly over the requested subtopics first, then
    /// any listed subtopic may fill what is left.
    fn draw_subtopics(
        &self,
        request: &SelectionRequest,
        selection: &mut Selection,
    ) -> EngineResult<()> {
        let conn = self.store.connect()?;
        let share = selection.remaining().div_ceil(request.subtopics.len());
        for subtopic in &request.subtopics {
            bank::draw(&conn, request.area, Some(subtopic.as_str()), share, selection)?;
        }
        if request.subtopics.len() > 1 {
            for subtopic in &request.subtopics {
                if selection.is_full() {
                    break;
                }
                bank::draw(
                    &conn,
                    request.area,
                    Some(subtopic.as_str()),
                    usize::MAX,
                    selection,
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use futures::future::{BoxFuture, FutureExt};
    use practice_utils::QuestionOption;

    use super::*;

    type Respond =
        Box<dyn Fn(&GenerateRequest) -> Result<Vec<CandidateQuestion>, SupplierError> + Send + Sync>;

    /// Answers with whatever `respond` returns and records every request.
    pub struct ScriptedSupplier {
        pub requests: Mutex<Vec<GenerateRequest>>,
        respond: Respond,
    }

    impl ScriptedSupplier {
        pub fn new(
            respond: impl Fn(&GenerateRequest) -> Result<Vec<CandidateQuestion>, SupplierError>
            + Send
            + Sync
            + 'static,
        ) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            }
        }

        pub fn requests(&self) -> Vec<GenerateRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl CandidateSupplier for ScriptedSupplier {
        fn generate(
            &self,
            request: GenerateRequest,
        ) -> BoxFuture<'_, Result<Vec<CandidateQuestion>, SupplierError>> {
            let response = (self.respond)(&request);
            self.requests.lock().unwrap().push(request);
            futures::future::ready(response).boxed()
        }
    }

    /// Never answers in time.
    pub struct StalledSupplier;

    impl CandidateSupplier for StalledSupplier {
        fn generate(
            &self,
            _request: GenerateRequest,
        ) -> BoxFuture<'_, Result<Vec<CandidateQuestion>, SupplierError>> {
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, SupplierError>(Vec::new())
            }
            .boxed()
        }
    }

    pub fn candidate(subtopic: &str, n: usize) -> CandidateQuestion {
        CandidateQuestion {
            subtopic: subtopic.to_string(),
            difficulty: Difficulty::Easy,
            learning_style: None,
            prompt: format!("generated {subtopic} #{n}"),
            options: ["A", "B", "C"]
                .into_iter()
                .map(|label| QuestionOption {
                    label: label.to_string(),
                    text: label.to_lowercase(),
                })
                .collect(),
            correct_option: "A".to_string(),
            explanation: None,
            time_limit_seconds: Some(45),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::bank::test_support::seed;
    use crate::store::test_support::temp_store;
    use crate::supplier::NoSupplier;

    fn request(area: Area, subtopic: &str, count: usize) -> SelectionRequest {
        SelectionRequest {
            area,
            subtopics: vec![subtopic.to_string()],
            difficulty: Difficulty::Easy,
            style_hint: None,
            count,
            exclude_ids: HashSet::new(),
            institution: None,
        }
    }

    fn assert_distinct(questions: &[Question]) {
        let ids = questions.iter().map(|q| q.id).collect::<HashSet<_>>();
        assert_eq!(ids.len(), questions.len(), "duplicate question ids");
    }

    #[test]
    fn test_selection_refuses_duplicates_excluded_and_overflow() {
        let (_dir, store) = temp_store();
        let conn = store.connect().unwrap();
        let questions = seed(&conn, Area::Math, "Álgebra", 4);

        let mut selection = Selection::new(2, HashSet::from([questions[0].id]));
        assert!(!selection.offer(questions[0].clone()));
        assert!(selection.offer(questions[1].clone()));
        assert!(!selection.offer(questions[1].clone()));
        assert!(selection.offer(questions[2].clone()));
        assert!(!selection.offer(questions[3].clone()));
        assert!(selection.is_full());
        assert_eq!(
            selection.unavailable_ids(),
            vec![questions[0].id, questions[1].id, questions[2].id]
        );
    }

    #[tokio::test]
    async fn test_supplier_fills_the_pool_and_candidates_land_in_the_bank() {
        let (_dir, store) = temp_store();
        let supplier = ScriptedSupplier::new(|request| {
            Ok((0..request.count)
                .map(|n| candidate(&request.subtopics[0], n))
                .collect())
        });
        let cascade = Cascade::new(&store, &supplier, Duration::from_secs(1));

        let questions = cascade
            .select(&request(Area::Math, "Geometría", 5))
            .await
            .unwrap();
        assert_eq!(questions.len(), 5);
        assert_distinct(&questions);

        let conn = store.connect().unwrap();
        for question in &questions {
            let stored = bank::get_question(&conn, question.id).unwrap().unwrap();
            assert_eq!(stored.correct_option, "A");
        }
        assert_eq!(supplier.requests().len(), 1);
        assert_eq!(supplier.requests()[0].difficulty, Difficulty::Easy);
    }

    #[tokio::test]
    async fn test_failing_supplier_falls_back_to_subtopic_then_area() {
        let (_dir, store) = temp_store();
        let conn = store.connect().unwrap();
        let geometry = seed(&conn, Area::Math, "Geometría", 3);
        seed(&conn, Area::Math, "Álgebra", 5);
        seed(&conn, Area::Science, "Física", 5);

        let supplier =
            ScriptedSupplier::new(|_| Err(SupplierError::Unavailable("quota".to_string())));
        let cascade = Cascade::new(&store, &supplier, Duration::from_secs(1));

        let questions = cascade
            .select(&request(Area::Math, "GEOMETRIA", 5))
            .await
            .unwrap();
        assert_eq!(questions.len(), 5);
        assert_distinct(&questions);
        assert!(questions.iter().all(|q| q.area == Area::Math));

        // Exact-subtopic matches come first
        let geometry_ids = geometry.iter().map(|q| q.id).collect::<HashSet<_>>();
        assert!(questions[..3].iter().all(|q| geometry_ids.contains(&q.id)));
    }

    #[tokio::test]
    async fn test_stalled_supplier_times_out_into_the_bank() {
        let (_dir, store) = temp_store();
        let conn = store.connect().unwrap();
        seed(&conn, Area::English, "Grammar", 5);

        let cascade = Cascade::new(&store, &StalledSupplier, Duration::from_millis(50));
        let questions = cascade
            .select(&request(Area::English, "Grammar", 5))
            .await
            .unwrap();
        assert_eq!(questions.len(), 5);
    }

    #[tokio::test]
    async fn test_short_bank_returns_fewer_questions() {
        let (_dir, store) = temp_store();
        let conn = store.connect().unwrap();
        seed(&conn, Area::Science, "Química", 2);

        let cascade = Cascade::new(&store, &NoSupplier, Duration::from_secs(1));
        let questions = cascade
            .select(&request(Area::Science, "Química", 5))
            .await
            .unwrap();
        assert_eq!(questions.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_pool_retries_supplier_without_subtopic() {
        let (_dir, store) = temp_store();
        let supplier = ScriptedSupplier::new(|request| {
            if request.subtopics.is_empty() {
                Ok(vec![candidate("Historia", 0), candidate("Historia", 1)])
            } else {
                Ok(Vec::new())
            }
        });
        let cascade = Cascade::new(&store, &supplier, Duration::from_secs(1));

        let questions = cascade
            .select(&request(Area::SocialStudies, "Economía", 5))
            .await
            .unwrap();
        assert_eq!(questions.len(), 2);

        let requests = supplier.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].subtopics, vec!["Economía".to_string()]);
        assert!(requests[1].subtopics.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_content_is_an_error() {
        let (_dir, store) = temp_store();
        let cascade = Cascade::new(&store, &NoSupplier, Duration::from_secs(1));
        let result = cascade.select(&request(Area::Language, "Gramática", 5)).await;
        assert!(matches!(
            result,
            Err(EngineError::ContentExhausted {
                area: Area::Language
            })
        ));
    }

    #[tokio::test]
    async fn test_terminal_tier_repeats_excluded_questions() {
        let (_dir, store) = temp_store();
        let conn = store.connect().unwrap();
        let questions = seed(&conn, Area::Science, "Biología", 3);
        let excluded = questions.iter().map(|q| q.id).collect::<HashSet<_>>();

        let cascade = Cascade::new(&store, &NoSupplier, Duration::from_secs(1));
        let mut req = request(Area::Science, "Biología", 5);
        req.exclude_ids = excluded.clone();
        let chosen = cascade.select(&req).await.unwrap();
        assert_eq!(chosen.len(), 3);
        assert_distinct(&chosen);
        assert_eq!(chosen.iter().map(|q| q.id).collect::<HashSet<_>>(), excluded);
    }

    #[tokio::test]
    async fn test_never_returns_excluded_or_duplicate_ids() {
        let (_dir, store) = temp_store();
        let conn = store.connect().unwrap();
        let algebra = seed(&conn, Area::Math, "Álgebra", 8);
        seed(&conn, Area::Math, "Aritmética", 8);
        let excluded = algebra.iter().step_by(2).map(|q| q.id).collect::<HashSet<_>>();

        let cascade = Cascade::new(&store, &NoSupplier, Duration::from_secs(1));
        for count in [1, 3, 5, 12, 30] {
            let mut req = request(Area::Math, "Álgebra", count);
            req.exclude_ids = excluded.clone();
            let questions = cascade.select(&req).await.unwrap();
            assert!(questions.len() <= count);
            assert_distinct(&questions);
            assert!(questions.iter().all(|q| !excluded.contains(&q.id)));
        }
    }

    #[tokio::test]
    async fn test_malformed_candidates_are_dropped() {
        let (_dir, store) = temp_store();
        let conn = store.connect().unwrap();
        seed(&conn, Area::Math, "Álgebra", 5);

        let supplier = ScriptedSupplier::new(|_| {
            let mut bad = candidate("Álgebra", 0);
            bad.correct_option = "Z".to_string();
            Ok(vec![bad, candidate("Álgebra", 1)])
        });
        let cascade = Cascade::new(&store, &supplier, Duration::from_secs(1));
        let questions = cascade
            .select(&request(Area::Math, "Álgebra", 5))
            .await
            .unwrap();
        assert_eq!(questions.len(), 5);
        assert_eq!(
            questions
                .iter()
                .filter(|q| q.prompt.starts_with("generated"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_multiple_subtopics_are_spread() {
        let (_dir, store) = temp_store();
        let conn = store.connect().unwrap();
        for subtopic in ["Aritmética", "Álgebra", "Geometría"] {
            seed(&conn, Area::Math, subtopic, 10);
        }
        let cascade = Cascade::new(&store, &NoSupplier, Duration::from_secs(1));
        let mut req = request(Area::Math, "Aritmética", 6);
        req.subtopics = vec![
            "Aritmética".to_string(),
            "Álgebra".to_string(),
            "Geometría".to_string(),
        ];
        let questions = cascade.select(&req).await.unwrap();
        assert_eq!(questions.len(), 6);
        for subtopic in ["Aritmética", "Álgebra", "Geometría"] {
            assert_eq!(
                questions.iter().filter(|q| q.subtopic == subtopic).count(),
                2
            );
        }
    }
}
