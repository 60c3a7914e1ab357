//! Session lifecycle: create with a frozen question list, close once with a
//! batch of answers.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use practice_utils::api::{CloseOutcome, CreatedSession, SessionSummary, SubmittedAnswer};
use practice_utils::text_cleanup::{normalize_option, subtopic_key};
use practice_utils::{Actor, Area, Question, QuestionId, QuestionView, Role, SessionKind};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use uuid::Uuid;

use crate::config::PassRule;
use crate::error::{EngineError, EngineResult};
use crate::store::{Store, parse_column, parse_optional_column};

#[derive(Clone, Debug)]
pub struct NewSession {
    pub user_id: Uuid,
    pub kind: SessionKind,
    pub area: Option<Area>,
    pub subtopic: Option<String>,
    pub level: Option<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: SessionKind,
    pub area: Option<Area>,
    pub subtopic: Option<String>,
    pub level: Option<u8>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_questions: u32,
}

impl SessionRecord {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            kind: self.kind,
            area: self.area,
            subtopic: self.subtopic.clone(),
            level: self.level,
            started_at: self.started_at,
            total_questions: self.total_questions,
        }
    }
}

/// One graded slot of a closed session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GradedDetail {
    pub order: u32,
    pub question_id: Option<QuestionId>,
    pub area: Option<Area>,
    pub chosen_option: Option<String>,
    pub correct_option: Option<String>,
    pub explanation: Option<String>,
    pub correct: bool,
}

#[derive(Clone, Debug)]
pub struct GradedSession {
    pub session: SessionRecord,
    pub outcome: CloseOutcome,
    pub details: Vec<GradedDetail>,
}

/// Persist a new session and its details in assigned order (orders `1..=n`).
pub fn persist_session(
    store: &Store,
    new: &NewSession,
    questions: &[Question],
    default_time_limit_secs: u32,
) -> EngineResult<CreatedSession> {
    let total_questions = u32::try_from(questions.len())
        .map_err(|_| EngineError::validation("too many questions for one session"))?;
    let record = SessionRecord {
        id: Uuid::new_v4(),
        user_id: new.user_id,
        kind: new.kind,
        area: new.area,
        subtopic: new.subtopic.clone(),
        level: new.level,
        started_at: Utc::now(),
        ended_at: None,
        total_questions,
    };

    let mut conn = store.connect()?;
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO sessions (id, user_id, kind, area, subtopic, subtopic_key, level,
             started_at, total_questions)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.id,
            record.user_id,
            record.kind.as_str(),
            record.area.map(|area| area.as_str()),
            record.subtopic,
            record.subtopic.as_deref().map(subtopic_key),
            record.level,
            record.started_at,
            record.total_questions,
        ],
    )?;

    let mut views = Vec::with_capacity(questions.len());
    {
        let mut insert = tx.prepare(
            "INSERT INTO session_details (session_id, position, question_id, time_limit_seconds)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (order, question) in (1u32..).zip(questions) {
            let limit = question
                .time_limit_seconds
                .unwrap_or(default_time_limit_secs);
            insert.execute(params![record.id, order, question.id, limit])?;
            views.push(QuestionView::new(order, question, limit));
        }
    }
    tx.commit()?;

    log::info!(
        "Created {} session {} for {} with {} questions",
        record.kind.as_str(),
        record.id,
        record.user_id,
        record.total_questions
    );

    Ok(CreatedSession {
        session: record.summary(),
        questions: views,
    })
}

/// Question ids assigned in the user's most recent session on the same area
/// and subtopic. Used as the exclusion set for the next selection.
pub fn recent_question_ids(
    conn: &Connection,
    user_id: Uuid,
    area: Area,
    subtopic: Option<&str>,
) -> EngineResult<HashSet<QuestionId>> {
    let mut stmt = conn.prepare(
        "SELECT question_id FROM session_details
         WHERE question_id IS NOT NULL AND session_id = (
             SELECT id FROM sessions
             WHERE user_id = ?1 AND area = ?2 AND subtopic_key IS ?3
             ORDER BY started_at DESC, rowid DESC
             LIMIT 1
         )",
    )?;
    let ids = stmt
        .query_map(
            params![user_id, area.as_str(), subtopic.map(subtopic_key)],
            |row| row.get(0),
        )?
        .collect::<Result<HashSet<QuestionId>, _>>()?;
    Ok(ids)
}

fn load_session(conn: &Connection, id: Uuid) -> EngineResult<Option<SessionRecord>> {
    let record = conn
        .query_row(
            "SELECT id, user_id, kind, area, subtopic, level, started_at, ended_at, total_questions
             FROM sessions WHERE id = ?1",
            params![id],
            |row| {
                Ok(SessionRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    kind: parse_column(row, 2)?,
                    area: parse_optional_column(row, 3)?,
                    subtopic: row.get(4)?,
                    level: row.get(5)?,
                    started_at: row.get(6)?,
                    ended_at: row.get(7)?,
                    total_questions: row.get(8)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

/// Sessions of another user look exactly like missing ones, except to admins.
fn visible_to(record: &SessionRecord, actor: &Actor) -> bool {
    record.user_id == actor.user_id || actor.role == Role::Admin
}

/// Correct iff answered within the limit (a missing time counts as over) and
/// the chosen option matches the stored one after trimming and case folding.
pub fn judge(correct_option: Option<&str>, time_limit_seconds: u32, answer: &SubmittedAnswer) -> bool {
    let Some(correct_option) = correct_option else {
        return false;
    };
    let on_time = answer
        .time_spent_seconds
        .is_some_and(|spent| spent <= time_limit_seconds);
    let matches = answer
        .chosen_option
        .as_deref()
        .is_some_and(|chosen| normalize_option(chosen) == normalize_option(correct_option));
    on_time && matches
}

pub fn percentage(correct: u32, total: u32) -> u8 {
    let total = total.max(1);
    (f64::from(correct) * 100.0 / f64::from(total)).round() as u8
}

struct StoredDetail {
    order: u32,
    question_id: Option<QuestionId>,
    time_limit_seconds: u32,
    correct_option: Option<String>,
    area: Option<Area>,
    explanation: Option<String>,
}

/// Grade `answers` against the session's details and finalize it.
///
/// The whole close runs in one IMMEDIATE transaction, so two concurrent closes
/// of the same session cannot both succeed.
pub fn close_session(
    store: &Store,
    actor: &Actor,
    kind: SessionKind,
    session_id: Uuid,
    answers: &[SubmittedAnswer],
    rule: PassRule,
) -> EngineResult<GradedSession> {
    close_session_with(store, actor, kind, session_id, answers, rule, |_, _, _| Ok(()))
}

/// Like [`close_session`], running `after_grading` inside the close
/// transaction. If it fails nothing is written and the session stays open.
pub fn close_session_with(
    store: &Store,
    actor: &Actor,
    kind: SessionKind,
    session_id: Uuid,
    answers: &[SubmittedAnswer],
    rule: PassRule,
    after_grading: impl FnOnce(&Connection, &SessionRecord, &CloseOutcome) -> EngineResult<()>,
) -> EngineResult<GradedSession> {
    let mut by_order = HashMap::with_capacity(answers.len());
    for answer in answers {
        if by_order.insert(answer.order, answer).is_some() {
            return Err(EngineError::validation(format!(
                "order {} is answered more than once",
                answer.order
            )));
        }
    }

    let mut conn = store.connect()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut session = load_session(&tx, session_id)?
        .filter(|record| record.kind == kind && visible_to(record, actor))
        .ok_or_else(|| EngineError::not_found("session", session_id))?;
    if session.ended_at.is_some() {
        return Err(EngineError::SessionClosed(session_id));
    }

    let stored = {
        let mut stmt = tx.prepare(
            "SELECT d.position, d.question_id, d.time_limit_seconds,
                    q.correct_option, q.area, q.explanation
             FROM session_details d LEFT JOIN questions q ON q.id = d.question_id
             WHERE d.session_id = ?1
             ORDER BY d.position",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok(StoredDetail {
                    order: row.get(0)?,
                    question_id: row.get(1)?,
                    time_limit_seconds: row.get(2)?,
                    correct_option: row.get(3)?,
                    area: parse_optional_column(row, 4)?,
                    explanation: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let unknown = by_order
        .keys()
        .filter(|order| !stored.iter().any(|detail| detail.order == **order))
        .count();
    if unknown > 0 {
        log::debug!("Ignoring {unknown} answers with unknown orders for session {session_id}");
    }

    let now = Utc::now();
    let mut details = Vec::with_capacity(stored.len());
    {
        let mut update = tx.prepare(
            "UPDATE session_details
             SET chosen_option = ?3, is_correct = ?4, time_spent_seconds = ?5, answered_at = ?6
             WHERE session_id = ?1 AND position = ?2",
        )?;
        for detail in stored {
            let answer = by_order.get(&detail.order).copied();
            let correct = answer.is_some_and(|answer| {
                judge(
                    detail.correct_option.as_deref(),
                    detail.time_limit_seconds,
                    answer,
                )
            });
            let chosen_option = answer.and_then(|answer| answer.chosen_option.clone());
            update.execute(params![
                session_id,
                detail.order,
                chosen_option,
                correct,
                answer.and_then(|answer| answer.time_spent_seconds),
                answer.map(|_| now),
            ])?;
            details.push(GradedDetail {
                order: detail.order,
                question_id: detail.question_id,
                area: detail.area,
                chosen_option,
                correct_option: detail.correct_option,
                explanation: detail.explanation,
                correct,
            });
        }
    }

    let correct_count = details.iter().filter(|detail| detail.correct).count() as u32;
    let outcome = CloseOutcome {
        passed: rule.passed(correct_count, session.total_questions),
        correct_count,
        percentage: percentage(correct_count, session.total_questions),
    };

    let closed = tx.execute(
        "UPDATE sessions
         SET ended_at = ?2, correct_count = ?3, percentage = ?4, passed = ?5
         WHERE id = ?1 AND ended_at IS NULL",
        params![
            session_id,
            now,
            outcome.correct_count,
            outcome.percentage,
            outcome.passed
        ],
    )?;
    if closed == 0 {
        return Err(EngineError::SessionClosed(session_id));
    }
    after_grading(&tx, &session, &outcome)?;
    tx.commit()?;
    session.ended_at = Some(now);

    log::info!(
        "Closed session {session_id}: {}/{} correct ({}%), passed={}",
        outcome.correct_count,
        session.total_questions,
        outcome.percentage,
        outcome.passed
    );

    Ok(GradedSession {
        session,
        outcome,
        details,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::test_support::seed;
    use crate::store::test_support::temp_store;

    fn answer(order: u32, chosen: &str, spent: Option<u32>) -> SubmittedAnswer {
        SubmittedAnswer {
            order,
            chosen_option: Some(chosen.to_string()),
            time_spent_seconds: spent,
        }
    }

    fn stop_for(store: &Store, user: Uuid, count: usize) -> CreatedSession {
        let conn = store.connect().unwrap();
        let questions = seed(&conn, Area::Math, "Álgebra", count);
        persist_session(
            store,
            &NewSession {
                user_id: user,
                kind: SessionKind::PracticeStop,
                area: Some(Area::Math),
                subtopic: Some("Álgebra".to_string()),
                level: Some(2),
            },
            &questions,
            60,
        )
        .unwrap()
    }

    #[test]
    fn test_judge_time_boundary() {
        assert!(judge(Some("B"), 30, &answer(1, "B", Some(30))));
        assert!(!judge(Some("B"), 30, &answer(1, "B", Some(31))));
        assert!(!judge(Some("B"), 30, &answer(1, "B", None)));
        assert!(judge(Some("B"), 30, &answer(1, "  b ", Some(0))));
        assert!(!judge(Some("B"), 30, &answer(1, "C", Some(5))));
        assert!(!judge(None, 30, &answer(1, "B", Some(5))));
    }

    #[test]
    fn test_percentage_rounds() {
        assert_eq!(percentage(0, 0), 0);
        assert_eq!(percentage(4, 5), 80);
        assert_eq!(percentage(2, 3), 67);
        assert_eq!(percentage(1, 3), 33);
        assert_eq!(percentage(25, 25), 100);
    }

    #[test]
    fn test_details_are_numbered_from_one() {
        let (_dir, store) = temp_store();
        let created = stop_for(&store, Uuid::new_v4(), 5);
        let orders = created.questions.iter().map(|q| q.order).collect::<Vec<_>>();
        assert_eq!(orders, vec![1, 2, 3, 4, 5]);
        assert_eq!(created.session.total_questions, 5);
        assert!(created.questions.iter().all(|q| q.time_limit_seconds == 30));
    }

    #[test]
    fn test_close_grades_and_rejects_second_close() {
        let (_dir, store) = temp_store();
        let user = Uuid::new_v4();
        let created = stop_for(&store, user, 5);
        let answers = vec![
            answer(1, "B", Some(10)),
            answer(2, "b", Some(30)),
            answer(3, "B", Some(31)),
            answer(4, "A", Some(5)),
            answer(9, "B", Some(5)),
        ];

        let graded = close_session(
            &store,
            &Actor::student(user),
            SessionKind::PracticeStop,
            created.session.id,
            &answers,
            PassRule::MinCorrect(4),
        )
        .unwrap();
        assert_eq!(graded.outcome.correct_count, 2);
        assert_eq!(graded.outcome.percentage, 40);
        assert!(!graded.outcome.passed);
        assert_eq!(graded.details.len(), 5);
        assert!(graded.session.ended_at.is_some());

        let again = close_session(
            &store,
            &Actor::student(user),
            SessionKind::PracticeStop,
            created.session.id,
            &answers,
            PassRule::MinCorrect(4),
        );
        assert!(matches!(again, Err(EngineError::SessionClosed(id)) if id == created.session.id));
    }

    #[test]
    fn test_close_is_order_independent() {
        let (_dir, store) = temp_store();
        let user = Uuid::new_v4();
        let first = stop_for(&store, user, 5);
        let second = stop_for(&store, user, 5);
        let mut answers = (1..=5)
            .map(|order| answer(order, if order % 2 == 0 { "B" } else { "D" }, Some(3)))
            .collect::<Vec<_>>();

        let forward = close_session(
            &store,
            &Actor::student(user),
            SessionKind::PracticeStop,
            first.session.id,
            &answers,
            PassRule::MinCorrect(4),
        )
        .unwrap();
        answers.reverse();
        let backward = close_session(
            &store,
            &Actor::student(user),
            SessionKind::PracticeStop,
            second.session.id,
            &answers,
            PassRule::MinCorrect(4),
        )
        .unwrap();
        assert_eq!(forward.outcome, backward.outcome);
        assert_eq!(forward.outcome.correct_count, 2);
    }

    #[test]
    fn test_duplicate_orders_are_rejected_before_writing() {
        let (_dir, store) = temp_store();
        let user = Uuid::new_v4();
        let created = stop_for(&store, user, 5);
        let result = close_session(
            &store,
            &Actor::student(user),
            SessionKind::PracticeStop,
            created.session.id,
            &[answer(1, "B", Some(1)), answer(1, "C", Some(1))],
            PassRule::MinCorrect(4),
        );
        assert!(matches!(result, Err(EngineError::Validation(_))));

        // Still open
        close_session(
            &store,
            &Actor::student(user),
            SessionKind::PracticeStop,
            created.session.id,
            &[],
            PassRule::MinCorrect(4),
        )
        .unwrap();
    }

    #[test]
    fn test_other_users_and_kinds_do_not_see_the_session() {
        let (_dir, store) = temp_store();
        let owner = Uuid::new_v4();
        let created = stop_for(&store, owner, 5);

        let stranger = close_session(
            &store,
            &Actor::student(Uuid::new_v4()),
            SessionKind::PracticeStop,
            created.session.id,
            &[],
            PassRule::MinCorrect(4),
        );
        assert!(matches!(stranger, Err(EngineError::NotFound { .. })));

        let wrong_kind = close_session(
            &store,
            &Actor::student(owner),
            SessionKind::Simulation,
            created.session.id,
            &[],
            PassRule::Percent(80),
        );
        assert!(matches!(wrong_kind, Err(EngineError::NotFound { .. })));

        let admin = Actor {
            user_id: Uuid::new_v4(),
            role: Role::Admin,
            institution: None,
        };
        close_session(
            &store,
            &admin,
            SessionKind::PracticeStop,
            created.session.id,
            &[],
            PassRule::MinCorrect(4),
        )
        .unwrap();
    }

    #[test]
    fn test_recent_question_ids_come_from_latest_matching_session() {
        let (_dir, store) = temp_store();
        let user = Uuid::new_v4();
        let _older = stop_for(&store, user, 2);
        let latest = stop_for(&store, user, 3);

        let conn = store.connect().unwrap();
        let ids = recent_question_ids(&conn, user, Area::Math, Some("ALGEBRA")).unwrap();
        let expected = latest.questions.iter().map(|q| q.id).collect::<HashSet<_>>();
        assert_eq!(ids, expected);

        let none = recent_question_ids(&conn, user, Area::Math, Some("Geometría")).unwrap();
        assert!(none.is_empty());
        let stranger = recent_question_ids(&conn, Uuid::new_v4(), Area::Math, Some("Álgebra")).unwrap();
        assert!(stranger.is_empty());
    }
}
