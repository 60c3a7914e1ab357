//! Question bank queries.

use chrono::Utc;
use practice_utils::text_cleanup::{normalize_option, subtopic_key};
use practice_utils::{Area, Difficulty, LearningStyle, Question, QuestionId, QuestionOption};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::cascade::Selection;
use crate::error::{EngineError, EngineResult};
use crate::store::{parse_column, parse_optional_column};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Bank,
    Generated,
}

impl Origin {
    fn as_str(&self) -> &'static str {
        match self {
            Origin::Bank => "bank",
            Origin::Generated => "generated",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewQuestion {
    pub area: Area,
    pub subtopic: String,
    pub difficulty: Difficulty,
    pub learning_style: Option<LearningStyle>,
    pub prompt: String,
    pub options: Vec<QuestionOption>,
    pub correct_option: String,
    pub explanation: Option<String>,
    pub time_limit_seconds: Option<u32>,
    pub origin: Origin,
}

impl NewQuestion {
    /// The correct option has to be one of the offered labels.
    pub fn validate(&self) -> EngineResult<()> {
        if self.prompt.trim().is_empty() {
            return Err(EngineError::validation("question prompt is empty"));
        }
        if self.options.len() < 2 {
            return Err(EngineError::validation("a question needs at least two options"));
        }
        let correct = normalize_option(&self.correct_option);
        if !self
            .options
            .iter()
            .any(|option| normalize_option(&option.label) == correct)
        {
            return Err(EngineError::validation(format!(
                "correct option {:?} is not among the offered labels",
                self.correct_option
            )));
        }
        Ok(())
    }
}

const QUESTION_COLUMNS: &str = "id, area, subtopic, difficulty, learning_style, prompt, options, \
     correct_option, explanation, time_limit_seconds";

fn question_from_row(row: &Row<'_>) -> rusqlite::Result<Question> {
    let options: String = row.get(6)?;
    let options: Vec<QuestionOption> = serde_json::from_str(&options).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Question {
        id: row.get(0)?,
        area: parse_column(row, 1)?,
        subtopic: row.get(2)?,
        difficulty: parse_column(row, 3)?,
        learning_style: parse_optional_column(row, 4)?,
        prompt: row.get(5)?,
        options,
        correct_option: row.get(7)?,
        explanation: row.get(8)?,
        time_limit_seconds: row.get(9)?,
    })
}

pub fn insert_question(conn: &Connection, question: &NewQuestion) -> EngineResult<Question> {
    question.validate()?;
    let options = serde_json::to_string(&question.options)
        .map_err(|e| EngineError::Corrupt(format!("unserializable options: {e}")))?;

    conn.execute(
        "INSERT INTO questions (area, subtopic, subtopic_key, difficulty, learning_style, prompt,
             options, correct_option, explanation, time_limit_seconds, origin, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            question.area.as_str(),
            question.subtopic,
            subtopic_key(&question.subtopic),
            question.difficulty.as_str(),
            question.learning_style.map(|style| style.as_str()),
            question.prompt,
            options,
            question.correct_option.trim(),
            question.explanation,
            question.time_limit_seconds,
            question.origin.as_str(),
            Utc::now(),
        ],
    )?;

    Ok(Question {
        id: conn.last_insert_rowid(),
        area: question.area,
        subtopic: question.subtopic.clone(),
        difficulty: question.difficulty,
        learning_style: question.learning_style,
        prompt: question.prompt.clone(),
        options: question.options.clone(),
        correct_option: question.correct_option.trim().to_string(),
        explanation: question.explanation.clone(),
        time_limit_seconds: question.time_limit_seconds,
    })
}

pub fn get_question(conn: &Connection, id: QuestionId) -> EngineResult<Option<Question>> {
    let question = conn
        .query_row(
            &format!("SELECT {QUESTION_COLUMNS} FROM questions WHERE id = ?1"),
            params![id],
            question_from_row,
        )
        .optional()?;
    Ok(question)
}

/// Draw random questions from `area` into `selection`, optionally restricted to
/// subtopics containing `subtopic` (accent and case insensitive). Takes at most
/// `cap` questions and never more than the selection still needs.
///
/// Returns how many questions were accepted.
pub(crate) fn draw(
    conn: &Connection,
    area: Area,
    subtopic: Option<&str>,
    cap: usize,
    selection: &mut Selection,
) -> EngineResult<usize> {
    let key = subtopic.map(subtopic_key).filter(|key| !key.is_empty());
    if subtopic.is_some() && key.is_none() {
        return Ok(0);
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {QUESTION_COLUMNS} FROM questions
         WHERE area = ?1 AND (?2 IS NULL OR instr(subtopic_key, ?2) > 0)
         ORDER BY RANDOM()"
    ))?;
    let mut rows = stmt.query(params![area.as_str(), key])?;

    let mut accepted = 0;
    while accepted < cap && !selection.is_full() {
        let Some(row) = rows.next()? else {
            break;
        };
        if selection.offer(question_from_row(row)?) {
            accepted += 1;
        }
    }

    Ok(accepted)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::store::test_support::temp_store;
    use std::collections::HashSet;

    #[test]
    fn test_insert_and_get_roundtrip() {
        let (_dir, store) = temp_store();
        let conn = store.connect().unwrap();
        let inserted = insert_question(&conn, &sample_question(Area::Math, "Álgebra", 0)).unwrap();
        let fetched = get_question(&conn, inserted.id).unwrap().unwrap();
        assert_eq!(fetched, inserted);
        assert!(get_question(&conn, inserted.id + 100).unwrap().is_none());
    }

    #[test]
    fn test_insert_rejects_unknown_correct_option() {
        let (_dir, store) = temp_store();
        let conn = store.connect().unwrap();
        let mut question = sample_question(Area::Math, "Álgebra", 0);
        question.correct_option = "Z".to_string();
        assert!(matches!(
            insert_question(&conn, &question),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_draw_matches_subtopic_without_accents() {
        let (_dir, store) = temp_store();
        let conn = store.connect().unwrap();
        seed(&conn, Area::Math, "Geometría", 3);
        seed(&conn, Area::Math, "Estadística", 3);

        let mut selection = Selection::new(10, HashSet::new());
        let accepted = draw(&conn, Area::Math, Some("geometria"), 10, &mut selection).unwrap();
        assert_eq!(accepted, 3);
        assert!(
            selection
                .questions()
                .iter()
                .all(|q| q.subtopic == "Geometría")
        );
    }

    #[test]
    fn test_draw_respects_cap_exclusions_and_area() {
        let (_dir, store) = temp_store();
        let conn = store.connect().unwrap();
        let math = seed(&conn, Area::Math, "Álgebra", 6);
        seed(&conn, Area::Science, "Física", 6);

        let excluded = math.iter().take(2).map(|q| q.id).collect::<HashSet<_>>();
        let mut selection = Selection::new(10, excluded.clone());
        let accepted = draw(&conn, Area::Math, None, 3, &mut selection).unwrap();
        assert_eq!(accepted, 3);

        let accepted = draw(&conn, Area::Math, None, 10, &mut selection).unwrap();
        assert_eq!(accepted, 1, "only four unexcluded math questions exist");
        assert!(selection.questions().iter().all(|q| q.area == Area::Math));
        assert!(
            selection
                .questions()
                .iter()
                .all(|q| !excluded.contains(&q.id))
        );
    }
}
