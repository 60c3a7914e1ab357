//! Diagnostic reports: per-area scores over the fixed area order.

use std::collections::BTreeMap;

use practice_utils::Area;
use practice_utils::api::{AreaScore, DiagnosticReport, QuestionResult};

use crate::session::{GradedDetail, GradedSession, percentage};

pub fn per_area_scores(details: &[GradedDetail]) -> BTreeMap<Area, AreaScore> {
    let mut tallies = BTreeMap::<Area, (u32, u32)>::new();
    for detail in details {
        let Some(area) = detail.area else {
            continue;
        };
        let (correct, total) = tallies.entry(area).or_default();
        *total += 1;
        if detail.correct {
            *correct += 1;
        }
    }

    tallies
        .into_iter()
        .map(|(area, (correct, total))| {
            (
                area,
                AreaScore {
                    correct,
                    total,
                    percentage: percentage(correct, total),
                },
            )
        })
        .collect()
}

pub fn report(graded: GradedSession) -> DiagnosticReport {
    let per_area_score = per_area_scores(&graded.details);
    let per_question = graded
        .details
        .into_iter()
        .map(|detail| QuestionResult {
            order: detail.order,
            question_id: detail.question_id,
            area: detail.area,
            chosen_option: detail.chosen_option,
            correct_option: detail.correct_option,
            correct: detail.correct,
            explanation: detail.explanation,
        })
        .collect();

    DiagnosticReport {
        session_id: graded.session.id,
        per_area_score,
        overall_score: graded.outcome.percentage,
        passed: graded.outcome.passed,
        per_question,
    }
}
