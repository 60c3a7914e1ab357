//! Static per-area curriculum. Level `n` in 1..=5 practices the `n`th subtopic;
//! level 6 is the area capstone.

use crate::{Area, MAX_LEVEL};

/// Name of the capstone unlocked after the five curriculum levels.
pub const CAPSTONE_SUBTOPIC: &str = "Simulacro de área";

const MATH: [&str; 5] = [
    "Aritmética",
    "Álgebra",
    "Geometría",
    "Estadística",
    "Probabilidad",
];

const LANGUAGE: [&str; 5] = [
    "Comprensión lectora",
    "Gramática",
    "Ortografía",
    "Vocabulario",
    "Producción textual",
];

const SCIENCE: [&str; 5] = [
    "Biología",
    "Química",
    "Física",
    "Ecología",
    "Método científico",
];

const SOCIAL_STUDIES: [&str; 5] = [
    "Historia",
    "Geografía",
    "Constitución política",
    "Economía",
    "Ciudadanía",
];

const ENGLISH: [&str; 5] = [
    "Vocabulary",
    "Grammar",
    "Reading comprehension",
    "Verb tenses",
    "Communicative situations",
];

/// Ordered curriculum subtopics for an area.
pub fn subtopics(area: Area) -> &'static [&'static str; 5] {
    match area {
        Area::Math => &MATH,
        Area::Language => &LANGUAGE,
        Area::Science => &SCIENCE,
        Area::SocialStudies => &SOCIAL_STUDIES,
        Area::English => &ENGLISH,
    }
}

/// Subtopic practiced at `level`, or `None` outside 1..=6.
pub fn subtopic_for_level(area: Area, level: u8) -> Option<&'static str> {
    match level {
        1..=5 => Some(subtopics(area)[usize::from(level - 1)]),
        MAX_LEVEL => Some(CAPSTONE_SUBTOPIC),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtopic_for_level() {
        assert_eq!(subtopic_for_level(Area::Math, 1), Some("Aritmética"));
        assert_eq!(subtopic_for_level(Area::Math, 5), Some("Probabilidad"));
        assert_eq!(subtopic_for_level(Area::English, 6), Some(CAPSTONE_SUBTOPIC));
        assert_eq!(subtopic_for_level(Area::Math, 0), None);
        assert_eq!(subtopic_for_level(Area::Math, 7), None);
    }

    #[test]
    fn test_every_area_has_five_distinct_subtopics() {
        for area in Area::ALL {
            let list = subtopics(area);
            let unique = list.iter().collect::<std::collections::BTreeSet<_>>();
            assert_eq!(unique.len(), 5, "{area} has duplicate subtopics");
        }
    }
}
