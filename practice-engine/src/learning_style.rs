use chrono::Utc;
use practice_utils::LearningStyle;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::store::parse_column;

/// The user's last recorded learning style, used as a hint for the supplier.
pub fn learning_style(conn: &Connection, user_id: Uuid) -> EngineResult<Option<LearningStyle>> {
    let style = conn
        .query_row(
            "SELECT style FROM learning_styles WHERE user_id = ?1",
            params![user_id],
            |row| parse_column(row, 0),
        )
        .optional()?;
    Ok(style)
}

pub fn record_learning_style(
    conn: &Connection,
    user_id: Uuid,
    style: LearningStyle,
) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO learning_styles (user_id, style, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT (user_id) DO UPDATE SET style = excluded.style, updated_at = excluded.updated_at",
        params![user_id, style.as_str(), Utc::now()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;

    #[test]
    fn test_latest_style_wins() {
        let (_dir, store) = temp_store();
        let conn = store.connect().unwrap();
        let user = Uuid::new_v4();
        assert_eq!(learning_style(&conn, user).unwrap(), None);

        record_learning_style(&conn, user, LearningStyle::Visual).unwrap();
        record_learning_style(&conn, user, LearningStyle::Kinesthetic).unwrap();
        assert_eq!(
            learning_style(&conn, user).unwrap(),
            Some(LearningStyle::Kinesthetic)
        );
    }
}
