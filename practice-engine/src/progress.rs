//! Per-(user, area, level) progress and the unlocked-level derivation.
//!
//! `level_progress` holds exactly one current row per key. Every write also
//! appends to `level_progress_history`, which can rebuild the current rows.
//!
//! Writes never trust an in-process lock. Each one is a single IMMEDIATE
//! transaction that reads the current row, decides, then either inserts
//! (`ON CONFLICT DO NOTHING`) or compare-and-swaps on `version`. A write that
//! touches nothing, or that hits `SQLITE_BUSY`, lost a race and is retried from
//! a fresh read.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use practice_utils::api::{LivesByArea, SyncReport, SyncRequest, UnlockedLevels};
use practice_utils::curriculum::subtopic_for_level;
use practice_utils::{Area, MAX_LEVEL, MAX_LIVES, ProgressState};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::store::{Store, is_contention, parse_column};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelProgress {
    pub user_id: Uuid,
    pub area: Area,
    pub level: u8,
    pub subtopic: String,
    pub state: ProgressState,
    pub attempts: u8,
    pub lives: u8,
    pub last_touched: DateTime<Utc>,
    pub session_id: Option<Uuid>,
    pub version: i64,
}

impl LevelProgress {
    pub fn is_locked(&self) -> bool {
        self.state == ProgressState::FailedLocked
    }

    fn fields(&self) -> Fields {
        Fields {
            state: self.state,
            attempts: self.attempts,
            lives: self.lives,
            session_id: self.session_id,
        }
    }
}

/// The mutable part of a row, as chosen by a write's decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Fields {
    state: ProgressState,
    attempts: u8,
    lives: u8,
    session_id: Option<Uuid>,
}

impl Fields {
    fn fresh(state: ProgressState) -> Self {
        Self {
            state,
            attempts: 0,
            lives: MAX_LIVES,
            session_id: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelInProgressOutcome {
    pub current: LevelProgress,
    /// Lower levels that were upgraded to passed by this call.
    pub cleared: Vec<u8>,
}

/// One row per level. A later row replaces an earlier one unless it was touched
/// strictly before it, so recency wins and ties go to creation order.
///
/// Returns the rows and how many were superseded.
pub fn current_by_level(
    rows: impl IntoIterator<Item = LevelProgress>,
) -> (BTreeMap<u8, LevelProgress>, usize) {
    let mut current = BTreeMap::<u8, LevelProgress>::new();
    let mut superseded = 0;
    for row in rows {
        match current.get(&row.level) {
            Some(existing) => {
                superseded += 1;
                if row.last_touched >= existing.last_touched {
                    current.insert(row.level, row);
                }
            }
            None => {
                current.insert(row.level, row);
            }
        }
    }
    (current, superseded)
}

/// The level a student should be working on, given one current row per level.
pub fn derive_unlocked_level(current: &BTreeMap<u8, LevelProgress>) -> u8 {
    let highest = |state: ProgressState| {
        current
            .values()
            .filter(|row| row.state == state)
            .map(|row| row.level)
            .max()
    };

    // A pending row only counts as reached once a level below it is passed.
    let reached = |row: &LevelProgress| {
        row.state != ProgressState::Pending
            || row.level == 1
            || current
                .range(..row.level)
                .any(|(_, lower)| lower.state == ProgressState::Passed)
    };

    let candidate = highest(ProgressState::InProgress)
        .or_else(|| highest(ProgressState::Passed).map(|level| level + 1))
        .or_else(|| {
            current
                .values()
                .filter(|row| !row.is_locked() && reached(row))
                .map(|row| row.level)
                .max()
        })
        .unwrap_or(1);

    let mut level = candidate.clamp(1, MAX_LEVEL);
    while level > 1 && current.get(&level).is_some_and(LevelProgress::is_locked) {
        level -= 1;
    }
    level
}

const PROGRESS_COLUMNS: &str =
    "user_id, area, level, subtopic, state, attempts, lives, last_touched, session_id";

fn progress_from_row(row: &Row<'_>, version: i64) -> rusqlite::Result<LevelProgress> {
    Ok(LevelProgress {
        user_id: row.get(0)?,
        area: parse_column(row, 1)?,
        level: row.get(2)?,
        subtopic: row.get(3)?,
        state: parse_column(row, 4)?,
        attempts: row.get(5)?,
        lives: row.get(6)?,
        last_touched: row.get(7)?,
        session_id: row.get(8)?,
        version,
    })
}

fn load_row(
    conn: &Connection,
    user_id: Uuid,
    area: Area,
    level: u8,
) -> EngineResult<Option<LevelProgress>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {PROGRESS_COLUMNS}, version FROM level_progress
                 WHERE user_id = ?1 AND area = ?2 AND level = ?3"
            ),
            params![user_id, area.as_str(), level],
            |row| progress_from_row(row, row.get(9)?),
        )
        .optional()?;
    Ok(row)
}

pub fn load_area(conn: &Connection, user_id: Uuid, area: Area) -> EngineResult<Vec<LevelProgress>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROGRESS_COLUMNS}, version FROM level_progress
         WHERE user_id = ?1 AND area = ?2
         ORDER BY level"
    ))?;
    let rows = stmt
        .query_map(params![user_id, area.as_str()], |row| {
            progress_from_row(row, row.get(9)?)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// History rows in append order. Their `version` is the history id.
pub fn load_history(
    conn: &Connection,
    user_id: Uuid,
    area: Area,
) -> EngineResult<Vec<LevelProgress>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, area, level, subtopic, state, attempts, lives, touched_at, session_id, id
         FROM level_progress_history
         WHERE user_id = ?1 AND area = ?2
         ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![user_id, area.as_str()], |row| {
            progress_from_row(row, row.get(9)?)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn append_history(conn: &Connection, row: &LevelProgress, source: &str) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO level_progress_history
             (user_id, area, level, subtopic, state, attempts, lives, touched_at, session_id, source)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            row.user_id,
            row.area.as_str(),
            row.level,
            row.subtopic,
            row.state.as_str(),
            row.attempts,
            row.lives,
            row.last_touched,
            row.session_id,
            source,
        ],
    )?;
    Ok(())
}

enum Attempt {
    Written(LevelProgress),
    Declined,
    Lost,
}

/// Read-decide-write for one key on `conn`, which must already hold the write lock.
fn apply(
    conn: &Connection,
    user_id: Uuid,
    area: Area,
    level: u8,
    source: &str,
    decide: &impl Fn(Option<&LevelProgress>) -> Option<Fields>,
) -> EngineResult<Attempt> {
    let subtopic = subtopic_for_level(area, level)
        .ok_or_else(|| EngineError::validation(format!("level {level} has no subtopic")))?;

    let current = load_row(conn, user_id, area, level)?;
    let Some(fields) = decide(current.as_ref()) else {
        return Ok(Attempt::Declined);
    };

    let next = LevelProgress {
        user_id,
        area,
        level,
        subtopic: subtopic.to_string(),
        state: fields.state,
        attempts: fields.attempts,
        lives: fields.lives,
        last_touched: Utc::now(),
        session_id: fields.session_id,
        version: current.as_ref().map_or(0, |row| row.version + 1),
    };

    let affected = match &current {
        None => conn.execute(
            "INSERT INTO level_progress
                 (user_id, area, level, subtopic, state, attempts, lives, last_touched, session_id, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)
             ON CONFLICT (user_id, area, level) DO NOTHING",
            params![
                user_id,
                area.as_str(),
                level,
                next.subtopic,
                next.state.as_str(),
                next.attempts,
                next.lives,
                next.last_touched,
                next.session_id,
            ],
        )?,
        Some(existing) => conn.execute(
            "UPDATE level_progress
             SET subtopic = ?4, state = ?5, attempts = ?6, lives = ?7, last_touched = ?8,
                 session_id = ?9, version = version + 1
             WHERE user_id = ?1 AND area = ?2 AND level = ?3 AND version = ?10",
            params![
                user_id,
                area.as_str(),
                level,
                next.subtopic,
                next.state.as_str(),
                next.attempts,
                next.lives,
                next.last_touched,
                next.session_id,
                existing.version,
            ],
        )?,
    };
    if affected == 0 {
        return Ok(Attempt::Lost);
    }

    append_history(conn, &next, source)?;
    Ok(Attempt::Written(next))
}

/// How a graded stop changes its level: pass -> passed; fail -> one life
/// spent, locked at zero. Locked levels are left as they are.
fn attempt_fields(current: Option<&LevelProgress>, passed: bool, session_id: Uuid) -> Fields {
    let base = current.map_or(Fields::fresh(ProgressState::InProgress), LevelProgress::fields);
    match base.state {
        ProgressState::FailedLocked => base,
        ProgressState::Passed => Fields {
            session_id: Some(session_id),
            ..base
        },
        ProgressState::Pending | ProgressState::InProgress if passed => Fields {
            state: ProgressState::Passed,
            session_id: Some(session_id),
            ..base
        },
        ProgressState::Pending | ProgressState::InProgress => {
            let attempts = (base.attempts + 1).min(MAX_LIVES);
            let lives = MAX_LIVES - attempts;
            Fields {
                state: if lives == 0 {
                    ProgressState::FailedLocked
                } else {
                    ProgressState::InProgress
                },
                attempts,
                lives,
                session_id: Some(session_id),
            }
        }
    }
}

fn log_attempt(row: &LevelProgress, passed: bool) {
    log::info!(
        "Recorded {} attempt on {} level {} for {}: {} ({} lives)",
        if passed { "passing" } else { "failing" },
        row.area,
        row.level,
        row.user_id,
        row.state.as_str(),
        row.lives
    );
}

/// Apply a graded session to `level` inside the caller's transaction, so the
/// attempt commits or rolls back together with the session close.
pub(crate) fn record_attempt_in(
    conn: &Connection,
    user_id: Uuid,
    area: Area,
    level: u8,
    passed: bool,
    session_id: Uuid,
) -> EngineResult<LevelProgress> {
    check_level(level, 1)?;

    let decide = |current: Option<&LevelProgress>| Some(attempt_fields(current, passed, session_id));
    match apply(conn, user_id, area, level, "session", &decide)? {
        Attempt::Written(row) => {
            log_attempt(&row, passed);
            Ok(row)
        }
        Attempt::Lost => Err(EngineError::WriteConflict {
            user: user_id,
            area,
            level,
            attempts: 1,
        }),
        Attempt::Declined => Err(EngineError::Corrupt(format!(
            "attempt on {area} level {level} was declined"
        ))),
    }
}

fn check_level(level: u8, lowest: u8) -> EngineResult<()> {
    if !(lowest..=MAX_LEVEL).contains(&level) {
        return Err(EngineError::validation(format!(
            "level {level} is outside {lowest}..={MAX_LEVEL}"
        )));
    }
    Ok(())
}

fn check_lives(lives: u8) -> EngineResult<()> {
    if lives > MAX_LIVES {
        return Err(EngineError::validation(format!(
            "lives {lives} is outside 0..={MAX_LIVES}"
        )));
    }
    Ok(())
}

fn in_area(area: Area) -> impl Fn(EngineError) -> EngineError {
    move |e| match e {
        EngineError::Validation(message) => EngineError::Validation(format!("{area}: {message}")),
        other => other,
    }
}

/// Applies progress writes with the retry budget from the engine config.
#[derive(Clone, Debug)]
pub struct Reconciler<'a> {
    store: &'a Store,
    write_attempts: u32,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a Store, write_attempts: u32) -> Self {
        Self {
            store,
            write_attempts: write_attempts.max(1),
        }
    }

    /// Read-decide-write for one key. `decide` sees the current row (if any) and
    /// returns the fields to store, or `None` to leave the row alone.
    ///
    /// Returns the written row, or `None` when `decide` declined.
    fn upsert(
        &self,
        user_id: Uuid,
        area: Area,
        level: u8,
        source: &str,
        decide: impl Fn(Option<&LevelProgress>) -> Option<Fields>,
    ) -> EngineResult<Option<LevelProgress>> {
        for attempt in 1..=self.write_attempts {
            match self.try_upsert(user_id, area, level, source, &decide) {
                Ok(Attempt::Written(row)) => return Ok(Some(row)),
                Ok(Attempt::Declined) => return Ok(None),
                Ok(Attempt::Lost) => {
                    log::debug!("Lost race on {area} level {level} for {user_id} (attempt {attempt})");
                }
                Err(EngineError::Storage(e)) if is_contention(&e) => {
                    log::debug!(
                        "Contention on {area} level {level} for {user_id} (attempt {attempt}): {e}"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        log::warn!(
            "Giving up on {area} level {level} for {user_id} after {} attempts",
            self.write_attempts
        );
        Err(EngineError::WriteConflict {
            user: user_id,
            area,
            level,
            attempts: self.write_attempts,
        })
    }

    fn try_upsert(
        &self,
        user_id: Uuid,
        area: Area,
        level: u8,
        source: &str,
        decide: &impl Fn(Option<&LevelProgress>) -> Option<Fields>,
    ) -> EngineResult<Attempt> {
        let mut conn = self.store.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let attempt = apply(&tx, user_id, area, level, source, decide)?;
        if let Attempt::Written(_) = &attempt {
            tx.commit()?;
        }
        Ok(attempt)
    }

    /// Like [`Reconciler::upsert`] for decisions that always write.
    fn write(
        &self,
        user_id: Uuid,
        area: Area,
        level: u8,
        source: &str,
        decide: impl Fn(Option<&LevelProgress>) -> Fields,
    ) -> EngineResult<LevelProgress> {
        self.upsert(user_id, area, level, source, |current| {
            Some(decide(current))
        })?
        .ok_or_else(|| EngineError::Corrupt(format!("write to {area} level {level} was declined")))
    }

    /// Enter `level` (creating it with full lives) and clear every level below it.
    ///
    /// An existing row keeps its attempts and lives. Failed-locked rows stay
    /// locked; only `last_touched` moves.
    pub fn set_level_in_progress(
        &self,
        user_id: Uuid,
        area: Area,
        level: u8,
        source: &str,
    ) -> EngineResult<LevelInProgressOutcome> {
        check_level(level, 1)?;

        let current = self.write(user_id, area, level, source, |current| match current {
            None => Fields::fresh(ProgressState::InProgress),
            Some(row) if row.is_locked() => row.fields(),
            Some(row) => Fields {
                state: ProgressState::InProgress,
                ..row.fields()
            },
        })?;
        let cleared = self.mark_levels_cleared(user_id, area, level, source)?;

        Ok(LevelInProgressOutcome { current, cleared })
    }

    /// Upgrade every level below `below` that is not already passed.
    ///
    /// Returns the levels that were written.
    pub fn mark_levels_cleared(
        &self,
        user_id: Uuid,
        area: Area,
        below: u8,
        source: &str,
    ) -> EngineResult<Vec<u8>> {
        let mut cleared = Vec::new();
        for level in 1..below.min(MAX_LEVEL + 1) {
            let written = self.upsert(user_id, area, level, source, |current| match current {
                Some(row) if row.state == ProgressState::Passed => None,
                Some(row) => Some(Fields {
                    state: ProgressState::Passed,
                    ..row.fields()
                }),
                None => Some(Fields::fresh(ProgressState::Passed)),
            })?;
            if written.is_some() {
                cleared.push(level);
            }
        }
        if !cleared.is_empty() {
            log::info!("Cleared {area} levels {cleared:?} for {user_id}");
        }
        Ok(cleared)
    }

    /// Store a client-reported lives count for `level` (2..=6).
    ///
    /// Zero lives locks the level, whatever its state. Otherwise the state is
    /// kept: a lives report never unlocks a level, so a missing row is created
    /// pending, and a locked level is never revived.
    pub fn set_lives(
        &self,
        user_id: Uuid,
        area: Area,
        level: u8,
        lives: u8,
        source: &str,
    ) -> EngineResult<LevelProgress> {
        check_level(level, 2)?;
        check_lives(lives)?;

        self.write(user_id, area, level, source, |current| match current {
            Some(row) if row.is_locked() => row.fields(),
            _ => Fields {
                state: if lives == 0 {
                    ProgressState::FailedLocked
                } else {
                    current.map_or(ProgressState::Pending, |row| row.state)
                },
                attempts: MAX_LIVES - lives,
                lives,
                session_id: current.and_then(|row| row.session_id),
            },
        })
    }

    /// Apply the result of a graded session to `level`.
    pub fn record_attempt(
        &self,
        user_id: Uuid,
        area: Area,
        level: u8,
        passed: bool,
        session_id: Uuid,
    ) -> EngineResult<LevelProgress> {
        check_level(level, 1)?;

        let row = self.write(user_id, area, level, "session", |current| {
            attempt_fields(current, passed, session_id)
        })?;
        log_attempt(&row, passed);
        Ok(row)
    }

    pub fn unlocked_level(&self, user_id: Uuid, area: Area) -> EngineResult<u8> {
        let conn = self.store.connect()?;
        let (current, _) = current_by_level(load_area(&conn, user_id, area)?);
        Ok(derive_unlocked_level(&current))
    }

    pub fn unlocked_levels(&self, user_id: Uuid) -> EngineResult<UnlockedLevels> {
        let conn = self.store.connect()?;
        let mut levels = UnlockedLevels::new();
        for area in Area::ALL {
            let (current, _) = current_by_level(load_area(&conn, user_id, area)?);
            levels.insert(area, derive_unlocked_level(&current));
        }
        Ok(levels)
    }

    /// Lives for every area and level; untouched levels have full lives.
    pub fn lives(&self, user_id: Uuid) -> EngineResult<LivesByArea> {
        let conn = self.store.connect()?;
        let mut lives = LivesByArea::new();
        for area in Area::ALL {
            let (current, _) = current_by_level(load_area(&conn, user_id, area)?);
            let by_level = (1..=MAX_LEVEL)
                .map(|level| {
                    let count = current.get(&level).map_or(MAX_LIVES, |row| row.lives);
                    (level, count)
                })
                .collect();
            lives.insert(area, by_level);
        }
        Ok(lives)
    }

    /// Reconcile an offline client's report. The whole payload is validated
    /// before anything is written; then, per area, the level is entered before
    /// lives are applied in level order.
    pub fn sync_all(&self, user_id: Uuid, request: &SyncRequest) -> EngineResult<SyncReport> {
        for (area, level) in &request.levels {
            check_level(*level, 1).map_err(in_area(*area))?;
        }
        for (area, lives) in &request.lives {
            for (level, count) in lives {
                check_level(*level, 2)
                    .and_then(|_| check_lives(*count))
                    .map_err(in_area(*area))?;
            }
        }

        let areas = request
            .levels
            .keys()
            .chain(request.lives.keys())
            .copied()
            .collect::<BTreeSet<_>>();

        let mut report = SyncReport::default();
        for area in areas {
            if let Some(level) = request.levels.get(&area) {
                self.set_level_in_progress(user_id, area, *level, "sync")?;
                report.levels_applied += 1;
            }
            for (level, lives) in request.lives.get(&area).into_iter().flatten() {
                self.set_lives(user_id, area, *level, *lives, "sync")?;
                report.lives_applied += 1;
            }
        }

        log::info!(
            "Synced {user_id}: {} levels, {} lives",
            report.levels_applied,
            report.lives_applied
        );
        Ok(report)
    }

    /// Re-derive the current rows of an area from its history.
    pub fn rebuild_current_from_history(
        &self,
        user_id: Uuid,
        area: Area,
    ) -> EngineResult<Vec<LevelProgress>> {
        let mut conn = self.store.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let history = load_history(&tx, user_id, area)?;
        let out_of_order = history
            .windows(2)
            .filter(|pair| pair[1].level == pair[0].level && pair[1].last_touched < pair[0].last_touched)
            .count();
        if out_of_order > 0 {
            log::warn!("{out_of_order} out-of-order history rows for {user_id} in {area}");
        }
        let (current, superseded) = current_by_level(history);
        log::debug!("Rebuilding {area} for {user_id}: {superseded} superseded history rows");

        let mut rebuilt = Vec::with_capacity(current.len());
        for mut row in current.into_values() {
            let version: i64 = tx.query_row(
                "INSERT INTO level_progress
                     (user_id, area, level, subtopic, state, attempts, lives, last_touched, session_id, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)
                 ON CONFLICT (user_id, area, level) DO UPDATE SET
                     subtopic = excluded.subtopic,
                     state = excluded.state,
                     attempts = excluded.attempts,
                     lives = excluded.lives,
                     last_touched = excluded.last_touched,
                     session_id = excluded.session_id,
                     version = level_progress.version + 1
                 RETURNING version",
                params![
                    row.user_id,
                    row.area.as_str(),
                    row.level,
                    row.subtopic,
                    row.state.as_str(),
                    row.attempts,
                    row.lives,
                    row.last_touched,
                    row.session_id,
                ],
                |r| r.get(0),
            )?;
            row.version = version;
            rebuilt.push(row);
        }
        tx.commit()?;

        Ok(rebuilt)
    }
}
