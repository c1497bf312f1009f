#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension};
use time::{OffsetDateTime, UtcOffset};
use training_results_core::{
    comparison_to_previous, now_utc, parse_iso_date, NewTest, NewTestResult, ResultFilter,
    ResultUnit, StatsTestResult, StatsUpdate, TestPatch, TestRecord, TestResultPatch,
    TestResultRecord, TestType, TrainingError,
};

const MIGRATION_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS tests (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  description TEXT,
  test_type TEXT NOT NULL CHECK (
    test_type IN (
      'strength',
      'speed',
      'endurance',
      'agility',
      'technique',
      'power',
      'reaction',
      'coordination'
    )
  ),
  unit TEXT NOT NULL CHECK (
    unit IN ('kg', 'reps', 'sec', 'min', 'cm', 'm', 'km/h', 'score', 'percent')
  ),
  instructions TEXT,
  equipment_json TEXT NOT NULL DEFAULT '[]',
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  created_by INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS test_results (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  test_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL CHECK (user_id >= 1),
  team_id INTEGER CHECK (team_id IS NULL OR team_id >= 1),
  test_date TEXT NOT NULL,
  result REAL NOT NULL,
  unit TEXT NOT NULL CHECK (
    unit IN ('kg', 'reps', 'sec', 'min', 'cm', 'm', 'km/h', 'score', 'percent')
  ),
  test_type TEXT NOT NULL CHECK (
    test_type IN (
      'strength',
      'speed',
      'endurance',
      'agility',
      'technique',
      'power',
      'reaction',
      'coordination'
    )
  ),
  notes TEXT,
  comparison_to_previous REAL,
  created_by INTEGER NOT NULL,
  updated_by INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (test_id) REFERENCES tests(id)
);

CREATE INDEX IF NOT EXISTS idx_test_results_user_test
  ON test_results(user_id, test_id, test_date, created_at);
CREATE INDEX IF NOT EXISTS idx_test_results_team_test
  ON test_results(team_id, test_id);
";

const RESULT_COLUMNS: &str = "r.id, r.test_id, r.user_id, r.team_id, r.test_date, r.result, \
     r.unit, r.test_type, r.notes, r.comparison_to_previous, \
     r.created_by, r.updated_by, r.created_at, r.updated_at";

/// Ordering shared by the prior-result lookup and the per-user latest pick:
/// newest test date first, then newest insertion. The trailing `id` term
/// breaks ties between rows created within one timestamp tick.
const RECENCY_ORDER: &str = "r.test_date DESC, r.created_at DESC, r.id DESC";

/// Outcome of a catalog delete. A test referenced by results is deactivated
/// instead of removed so existing rows keep a valid foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestDeletion {
    Removed,
    Deactivated,
}

pub struct SqliteResultStore {
    conn: Connection,
}

impl SqliteResultStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply test-result schema")?;

        let now = now_timestamp()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![MIGRATION_VERSION, now],
            )
            .context("failed to register schema migration")?;

        Ok(())
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Inserts a result and derives `comparison_to_previous` against the
    /// subject's most recent prior result for the same test, inside one
    /// transaction so the lookup and the insert observe the same state.
    pub fn create_result(
        &mut self,
        input: &NewTestResult,
        created_by: i64,
    ) -> Result<TestResultRecord> {
        input.validate().map_err(anyhow::Error::new)?;

        let now = now_timestamp()?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start create transaction")?;

        let previous = latest_result_value(&tx, input.user_id, input.test_id)?;
        let comparison = comparison_to_previous(previous, input.result);

        let insert = tx.execute(
            "INSERT INTO test_results(
                test_id, user_id, team_id, test_date, result, unit, test_type,
                notes, comparison_to_previous, created_by, updated_by, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                input.test_id,
                input.user_id,
                input.team_id,
                input.test_date,
                input.result,
                input.unit.as_str(),
                input.test_type.as_str(),
                input.notes,
                comparison,
                created_by,
                created_by,
                now,
                now,
            ],
        );
        if let Err(err) = insert {
            if is_constraint_violation(&err) {
                return Err(anyhow::Error::new(TrainingError::Conflict(
                    "referenced test does not exist".to_string(),
                )));
            }
            return Err(anyhow::Error::new(err).context("failed to insert test result"));
        }

        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit create transaction")?;

        Ok(TestResultRecord {
            id,
            test_id: input.test_id,
            user_id: input.user_id,
            team_id: input.team_id,
            test_date: input.test_date.clone(),
            result: input.result,
            unit: input.unit,
            test_type: input.test_type,
            notes: input.notes.clone(),
            comparison_to_previous: comparison,
            created_by,
            updated_by: created_by,
            created_at: now.clone(),
            updated_at: now,
            test_name: None,
        })
    }

    /// Applies a partial update. `None` fields stay untouched. The change
    /// percentage is recomputed only when the patch carries a different
    /// `result` value; the recency lookup runs against committed rows and
    /// therefore still sees the row being updated.
    pub fn update_result(
        &mut self,
        id: i64,
        patch: &TestResultPatch,
        updated_by: i64,
    ) -> Result<TestResultRecord> {
        patch.validate().map_err(anyhow::Error::new)?;
        if patch.is_empty() {
            return Err(anyhow::Error::new(TrainingError::Validation(
                "update payload MUST contain at least one field".to_string(),
            )));
        }

        let now = now_timestamp()?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start update transaction")?;

        let existing = load_result(&tx, id)?.ok_or_else(|| {
            anyhow::Error::new(TrainingError::NotFound(format!(
                "test result {id} not found"
            )))
        })?;

        let mut assignments: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(test_date) = &patch.test_date {
            push_assignment(
                &mut assignments,
                &mut values,
                "test_date",
                Value::Text(test_date.clone()),
            );
        }
        if let Some(result) = patch.result {
            push_assignment(&mut assignments, &mut values, "result", Value::Real(result));
        }
        if let Some(unit) = patch.unit {
            push_assignment(
                &mut assignments,
                &mut values,
                "unit",
                Value::Text(unit.as_str().to_string()),
            );
        }
        if let Some(test_type) = patch.test_type {
            push_assignment(
                &mut assignments,
                &mut values,
                "test_type",
                Value::Text(test_type.as_str().to_string()),
            );
        }
        if let Some(notes) = &patch.notes {
            push_assignment(
                &mut assignments,
                &mut values,
                "notes",
                Value::Text(notes.clone()),
            );
        }
        if let Some(team_id) = patch.team_id {
            push_assignment(
                &mut assignments,
                &mut values,
                "team_id",
                Value::Integer(team_id),
            );
        }

        if let Some(new_result) = patch.result {
            if new_result != existing.result {
                let previous = latest_result_value(&tx, existing.user_id, existing.test_id)?;
                let comparison = comparison_to_previous(previous, new_result);
                push_assignment(
                    &mut assignments,
                    &mut values,
                    "comparison_to_previous",
                    comparison.map_or(Value::Null, Value::Real),
                );
            }
        }

        push_assignment(
            &mut assignments,
            &mut values,
            "updated_by",
            Value::Integer(updated_by),
        );
        push_assignment(
            &mut assignments,
            &mut values,
            "updated_at",
            Value::Text(now),
        );

        values.push(Value::Integer(id));
        let sql = format!(
            "UPDATE test_results SET {} WHERE id = ?{}",
            assignments.join(", "),
            values.len()
        );
        tx.execute(&sql, params_from_iter(values))
            .context("failed to update test result")?;

        let updated = load_result(&tx, id)?.ok_or_else(|| {
            anyhow::Error::new(TrainingError::Server(format!(
                "test result {id} disappeared during update"
            )))
        })?;
        tx.commit().context("failed to commit update transaction")?;

        Ok(updated)
    }

    pub fn delete_result(&mut self, id: i64) -> Result<TestResultRecord> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start delete transaction")?;

        let existing = load_result(&tx, id)?.ok_or_else(|| {
            anyhow::Error::new(TrainingError::NotFound(format!(
                "test result {id} not found"
            )))
        })?;

        tx.execute("DELETE FROM test_results WHERE id = ?1", params![id])
            .context("failed to delete test result")?;
        tx.commit().context("failed to commit delete transaction")?;

        Ok(existing)
    }

    pub fn get_result(&self, id: i64) -> Result<TestResultRecord> {
        let sql = format!(
            "SELECT {RESULT_COLUMNS}, t.name
             FROM test_results r
             JOIN tests t ON t.id = r.test_id
             WHERE r.id = ?1"
        );

        self.conn
            .query_row(&sql, params![id], named_result_from_row)
            .optional()
            .context("failed to load test result")?
            .ok_or_else(|| {
                anyhow::Error::new(TrainingError::NotFound(format!(
                    "test result {id} not found"
                )))
            })
    }

    pub fn list_results(&self, filter: &ResultFilter) -> Result<Vec<TestResultRecord>> {
        filter.validate().map_err(anyhow::Error::new)?;

        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(user_id) = filter.user_id {
            values.push(Value::Integer(user_id));
            clauses.push(format!("r.user_id = ?{}", values.len()));
        }
        if let Some(team_id) = filter.team_id {
            values.push(Value::Integer(team_id));
            clauses.push(format!("r.team_id = ?{}", values.len()));
        }
        if let Some(test_id) = filter.test_id {
            values.push(Value::Integer(test_id));
            clauses.push(format!("r.test_id = ?{}", values.len()));
        }
        if let Some(test_type) = filter.test_type {
            values.push(Value::Text(test_type.as_str().to_string()));
            clauses.push(format!("r.test_type = ?{}", values.len()));
        }
        if let Some(start_date) = &filter.start_date {
            values.push(Value::Text(start_date.clone()));
            clauses.push(format!("r.test_date >= ?{}", values.len()));
        }
        if let Some(end_date) = &filter.end_date {
            values.push(Value::Text(end_date.clone()));
            clauses.push(format!("r.test_date <= ?{}", values.len()));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {RESULT_COLUMNS}, t.name
             FROM test_results r
             JOIN tests t ON t.id = r.test_id
             {where_clause}
             ORDER BY {RECENCY_ORDER}"
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), named_result_from_row)?;
        collect_rows(rows)
    }

    /// First `limit` in-range results of one user on one test, oldest test
    /// date first.
    pub fn user_history(
        &self,
        user_id: i64,
        test_id: i64,
        start_date: Option<&str>,
        end_date: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TestResultRecord>> {
        let mut clauses = vec!["r.user_id = ?1".to_string(), "r.test_id = ?2".to_string()];
        let mut values: Vec<Value> = vec![Value::Integer(user_id), Value::Integer(test_id)];

        if let Some(start_date) = start_date {
            parse_iso_date(start_date).map_err(anyhow::Error::new)?;
            values.push(Value::Text(start_date.to_string()));
            clauses.push(format!("r.test_date >= ?{}", values.len()));
        }
        if let Some(end_date) = end_date {
            parse_iso_date(end_date).map_err(anyhow::Error::new)?;
            values.push(Value::Text(end_date.to_string()));
            clauses.push(format!("r.test_date <= ?{}", values.len()));
        }

        values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        let sql = format!(
            "SELECT {RESULT_COLUMNS}, t.name
             FROM test_results r
             JOIN tests t ON t.id = r.test_id
             WHERE {}
             ORDER BY r.test_date ASC, r.created_at ASC, r.id ASC
             LIMIT ?{}",
            clauses.join(" AND "),
            values.len()
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), named_result_from_row)?;
        collect_rows(rows)
    }

    /// One row per team member: the member's latest result, or with `as_of`
    /// the result whose test date is nearest that day. Rows come back in
    /// descending result order.
    pub fn team_statistics(
        &self,
        team_id: i64,
        test_id: i64,
        as_of: Option<&str>,
    ) -> Result<Vec<TestResultRecord>> {
        if let Some(as_of) = as_of {
            parse_iso_date(as_of).map_err(anyhow::Error::new)?;
        }

        let window_order = if as_of.is_some() {
            format!("ABS(julianday(r.test_date) - julianday(?3)) ASC, {RECENCY_ORDER}")
        } else {
            RECENCY_ORDER.to_string()
        };
        let sql = format!(
            "WITH ranked AS (
                SELECT {RESULT_COLUMNS}, t.name AS test_name,
                       ROW_NUMBER() OVER (
                           PARTITION BY r.user_id
                           ORDER BY {window_order}
                       ) AS recency_rank
                FROM test_results r
                JOIN tests t ON t.id = r.test_id
                WHERE r.team_id = ?1 AND r.test_id = ?2
             )
             SELECT * FROM ranked
             WHERE recency_rank = 1
             ORDER BY result DESC, user_id ASC"
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = match as_of {
            Some(as_of) => stmt.query_map(params![team_id, test_id, as_of], named_result_from_row)?,
            None => stmt.query_map(params![team_id, test_id], named_result_from_row)?,
        };
        collect_rows(rows)
    }

    /// Profile-facing projection of one stored result, re-read at sync time
    /// so a queued push reflects any edit that landed before it drained.
    pub fn sync_snapshot(&self, id: i64) -> Result<(i64, StatsUpdate)> {
        let record = self.get_result(id)?;
        let update = StatsUpdate {
            test_result: StatsTestResult {
                test_type: record.test_type,
                date: record.test_date,
                value: record.result,
                unit: record.unit,
                change: record.comparison_to_previous,
            },
        };
        Ok((record.user_id, update))
    }

    pub fn create_test(&mut self, input: &NewTest, created_by: i64) -> Result<TestRecord> {
        input.validate().map_err(anyhow::Error::new)?;

        let now = now_timestamp()?;
        let equipment_json = serde_json::to_string(&input.equipment)
            .context("failed to serialize equipment list")?;

        let insert = self.conn.execute(
            "INSERT INTO tests(
                name, description, test_type, unit, instructions,
                equipment_json, is_active, created_by, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?9)",
            params![
                input.name,
                input.description,
                input.test_type.as_str(),
                input.unit.as_str(),
                input.instructions,
                equipment_json,
                created_by,
                now,
                now,
            ],
        );
        if let Err(err) = insert {
            if is_constraint_violation(&err) {
                return Err(anyhow::Error::new(TrainingError::Conflict(format!(
                    "a test named '{}' already exists",
                    input.name
                ))));
            }
            return Err(anyhow::Error::new(err).context("failed to insert test"));
        }

        let id = self.conn.last_insert_rowid();
        Ok(TestRecord {
            id,
            name: input.name.clone(),
            description: input.description.clone(),
            test_type: input.test_type,
            unit: input.unit,
            instructions: input.instructions.clone(),
            equipment: input.equipment.clone(),
            is_active: true,
            created_by,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get_test(&self, id: i64) -> Result<TestRecord> {
        self.conn
            .query_row(
                "SELECT id, name, description, test_type, unit, instructions,
                        equipment_json, is_active, created_by, created_at, updated_at
                 FROM tests WHERE id = ?1",
                params![id],
                test_from_row,
            )
            .optional()
            .context("failed to load test")?
            .ok_or_else(|| {
                anyhow::Error::new(TrainingError::NotFound(format!("test {id} not found")))
            })
    }

    pub fn list_tests(
        &self,
        test_type: Option<TestType>,
        include_inactive: bool,
    ) -> Result<Vec<TestRecord>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if !include_inactive {
            clauses.push("is_active = 1".to_string());
        }
        if let Some(test_type) = test_type {
            values.push(Value::Text(test_type.as_str().to_string()));
            clauses.push(format!("test_type = ?{}", values.len()));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT id, name, description, test_type, unit, instructions,
                    equipment_json, is_active, created_by, created_at, updated_at
             FROM tests {where_clause} ORDER BY name ASC"
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), test_from_row)?;
        collect_rows(rows)
    }

    pub fn update_test(&mut self, id: i64, patch: &TestPatch) -> Result<TestRecord> {
        patch.validate().map_err(anyhow::Error::new)?;
        if patch.is_empty() {
            return Err(anyhow::Error::new(TrainingError::Validation(
                "update payload MUST contain at least one field".to_string(),
            )));
        }

        let _existing = self.get_test(id)?;
        let now = now_timestamp()?;

        let mut assignments: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(name) = &patch.name {
            values.push(Value::Text(name.clone()));
            assignments.push(format!("name = ?{}", values.len()));
        }
        if let Some(description) = &patch.description {
            values.push(Value::Text(description.clone()));
            assignments.push(format!("description = ?{}", values.len()));
        }
        if let Some(test_type) = patch.test_type {
            values.push(Value::Text(test_type.as_str().to_string()));
            assignments.push(format!("test_type = ?{}", values.len()));
        }
        if let Some(unit) = patch.unit {
            values.push(Value::Text(unit.as_str().to_string()));
            assignments.push(format!("unit = ?{}", values.len()));
        }
        if let Some(instructions) = &patch.instructions {
            values.push(Value::Text(instructions.clone()));
            assignments.push(format!("instructions = ?{}", values.len()));
        }
        if let Some(equipment) = &patch.equipment {
            let equipment_json = serde_json::to_string(equipment)
                .context("failed to serialize equipment list")?;
            values.push(Value::Text(equipment_json));
            assignments.push(format!("equipment_json = ?{}", values.len()));
        }
        if let Some(is_active) = patch.is_active {
            values.push(Value::Integer(i64::from(is_active)));
            assignments.push(format!("is_active = ?{}", values.len()));
        }

        values.push(Value::Text(now));
        assignments.push(format!("updated_at = ?{}", values.len()));

        values.push(Value::Integer(id));
        let sql = format!(
            "UPDATE tests SET {} WHERE id = ?{}",
            assignments.join(", "),
            values.len()
        );

        let update = self.conn.execute(&sql, params_from_iter(values));
        if let Err(err) = update {
            if is_constraint_violation(&err) {
                return Err(anyhow::Error::new(TrainingError::Conflict(
                    "a test with this name already exists".to_string(),
                )));
            }
            return Err(anyhow::Error::new(err).context("failed to update test"));
        }

        self.get_test(id)
    }

    /// Removes an unreferenced test outright; a test with stored results is
    /// only deactivated so those rows keep resolving their test name.
    pub fn delete_test(&mut self, id: i64) -> Result<TestDeletion> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start test delete transaction")?;

        let exists: Option<i64> = tx
            .query_row("SELECT id FROM tests WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .context("failed to load test")?;
        if exists.is_none() {
            return Err(anyhow::Error::new(TrainingError::NotFound(format!(
                "test {id} not found"
            ))));
        }

        let references: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM test_results WHERE test_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("failed to count referencing results")?;

        let outcome = if references > 0 {
            let now = now_timestamp()?;
            tx.execute(
                "UPDATE tests SET is_active = 0, updated_at = ?2 WHERE id = ?1",
                params![id, now],
            )
            .context("failed to deactivate test")?;
            TestDeletion::Deactivated
        } else {
            tx.execute("DELETE FROM tests WHERE id = ?1", params![id])
                .context("failed to delete test")?;
            TestDeletion::Removed
        };

        tx.commit().context("failed to commit test delete transaction")?;
        Ok(outcome)
    }
}

/// Storage timestamps use a fixed-width UTC layout so lexical comparison in
/// SQL matches chronological order.
fn format_timestamp(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::macros::format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .context("failed to format storage timestamp")
}

fn now_timestamp() -> Result<String> {
    format_timestamp(now_utc())
}

fn push_assignment(
    assignments: &mut Vec<String>,
    values: &mut Vec<Value>,
    column: &str,
    value: Value,
) {
    values.push(value);
    assignments.push(format!("{column} = ?{}", values.len()));
}

fn latest_result_value(conn: &Connection, user_id: i64, test_id: i64) -> Result<Option<f64>> {
    let sql = format!(
        "SELECT r.result FROM test_results r
         WHERE r.user_id = ?1 AND r.test_id = ?2
         ORDER BY {RECENCY_ORDER}
         LIMIT 1"
    );

    conn.query_row(&sql, params![user_id, test_id], |row| row.get(0))
        .optional()
        .context("failed to look up prior result")
}

fn load_result(conn: &Connection, id: i64) -> Result<Option<TestResultRecord>> {
    let sql = format!("SELECT {RESULT_COLUMNS} FROM test_results r WHERE r.id = ?1");

    conn.query_row(&sql, params![id], bare_result_from_row)
        .optional()
        .context("failed to load test result")
}

fn bare_result_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestResultRecord> {
    result_from_row(row, false)
}

fn named_result_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestResultRecord> {
    result_from_row(row, true)
}

fn result_from_row(row: &rusqlite::Row<'_>, with_name: bool) -> rusqlite::Result<TestResultRecord> {
    let unit_raw: String = row.get(6)?;
    let unit = ResultUnit::parse(&unit_raw)
        .ok_or_else(|| to_sql_error(format!("unknown stored unit: {unit_raw}")))?;

    let test_type_raw: String = row.get(7)?;
    let test_type = TestType::parse(&test_type_raw)
        .ok_or_else(|| to_sql_error(format!("unknown stored test_type: {test_type_raw}")))?;

    let test_name = if with_name { row.get(14)? } else { None };

    Ok(TestResultRecord {
        id: row.get(0)?,
        test_id: row.get(1)?,
        user_id: row.get(2)?,
        team_id: row.get(3)?,
        test_date: row.get(4)?,
        result: row.get(5)?,
        unit,
        test_type,
        notes: row.get(8)?,
        comparison_to_previous: row.get(9)?,
        created_by: row.get(10)?,
        updated_by: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        test_name,
    })
}

fn test_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestRecord> {
    let test_type_raw: String = row.get(3)?;
    let test_type = TestType::parse(&test_type_raw)
        .ok_or_else(|| to_sql_error(format!("unknown stored test_type: {test_type_raw}")))?;

    let unit_raw: String = row.get(4)?;
    let unit = ResultUnit::parse(&unit_raw)
        .ok_or_else(|| to_sql_error(format!("unknown stored unit: {unit_raw}")))?;

    let equipment_json: String = row.get(6)?;
    let equipment: Vec<String> = serde_json::from_str(&equipment_json)
        .map_err(|err| to_sql_error(format!("invalid stored equipment JSON: {err}")))?;

    let is_active: i64 = row.get(7)?;

    Ok(TestRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        test_type,
        unit,
        instructions: row.get(5)?,
        equipment,
        is_active: is_active == 1,
        created_by: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn to_sql_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
