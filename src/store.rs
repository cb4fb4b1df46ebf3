use crate::batch::{BatchRecord, BatchStore, CompositeKey, WriteStatus};
use crate::model::{AttendanceStatus, EnrollmentStatus, Grade};
use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use std::collections::{BTreeSet, HashSet};
use uuid::Uuid;

/// Which enrollment statuses count as an authoritative student-course
/// link for batch validation. Passed in explicitly so the gate is
/// configuration, not an ambient constant.
#[derive(Debug, Clone)]
pub struct EnrollmentGate {
    pub statuses: Vec<EnrollmentStatus>,
}

impl Default for EnrollmentGate {
    fn default() -> Self {
        EnrollmentGate {
            statuses: vec![EnrollmentStatus::Active],
        }
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn known_user_ids(conn: &Connection, ids: &BTreeSet<String>) -> anyhow::Result<HashSet<String>> {
    if ids.is_empty() {
        return Ok(HashSet::new());
    }
    let placeholders = std::iter::repeat_n("?", ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!("SELECT id FROM users WHERE id IN ({})", placeholders);
    let mut stmt = conn.prepare(&sql)?;
    let found = stmt
        .query_map(
            params_from_iter(ids.iter().map(|i| Value::Text(i.clone()))),
            |r| r.get::<_, String>(0),
        )?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(found)
}

// Soft-deleted courses do not validate.
fn known_course_ids(conn: &Connection, ids: &BTreeSet<String>) -> anyhow::Result<HashSet<String>> {
    if ids.is_empty() {
        return Ok(HashSet::new());
    }
    let placeholders = std::iter::repeat_n("?", ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT id FROM courses WHERE deleted_at IS NULL AND id IN ({})",
        placeholders
    );
    let mut stmt = conn.prepare(&sql)?;
    let found = stmt
        .query_map(
            params_from_iter(ids.iter().map(|i| Value::Text(i.clone()))),
            |r| r.get::<_, String>(0),
        )?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(found)
}

fn enrolled_pair_set(
    conn: &Connection,
    pairs: &BTreeSet<(String, String)>,
    gate: &EnrollmentGate,
) -> anyhow::Result<HashSet<(String, String)>> {
    if pairs.is_empty() || gate.statuses.is_empty() {
        return Ok(HashSet::new());
    }
    let status_placeholders = std::iter::repeat_n("?", gate.statuses.len())
        .collect::<Vec<_>>()
        .join(",");
    let pair_values = std::iter::repeat_n("(?,?)", pairs.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT DISTINCT user_id, course_id FROM enrollments
         WHERE status IN ({}) AND (user_id, course_id) IN (VALUES {})",
        status_placeholders, pair_values
    );

    let mut bind: Vec<Value> = Vec::with_capacity(gate.statuses.len() + pairs.len() * 2);
    for s in &gate.statuses {
        bind.push(Value::Text(s.as_str().to_string()));
    }
    for (user_id, course_id) in pairs {
        bind.push(Value::Text(user_id.clone()));
        bind.push(Value::Text(course_id.clone()));
    }

    let mut stmt = conn.prepare(&sql)?;
    let found = stmt
        .query_map(params_from_iter(bind), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(found)
}

fn existing_key_set(
    conn: &Connection,
    table: &str,
    date_col: &str,
    keys: &[CompositeKey],
) -> anyhow::Result<HashSet<CompositeKey>> {
    if keys.is_empty() {
        return Ok(HashSet::new());
    }
    let key_values = std::iter::repeat_n("(?,?,?)", keys.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT student_id, course_id, {} FROM {}
         WHERE (student_id, course_id, {}) IN (VALUES {})",
        date_col, table, date_col, key_values
    );

    let mut bind: Vec<Value> = Vec::with_capacity(keys.len() * 3);
    for key in keys {
        bind.push(Value::Text(key.student_id.clone()));
        bind.push(Value::Text(key.course_id.clone()));
        bind.push(Value::Text(key.day_string()));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut found = HashSet::with_capacity(rows.len());
    for (student_id, course_id, date) in rows {
        let day = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|e| anyhow::anyhow!("bad {} value {:?}: {}", date_col, date, e))?;
        found.insert(CompositeKey {
            student_id,
            course_id,
            day,
        });
    }
    Ok(found)
}

/// Maps one insert attempt to a per-row status. Only a UNIQUE/PRIMARY KEY
/// violation counts as a raced duplicate; every other failure aborts the
/// whole batch.
fn insert_status(result: rusqlite::Result<usize>) -> anyhow::Result<WriteStatus> {
    match result {
        Ok(_) => Ok(WriteStatus::Inserted),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY) =>
        {
            Ok(WriteStatus::Duplicate)
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Clone)]
pub struct AttendanceEntry {
    pub student_id: String,
    pub course_id: String,
    pub session_date: Option<String>,
    pub status: AttendanceStatus,
}

impl BatchRecord for AttendanceEntry {
    fn student_id(&self) -> &str {
        &self.student_id
    }
    fn course_id(&self) -> &str {
        &self.course_id
    }
    fn recorded_at(&self) -> Option<&str> {
        self.session_date.as_deref()
    }
}

pub struct AttendanceStore<'a> {
    conn: &'a Connection,
    gate: EnrollmentGate,
}

impl<'a> AttendanceStore<'a> {
    pub fn new(conn: &'a Connection, gate: EnrollmentGate) -> Self {
        AttendanceStore { conn, gate }
    }
}

impl BatchStore<AttendanceEntry> for AttendanceStore<'_> {
    fn known_students(&self, ids: &BTreeSet<String>) -> anyhow::Result<HashSet<String>> {
        known_user_ids(self.conn, ids)
    }

    fn known_courses(&self, ids: &BTreeSet<String>) -> anyhow::Result<HashSet<String>> {
        known_course_ids(self.conn, ids)
    }

    fn enrolled_pairs(
        &self,
        pairs: &BTreeSet<(String, String)>,
    ) -> anyhow::Result<HashSet<(String, String)>> {
        enrolled_pair_set(self.conn, pairs, &self.gate)
    }

    fn existing_keys(&self, keys: &[CompositeKey]) -> anyhow::Result<HashSet<CompositeKey>> {
        existing_key_set(self.conn, "attendance", "session_date", keys)
    }

    // Autocommit inserts, deliberately not wrapped in a transaction: each
    // row's outcome must be independent of its neighbors'.
    fn insert_rows(
        &self,
        rows: &[(AttendanceEntry, CompositeKey)],
        submitted_by: &str,
    ) -> anyhow::Result<Vec<WriteStatus>> {
        let now = now_rfc3339();
        let mut statuses = Vec::with_capacity(rows.len());
        for (entry, key) in rows {
            let row_id = Uuid::new_v4().to_string();
            let result = self.conn.execute(
                "INSERT INTO attendance(id, student_id, course_id, session_date, status, marked_by, created_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                (
                    &row_id,
                    &key.student_id,
                    &key.course_id,
                    &key.day_string(),
                    entry.status.as_str(),
                    submitted_by,
                    &now,
                ),
            );
            statuses.push(insert_status(result)?);
        }
        Ok(statuses)
    }
}

#[derive(Debug, Clone)]
pub struct ResultEntry {
    pub student_id: String,
    pub course_id: String,
    pub exam_date: Option<String>,
    pub subject: String,
    pub marks: f64,
    pub grade: Grade,
    pub remarks: Option<String>,
    pub semester: Option<String>,
    pub academic_year: Option<String>,
}

impl BatchRecord for ResultEntry {
    fn student_id(&self) -> &str {
        &self.student_id
    }
    fn course_id(&self) -> &str {
        &self.course_id
    }
    fn recorded_at(&self) -> Option<&str> {
        self.exam_date.as_deref()
    }
}

pub struct ResultStore<'a> {
    conn: &'a Connection,
    gate: EnrollmentGate,
}

impl<'a> ResultStore<'a> {
    pub fn new(conn: &'a Connection, gate: EnrollmentGate) -> Self {
        ResultStore { conn, gate }
    }
}

impl BatchStore<ResultEntry> for ResultStore<'_> {
    fn known_students(&self, ids: &BTreeSet<String>) -> anyhow::Result<HashSet<String>> {
        known_user_ids(self.conn, ids)
    }

    fn known_courses(&self, ids: &BTreeSet<String>) -> anyhow::Result<HashSet<String>> {
        known_course_ids(self.conn, ids)
    }

    fn enrolled_pairs(
        &self,
        pairs: &BTreeSet<(String, String)>,
    ) -> anyhow::Result<HashSet<(String, String)>> {
        enrolled_pair_set(self.conn, pairs, &self.gate)
    }

    fn existing_keys(&self, keys: &[CompositeKey]) -> anyhow::Result<HashSet<CompositeKey>> {
        existing_key_set(self.conn, "results", "exam_date", keys)
    }

    fn insert_rows(
        &self,
        rows: &[(ResultEntry, CompositeKey)],
        submitted_by: &str,
    ) -> anyhow::Result<Vec<WriteStatus>> {
        let now = now_rfc3339();
        let mut statuses = Vec::with_capacity(rows.len());
        for (entry, key) in rows {
            let row_id = Uuid::new_v4().to_string();
            let result = self.conn.execute(
                "INSERT INTO results(id, student_id, course_id, exam_date, subject, marks, grade,
                                     remarks, semester, academic_year, created_by, created_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &row_id,
                    &key.student_id,
                    &key.course_id,
                    &key.day_string(),
                    &entry.subject,
                    entry.marks,
                    entry.grade.as_str(),
                    &entry.remarks,
                    &entry.semester,
                    &entry.academic_year,
                    submitted_by,
                    &now,
                ),
            );
            statuses.push(insert_status(result)?);
        }
        Ok(statuses)
    }
}
