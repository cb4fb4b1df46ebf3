use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeSet, HashSet};

/// Hard cap on records per submission, mirroring the platform-wide bulk
/// limit enforced at the request boundary.
pub const BATCH_MAX_RECORDS: usize = 30;

/// Natural identity of one persisted attendance/result row. The storage
/// layer enforces at most one row per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeKey {
    pub student_id: String,
    pub course_id: String,
    pub day: NaiveDate,
}

impl CompositeKey {
    pub fn day_string(&self) -> String {
        self.day.format("%Y-%m-%d").to_string()
    }
}

/// One untrusted record in a bulk submission. Feature payloads (attendance
/// status, result marks/grade) live on the implementing type; the pipeline
/// only needs the reference ids and the raw temporal value.
pub trait BatchRecord {
    fn student_id(&self) -> &str;
    fn course_id(&self) -> &str;
    /// Raw temporal value as submitted; `None` means "now".
    fn recorded_at(&self) -> Option<&str>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MalformedDate,
    StudentNotFound,
    CourseNotFound,
    NotEnrolled,
}

impl RejectReason {
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::MalformedDate => "malformed_date",
            RejectReason::StudentNotFound => "student_not_found",
            RejectReason::CourseNotFound => "course_not_found",
            RejectReason::NotEnrolled => "not_enrolled",
        }
    }
}

/// Per-row outcome of the unordered insert. `Duplicate` is the residual
/// race the pre-filter cannot close: the key appeared between the filter
/// query and the insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Inserted,
    Duplicate,
}

/// Storage port for one batch feature. Every method is a single bounded
/// round trip over the whole set it receives; the pipeline never issues
/// per-record queries.
pub trait BatchStore<T: BatchRecord> {
    fn known_students(&self, ids: &BTreeSet<String>) -> anyhow::Result<HashSet<String>>;
    fn known_courses(&self, ids: &BTreeSet<String>) -> anyhow::Result<HashSet<String>>;
    fn enrolled_pairs(
        &self,
        pairs: &BTreeSet<(String, String)>,
    ) -> anyhow::Result<HashSet<(String, String)>>;
    fn existing_keys(&self, keys: &[CompositeKey]) -> anyhow::Result<HashSet<CompositeKey>>;
    /// Unordered insert: must keep attempting remaining rows after a
    /// uniqueness violation and report one status per row, in order.
    /// Any other storage fault aborts the whole operation.
    fn insert_rows(
        &self,
        rows: &[(T, CompositeKey)],
        submitted_by: &str,
    ) -> anyhow::Result<Vec<WriteStatus>>;
}

/// Full classification of a submission. Every input record lands in
/// exactly one bucket.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub inserted: Vec<CompositeKey>,
    pub already_existed: Vec<CompositeKey>,
    pub invalid: Vec<(T, RejectReason)>,
    /// Rows that lost the insert race on their key.
    pub write_failed: Vec<(T, CompositeKey)>,
}

impl<T> BatchOutcome<T> {
    pub fn total(&self) -> usize {
        self.inserted.len() + self.already_existed.len() + self.invalid.len()
            + self.write_failed.len()
    }
}

/// Truncates a submitted temporal value to its UTC calendar day.
/// Accepts an RFC 3339 timestamp (any offset, converted to UTC first) or a
/// bare `YYYY-MM-DD` date. `None`/blank falls back to `today`.
fn normalize_day(raw: Option<&str>, today: NaiveDate) -> Option<NaiveDate> {
    let Some(raw) = raw else {
        return Some(today);
    };
    let t = raw.trim();
    if t.is_empty() {
        return Some(today);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.with_timezone(&Utc).date_naive());
    }
    NaiveDate::parse_from_str(t, "%Y-%m-%d").ok()
}

/// Runs the whole ingestion pipeline for one submission.
///
/// Stages: key normalization, reference validation (students, courses),
/// enrollment gate, existing-record pre-filter, unordered insert of the
/// novel remainder. Validation failures keep the first reason in stage
/// order; the filter and the insert are deliberately not wrapped in one
/// transaction — the uniqueness constraint is the correctness backstop,
/// and a raced key surfaces as a per-row `write_failed` entry.
///
/// The caller bounds the batch to [`BATCH_MAX_RECORDS`] before calling.
pub fn submit_batch<T, S>(
    store: &S,
    records: Vec<T>,
    submitted_by: &str,
) -> anyhow::Result<BatchOutcome<T>>
where
    T: BatchRecord,
    S: BatchStore<T>,
{
    let input_len = records.len();

    let mut invalid: Vec<(T, RejectReason)> = Vec::new();
    let mut keyed: Vec<(T, CompositeKey)> = Vec::new();

    let today = Utc::now().date_naive();
    for rec in records {
        match normalize_day(rec.recorded_at(), today) {
            Some(day) => {
                let key = CompositeKey {
                    student_id: rec.student_id().to_string(),
                    course_id: rec.course_id().to_string(),
                    day,
                };
                keyed.push((rec, key));
            }
            None => invalid.push((rec, RejectReason::MalformedDate)),
        }
    }

    let mut student_ids: BTreeSet<String> = BTreeSet::new();
    let mut course_ids: BTreeSet<String> = BTreeSet::new();
    let mut pairs: BTreeSet<(String, String)> = BTreeSet::new();
    for (_, key) in &keyed {
        student_ids.insert(key.student_id.clone());
        course_ids.insert(key.course_id.clone());
        pairs.insert((key.student_id.clone(), key.course_id.clone()));
    }

    // One round trip per reference set, regardless of batch size.
    let (known_students, known_courses, enrolled) = if keyed.is_empty() {
        (HashSet::new(), HashSet::new(), HashSet::new())
    } else {
        (
            store.known_students(&student_ids)?,
            store.known_courses(&course_ids)?,
            store.enrolled_pairs(&pairs)?,
        )
    };

    let mut valid: Vec<(T, CompositeKey)> = Vec::new();
    for (rec, key) in keyed {
        let reason = if !known_students.contains(&key.student_id) {
            Some(RejectReason::StudentNotFound)
        } else if !known_courses.contains(&key.course_id) {
            Some(RejectReason::CourseNotFound)
        } else if !enrolled.contains(&(key.student_id.clone(), key.course_id.clone())) {
            Some(RejectReason::NotEnrolled)
        } else {
            None
        };
        match reason {
            Some(r) => invalid.push((rec, r)),
            None => valid.push((rec, key)),
        }
    }

    // Best-effort pre-filter; a concurrent submission can still win the
    // race between this query and the insert below.
    let candidate_keys: Vec<CompositeKey> = valid.iter().map(|(_, k)| k.clone()).collect();
    let existing = if candidate_keys.is_empty() {
        HashSet::new()
    } else {
        store.existing_keys(&candidate_keys)?
    };

    let mut already_existed: Vec<CompositeKey> = Vec::new();
    let mut novel: Vec<(T, CompositeKey)> = Vec::new();
    for (rec, key) in valid {
        if existing.contains(&key) {
            already_existed.push(key);
        } else {
            novel.push((rec, key));
        }
    }

    let statuses = if novel.is_empty() {
        Vec::new()
    } else {
        store.insert_rows(&novel, submitted_by)?
    };
    anyhow::ensure!(
        statuses.len() == novel.len(),
        "store reported {} statuses for {} rows",
        statuses.len(),
        novel.len()
    );

    let mut inserted: Vec<CompositeKey> = Vec::new();
    let mut write_failed: Vec<(T, CompositeKey)> = Vec::new();
    for ((rec, key), status) in novel.into_iter().zip(statuses) {
        match status {
            WriteStatus::Inserted => inserted.push(key),
            WriteStatus::Duplicate => write_failed.push((rec, key)),
        }
    }

    let outcome = BatchOutcome {
        inserted,
        already_existed,
        invalid,
        write_failed,
    };
    anyhow::ensure!(
        outcome.total() == input_len,
        "classified {} of {} records",
        outcome.total(),
        input_len
    );
    Ok(outcome)
}
