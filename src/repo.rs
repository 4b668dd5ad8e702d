//! Data-access layer over the workspace database.
//!
//! Every row leaves this module as a `model` struct with canonical field
//! names; column spellings such as `student_id` stay inside the SQL here.

use crate::db::now_rfc3339;
use crate::model::{
    AttendanceRecord, AttendanceStatus, Gender, NewMark, NewStudent, Staff, Student,
    StudentPatch, ValidationError, WeeklyTestMark, DATE_FORMAT,
};
use chrono::NaiveDate;
use rusqlite::types::{Type, Value};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Default)]
pub struct StudentFilter {
    pub class: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AttendanceFilter {
    pub student_ids: Option<Vec<String>>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default)]
pub struct MarkFilter {
    pub student_id: Option<String>,
    pub subject: Option<String>,
    pub week_number: Option<u32>,
    pub year: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct OutboundMessage<'a> {
    pub phone_number: &'a str,
    pub message: &'a str,
    pub student_name: Option<&'a str>,
    pub status: &'a str,
    pub provider_message_id: Option<&'a str>,
}

pub struct Repository<'a> {
    conn: &'a Connection,
}

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT)
        .map_err(|e| conversion_err(idx, format!("bad date {raw:?}: {e}")))
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    let subjects_raw: String = row.get(3)?;
    let subjects: Vec<String> = serde_json::from_str(&subjects_raw)
        .map_err(|e| conversion_err(3, format!("bad subjects json: {e}")))?;
    let gender_raw: String = row.get(4)?;
    let gender = Gender::parse(&gender_raw)
        .ok_or_else(|| conversion_err(4, format!("bad gender {gender_raw:?}")))?;
    Ok(Student {
        id: row.get(0)?,
        name: row.get(1)?,
        class: row.get(2)?,
        subjects,
        gender,
        parent_phone: row.get(5)?,
        school_name: row.get(6)?,
        assigned_staff_id: row.get(7)?,
    })
}

fn attendance_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let status_raw: String = row.get(3)?;
    let status = AttendanceStatus::parse(&status_raw)
        .ok_or_else(|| conversion_err(3, format!("bad status {status_raw:?}")))?;
    Ok(AttendanceRecord {
        id: row.get(0)?,
        student_id: row.get(1)?,
        date: date_col(row, 2)?,
        status,
    })
}

fn mark_from_row(row: &Row<'_>) -> rusqlite::Result<WeeklyTestMark> {
    Ok(WeeklyTestMark {
        id: row.get(0)?,
        student_id: row.get(1)?,
        subject: row.get(2)?,
        week_number: row.get(3)?,
        year: row.get(4)?,
        marks_obtained: row.get(5)?,
        total_marks: row.get(6)?,
        test_date: date_col(row, 7)?,
        remarks: row.get(8)?,
    })
}

const STUDENT_COLUMNS: &str =
    "id, name, class, subjects, gender, parent_phone, school_name, assigned_staff_id";
const MARK_COLUMNS: &str =
    "id, student_id, subject, week_number, year, marks_obtained, total_marks, test_date, remarks";

impl<'a> Repository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    // ---- students ----

    pub fn list_students(&self, filter: &StudentFilter) -> StoreResult<Vec<Student>> {
        let mut sql = format!("SELECT {STUDENT_COLUMNS} FROM students");
        let mut bind: Vec<Value> = Vec::new();
        if let Some(class) = filter.class.as_deref().filter(|c| !c.trim().is_empty()) {
            sql.push_str(" WHERE class = ?");
            bind.push(Value::Text(class.trim().to_string()));
        }
        sql.push_str(" ORDER BY class, name COLLATE NOCASE, id");

        let mut stmt = self.conn.prepare(&sql)?;
        let mut students = stmt
            .query_map(params_from_iter(bind), student_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(q) = filter.search.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            let q = q.to_lowercase();
            students.retain(|s| s.name.to_lowercase().contains(&q));
        }
        Ok(students)
    }

    pub fn get_student(&self, id: &str) -> StoreResult<Student> {
        self.conn
            .query_row(
                &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = ?"),
                [id],
                student_from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound("student"))
    }

    pub fn student_exists(&self, id: &str) -> StoreResult<bool> {
        Ok(self
            .conn
            .query_row("SELECT 1 FROM students WHERE id = ?", [id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()?
            .is_some())
    }

    fn ensure_staff(&self, staff_id: Option<&str>) -> StoreResult<()> {
        let Some(staff_id) = staff_id else {
            return Ok(());
        };
        let exists = self
            .conn
            .query_row("SELECT 1 FROM staff WHERE id = ?", [staff_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()?
            .is_some();
        if exists {
            Ok(())
        } else {
            Err(StoreError::NotFound("staff"))
        }
    }

    pub fn create_student(&self, input: NewStudent) -> StoreResult<Student> {
        let input = input.normalized()?;
        self.ensure_staff(input.assigned_staff_id.as_deref())?;

        let student = Student {
            id: Uuid::new_v4().to_string(),
            name: input.name,
            class: input.class,
            subjects: input.subjects,
            gender: input.gender,
            parent_phone: input.parent_phone,
            school_name: input.school_name,
            assigned_staff_id: input.assigned_staff_id,
        };
        self.conn.execute(
            "INSERT INTO students(id, name, class, subjects, gender, parent_phone, school_name, assigned_staff_id, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &student.id,
                &student.name,
                &student.class,
                subjects_json(&student.subjects),
                student.gender.as_str(),
                &student.parent_phone,
                &student.school_name,
                &student.assigned_staff_id,
                now_rfc3339(),
            ),
        )?;
        Ok(student)
    }

    pub fn update_student(&self, id: &str, patch: StudentPatch) -> StoreResult<Student> {
        let mut student = self.get_student(id)?;
        patch.apply(&mut student)?;
        self.ensure_staff(student.assigned_staff_id.as_deref())?;

        self.conn.execute(
            "UPDATE students SET
               name = ?, class = ?, subjects = ?, gender = ?,
               parent_phone = ?, school_name = ?, assigned_staff_id = ?, updated_at = ?
             WHERE id = ?",
            (
                &student.name,
                &student.class,
                subjects_json(&student.subjects),
                student.gender.as_str(),
                &student.parent_phone,
                &student.school_name,
                &student.assigned_staff_id,
                now_rfc3339(),
                &student.id,
            ),
        )?;
        Ok(student)
    }

    /// Removes the student together with the attendance and marks that reference it.
    pub fn delete_student(&self, id: &str) -> StoreResult<()> {
        if !self.student_exists(id)? {
            return Err(StoreError::NotFound("student"));
        }
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM attendance_records WHERE student_id = ?", [id])?;
        tx.execute("DELETE FROM weekly_test_marks WHERE student_id = ?", [id])?;
        tx.execute("DELETE FROM students WHERE id = ?", [id])?;
        tx.commit()?;
        Ok(())
    }

    // ---- staff ----

    pub fn list_staff(&self) -> StoreResult<Vec<Staff>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, full_name, email FROM staff ORDER BY full_name COLLATE NOCASE")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(Staff {
                    id: r.get(0)?,
                    full_name: r.get(1)?,
                    email: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn create_staff(&self, full_name: &str, email: &str) -> StoreResult<Staff> {
        let full_name = full_name.trim();
        let email = email.trim().to_lowercase();
        if full_name.is_empty() {
            return Err(ValidationError::new("fullName", "full name is required").into());
        }
        if !email.contains('@') {
            return Err(ValidationError::new("email", "email address is invalid").into());
        }
        let staff = Staff {
            id: Uuid::new_v4().to_string(),
            full_name: full_name.to_string(),
            email,
        };
        self.conn.execute(
            "INSERT INTO staff(id, full_name, email, created_at) VALUES(?, ?, ?, ?)",
            (&staff.id, &staff.full_name, &staff.email, now_rfc3339()),
        )?;
        Ok(staff)
    }

    // ---- attendance ----

    pub fn list_attendance(&self, filter: &AttendanceFilter) -> StoreResult<Vec<AttendanceRecord>> {
        let mut sql =
            "SELECT id, student_id, date, status FROM attendance_records WHERE 1 = 1".to_string();
        let mut bind: Vec<Value> = Vec::new();
        if let Some(ids) = &filter.student_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let marks = vec!["?"; ids.len()].join(", ");
            sql.push_str(&format!(" AND student_id IN ({marks})"));
            bind.extend(ids.iter().map(|s| Value::Text(s.clone())));
        }
        if let Some(from) = filter.from {
            sql.push_str(" AND date >= ?");
            bind.push(Value::Text(from.format(DATE_FORMAT).to_string()));
        }
        if let Some(to) = filter.to {
            sql.push_str(" AND date <= ?");
            bind.push(Value::Text(to.format(DATE_FORMAT).to_string()));
        }
        sql.push_str(" ORDER BY date, student_id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(bind), attendance_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_attendance(
        &self,
        student_id: &str,
        date: NaiveDate,
        status: AttendanceStatus,
    ) -> StoreResult<AttendanceRecord> {
        if !self.student_exists(student_id)? {
            return Err(StoreError::NotFound("student"));
        }
        let date_key = date.format(DATE_FORMAT).to_string();
        self.conn.execute(
            "INSERT INTO attendance_records(id, student_id, date, status, created_at)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(student_id, date) DO UPDATE SET
               status = excluded.status",
            (
                Uuid::new_v4().to_string(),
                student_id,
                &date_key,
                status.as_str(),
                now_rfc3339(),
            ),
        )?;
        let record = self.conn.query_row(
            "SELECT id, student_id, date, status FROM attendance_records
             WHERE student_id = ? AND date = ?",
            (student_id, &date_key),
            attendance_from_row,
        )?;
        Ok(record)
    }

    /// Returns whether a record existed.
    pub fn remove_attendance(&self, student_id: &str, date: NaiveDate) -> StoreResult<bool> {
        let n = self.conn.execute(
            "DELETE FROM attendance_records WHERE student_id = ? AND date = ?",
            (student_id, date.format(DATE_FORMAT).to_string()),
        )?;
        Ok(n > 0)
    }

    // ---- weekly test marks ----

    pub fn list_marks(&self, filter: &MarkFilter) -> StoreResult<Vec<WeeklyTestMark>> {
        let mut sql = format!("SELECT {MARK_COLUMNS} FROM weekly_test_marks WHERE 1 = 1");
        let mut bind: Vec<Value> = Vec::new();
        if let Some(id) = &filter.student_id {
            sql.push_str(" AND student_id = ?");
            bind.push(Value::Text(id.clone()));
        }
        if let Some(subject) = &filter.subject {
            sql.push_str(" AND subject = ?");
            bind.push(Value::Text(subject.clone()));
        }
        if let Some(week) = filter.week_number {
            sql.push_str(" AND week_number = ?");
            bind.push(Value::Integer(week as i64));
        }
        if let Some(year) = filter.year {
            sql.push_str(" AND year = ?");
            bind.push(Value::Integer(year as i64));
        }
        sql.push_str(" ORDER BY test_date DESC, year DESC, week_number DESC, created_at DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(bind), mark_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn recent_marks(&self, student_id: &str, limit: usize) -> StoreResult<Vec<WeeklyTestMark>> {
        let mut marks = self.list_marks(&MarkFilter {
            student_id: Some(student_id.to_string()),
            ..Default::default()
        })?;
        marks.truncate(limit);
        Ok(marks)
    }

    pub fn get_mark(&self, id: &str) -> StoreResult<WeeklyTestMark> {
        self.conn
            .query_row(
                &format!("SELECT {MARK_COLUMNS} FROM weekly_test_marks WHERE id = ?"),
                [id],
                mark_from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound("mark"))
    }

    pub fn create_mark(&self, input: NewMark) -> StoreResult<WeeklyTestMark> {
        let input = input.normalized()?;
        if !self.student_exists(&input.student_id)? {
            return Err(StoreError::NotFound("student"));
        }
        let mark = WeeklyTestMark {
            id: Uuid::new_v4().to_string(),
            student_id: input.student_id,
            subject: input.subject,
            week_number: input.week_number,
            year: input.year,
            marks_obtained: input.marks_obtained,
            total_marks: input.total_marks,
            test_date: input.test_date,
            remarks: input.remarks,
        };
        self.conn.execute(
            "INSERT INTO weekly_test_marks(id, student_id, subject, week_number, year, marks_obtained, total_marks, test_date, remarks, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &mark.id,
                &mark.student_id,
                &mark.subject,
                mark.week_number,
                mark.year,
                mark.marks_obtained,
                mark.total_marks,
                mark.test_date.format(DATE_FORMAT).to_string(),
                &mark.remarks,
                now_rfc3339(),
            ),
        )?;
        Ok(mark)
    }

    pub fn update_mark(&self, id: &str, input: NewMark) -> StoreResult<WeeklyTestMark> {
        let input = input.normalized()?;
        let existing = self.get_mark(id)?;
        if !self.student_exists(&input.student_id)? {
            return Err(StoreError::NotFound("student"));
        }
        let mark = WeeklyTestMark {
            id: existing.id,
            student_id: input.student_id,
            subject: input.subject,
            week_number: input.week_number,
            year: input.year,
            marks_obtained: input.marks_obtained,
            total_marks: input.total_marks,
            test_date: input.test_date,
            remarks: input.remarks,
        };
        self.conn.execute(
            "UPDATE weekly_test_marks SET
               student_id = ?, subject = ?, week_number = ?, year = ?,
               marks_obtained = ?, total_marks = ?, test_date = ?, remarks = ?
             WHERE id = ?",
            (
                &mark.student_id,
                &mark.subject,
                mark.week_number,
                mark.year,
                mark.marks_obtained,
                mark.total_marks,
                mark.test_date.format(DATE_FORMAT).to_string(),
                &mark.remarks,
                &mark.id,
            ),
        )?;
        Ok(mark)
    }

    pub fn delete_mark(&self, id: &str) -> StoreResult<()> {
        let n = self
            .conn
            .execute("DELETE FROM weekly_test_marks WHERE id = ?", [id])?;
        if n == 0 {
            return Err(StoreError::NotFound("mark"));
        }
        Ok(())
    }

    // ---- outbound notifications ----

    pub fn log_message(&self, msg: &OutboundMessage<'_>) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO whatsapp_messages(id, phone_number, message, student_name, status, whatsapp_message_id, sent_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                msg.phone_number,
                msg.message,
                msg.student_name,
                msg.status,
                msg.provider_message_id,
                now_rfc3339(),
            ),
        )?;
        Ok(())
    }
}

fn subjects_json(subjects: &[String]) -> String {
    serde_json::to_string(subjects).unwrap_or_else(|_| "[]".to_string())
}

impl crate::grid::AttendanceStore for Repository<'_> {
    fn mark(&mut self, student_id: &str, date: NaiveDate, status: AttendanceStatus) -> anyhow::Result<()> {
        self.upsert_attendance(student_id, date, status)?;
        Ok(())
    }

    fn unmark(&mut self, student_id: &str, date: NaiveDate) -> anyhow::Result<()> {
        self.remove_attendance(student_id, date)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_workspace_db() -> Connection {
        let dir = std::env::temp_dir().join(format!("tuitiond-repo-{}", Uuid::new_v4()));
        crate::db::open_db(&dir).expect("open db")
    }

    fn new_student(name: &str, class: &str) -> NewStudent {
        NewStudent {
            name: name.to_string(),
            class: class.to_string(),
            subjects: vec!["Maths".to_string(), "Science".to_string()],
            gender: Gender::Other,
            parent_phone: None,
            school_name: None,
            assigned_staff_id: None,
        }
    }

    #[test]
    fn attendance_upsert_keeps_one_row_per_day() {
        let conn = temp_workspace_db();
        let repo = Repository::new(&conn);
        let s = repo.create_student(new_student("Kavin", "9")).expect("create");
        let day = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();

        let first = repo
            .upsert_attendance(&s.id, day, AttendanceStatus::Present)
            .expect("mark");
        let second = repo
            .upsert_attendance(&s.id, day, AttendanceStatus::Absent)
            .expect("remark");
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, AttendanceStatus::Absent);

        let all = repo.list_attendance(&AttendanceFilter::default()).expect("list");
        assert_eq!(all.len(), 1);

        assert!(repo.remove_attendance(&s.id, day).expect("remove"));
        assert!(!repo.remove_attendance(&s.id, day).expect("remove again"));
    }

    #[test]
    fn attendance_for_unknown_student_is_not_found() {
        let conn = temp_workspace_db();
        let repo = Repository::new(&conn);
        let day = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let err = repo
            .upsert_attendance("nope", day, AttendanceStatus::Present)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound("student")));
    }

    #[test]
    fn student_filters_and_cascade_delete() {
        let conn = temp_workspace_db();
        let repo = Repository::new(&conn);
        let a = repo.create_student(new_student("Anitha", "9")).expect("a");
        repo.create_student(new_student("Bala", "10")).expect("b");
        repo.create_student(new_student("Banu", "9")).expect("c");

        let nine = repo
            .list_students(&StudentFilter {
                class: Some("9".into()),
                search: None,
            })
            .expect("list");
        assert_eq!(nine.len(), 2);
        let ba = repo
            .list_students(&StudentFilter {
                class: None,
                search: Some("BA".into()),
            })
            .expect("search");
        assert_eq!(ba.len(), 2);

        let day = NaiveDate::from_ymd_opt(2026, 6, 2).unwrap();
        repo.upsert_attendance(&a.id, day, AttendanceStatus::Present)
            .expect("mark");
        repo.delete_student(&a.id).expect("delete");
        assert!(repo
            .list_attendance(&AttendanceFilter::default())
            .expect("list")
            .is_empty());
        assert!(matches!(repo.get_student(&a.id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn marks_are_validated_before_write() {
        let conn = temp_workspace_db();
        let repo = Repository::new(&conn);
        let s = repo.create_student(new_student("Divya", "8")).expect("create");
        let bad = NewMark {
            student_id: s.id.clone(),
            subject: "Maths".into(),
            week_number: 10,
            year: 2026,
            marks_obtained: 101.0,
            total_marks: 100.0,
            test_date: NaiveDate::from_ymd_opt(2026, 3, 7).unwrap(),
            remarks: None,
        };
        assert!(matches!(
            repo.create_mark(bad.clone()),
            Err(StoreError::Validation(_))
        ));
        assert!(repo.list_marks(&MarkFilter::default()).expect("list").is_empty());

        let ok = repo
            .create_mark(NewMark {
                marks_obtained: 0.0,
                ..bad
            })
            .expect("zero is valid");
        assert_eq!(ok.percentage(), 0.0);
    }
}
