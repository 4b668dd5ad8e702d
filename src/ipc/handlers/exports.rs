use crate::calc;
use crate::export::{self, ReportOptions};
use crate::grid::YearMonth;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    get_opt_i64, get_opt_str, get_required_str, get_str_list, require_db, today,
};
use crate::ipc::types::{AppState, Request};
use crate::model::Student;
use crate::repo::{AttendanceFilter, MarkFilter, Repository, StudentFilter};
use crate::settings;
use anyhow::Context;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Format {
    Pdf,
    Xlsx,
}

fn parse_format(params: &Value) -> Result<Format, HandlerErr> {
    match get_required_str(params, "format")?.to_ascii_lowercase().as_str() {
        "pdf" => Ok(Format::Pdf),
        "xlsx" | "excel" => Ok(Format::Xlsx),
        _ => Err(HandlerErr::bad_params("format must be one of: pdf, xlsx")),
    }
}

fn export_failed(e: anyhow::Error) -> HandlerErr {
    warn!(error = %format!("{e:#}"), "export failed");
    HandlerErr::new("export_failed", format!("{e:#}"))
}

fn write_output(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    std::fs::write(path, bytes)
        .with_context(|| format!("failed to write {}", path.to_string_lossy()))
}

fn report_options(conn: &Connection) -> Result<ReportOptions, HandlerErr> {
    settings::report_options(conn, today()).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

/// Date range and caption for `month`/`year` params.
fn period(params: &Value) -> Result<Option<(NaiveDate, NaiveDate, String)>, HandlerErr> {
    let month = get_opt_i64(params, "month")?;
    let year = get_opt_i64(params, "year")?;
    let year = match year {
        Some(y) => Some(i32::try_from(y).map_err(|_| HandlerErr::bad_params("year out of range"))?),
        None => None,
    };
    match (month, year) {
        (None, None) => Ok(None),
        (Some(m), y) => {
            let y = y.unwrap_or_else(|| YearMonth::of(today()).year);
            let ym = u32::try_from(m)
                .ok()
                .and_then(|m| YearMonth::new(y, m))
                .ok_or_else(|| HandlerErr::bad_params("month must be 1..=12"))?;
            let caption = ym.first_day().format("%B %Y").to_string();
            Ok(Some((ym.first_day(), ym.last_day(), caption)))
        }
        (None, Some(y)) => {
            let first = NaiveDate::from_ymd_opt(y, 1, 1)
                .ok_or_else(|| HandlerErr::bad_params("year out of range"))?;
            let last = NaiveDate::from_ymd_opt(y, 12, 31)
                .ok_or_else(|| HandlerErr::bad_params("year out of range"))?;
            Ok(Some((first, last, y.to_string())))
        }
    }
}

fn export_attendance(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let repo = Repository::new(conn);
    let format = parse_format(&req.params)?;
    let out_path = PathBuf::from(get_required_str(&req.params, "outPath")?);
    let class = get_opt_str(&req.params, "class")?;
    let period = period(&req.params)?;

    let class_students = repo.list_students(&StudentFilter {
        class: class.clone(),
        search: None,
    })?;
    let mut filter = AttendanceFilter::default();
    if class.is_some() {
        filter.student_ids = Some(class_students.iter().map(|s| s.id.clone()).collect());
    }
    if let Some((from, to, _)) = &period {
        filter.from = Some(*from);
        filter.to = Some(*to);
    }
    let records = repo.list_attendance(&filter)?;
    // Records whose student was deleted still export, under placeholder names.
    let students = if class.is_some() {
        class_students
    } else {
        repo.list_students(&StudentFilter::default())?
    };
    let rows = export::attendance_rows(&records, &students);

    let bytes = match format {
        Format::Xlsx => export::attendance_xlsx(&rows),
        Format::Pdf => {
            let opts = report_options(conn)?;
            let caption = match (&period, &class) {
                (Some((_, _, p)), Some(c)) => Some(format!("{p}, Class {c}")),
                (Some((_, _, p)), None) => Some(p.clone()),
                (None, Some(c)) => Some(format!("Class {c}")),
                (None, None) => None,
            };
            export::attendance_pdf(&rows, caption.as_deref(), &opts)
        }
    }
    .and_then(|b| write_output(&out_path, &b).map(|_| b.len()))
    .map_err(export_failed)?;

    info!(path = %out_path.display(), rows = rows.len(), "attendance exported");
    Ok(json!({ "outPath": out_path.to_string_lossy(), "rows": rows.len(), "bytes": bytes }))
}

fn export_marks(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let repo = Repository::new(conn);
    let format = parse_format(&req.params)?;
    let out_path = PathBuf::from(get_required_str(&req.params, "outPath")?);
    let filter = MarkFilter {
        student_id: get_opt_str(&req.params, "studentId")?,
        subject: get_opt_str(&req.params, "subject")?,
        week_number: get_opt_i64(&req.params, "weekNumber")?.and_then(|w| u32::try_from(w).ok()),
        year: get_opt_i64(&req.params, "year")?.and_then(|y| i32::try_from(y).ok()),
    };
    let marks = repo.list_marks(&filter)?;
    let students = repo.list_students(&StudentFilter::default())?;
    let rows = export::mark_rows(&marks, &students);

    let bytes = match format {
        Format::Xlsx => export::marks_xlsx(&rows),
        Format::Pdf => {
            let mut lines = Vec::new();
            if let Some(id) = &filter.student_id {
                let name = students
                    .iter()
                    .find(|s| &s.id == id)
                    .map_or(export::UNKNOWN_STUDENT, |s| s.name.as_str());
                lines.push(format!("Student: {name}"));
            }
            if let Some(subject) = &filter.subject {
                lines.push(format!("Subject: {subject}"));
            }
            if let Some(week) = filter.week_number {
                lines.push(format!("Week: {week}"));
            }
            if let Some(year) = filter.year {
                lines.push(format!("Year: {year}"));
            }
            export::marks_pdf(&rows, &lines, &report_options(conn)?)
        }
    }
    .and_then(|b| write_output(&out_path, &b).map(|_| b.len()))
    .map_err(export_failed)?;

    info!(path = %out_path.display(), rows = rows.len(), "marks exported");
    Ok(json!({ "outPath": out_path.to_string_lossy(), "rows": rows.len(), "bytes": bytes }))
}

/// Renders the progress summary PDF for one student.
pub(crate) fn summary_pdf(
    conn: &Connection,
    student: &Student,
    opts: &ReportOptions,
    recent_count: usize,
) -> Result<Vec<u8>, HandlerErr> {
    let repo = Repository::new(conn);
    let records = repo.list_attendance(&AttendanceFilter {
        student_ids: Some(vec![student.id.clone()]),
        ..Default::default()
    })?;
    let recent = repo.recent_marks(&student.id, recent_count)?;
    let summary = calc::attendance_summary_for(&records, student);
    export::student_summary_pdf(student, &summary, &recent, opts).map_err(export_failed)
}

fn recent_count(conn: &Connection) -> Result<usize, HandlerErr> {
    settings::notification_settings(conn)
        .map(|n| n.recent_marks_count)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn export_student_summary(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let out_path = PathBuf::from(get_required_str(&req.params, "outPath")?);
    let student = Repository::new(conn).get_student(&student_id)?;
    let bytes = summary_pdf(conn, &student, &report_options(conn)?, recent_count(conn)?)?;
    write_output(&out_path, &bytes).map_err(export_failed)?;
    Ok(json!({ "outPath": out_path.to_string_lossy(), "bytes": bytes.len() }))
}

fn export_bulk_summaries(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let repo = Repository::new(conn);
    let student_ids = get_str_list(&req.params, "studentIds")?;
    let out_path = PathBuf::from(get_required_str(&req.params, "outPath")?);
    let opts = report_options(conn)?;
    let recent = recent_count(conn)?;

    let mut files: Vec<(String, Vec<u8>)> = Vec::new();
    let mut names = HashSet::new();
    let mut failures = Vec::new();
    for id in &student_ids {
        let rendered = repo
            .get_student(id)
            .map_err(HandlerErr::from)
            .and_then(|s| summary_pdf(conn, &s, &opts, recent).map(|b| (s, b)));
        match rendered {
            Ok((student, bytes)) => {
                let name = export::summary_file_name(&student);
                if names.insert(name.clone()) {
                    files.push((name, bytes));
                }
            }
            Err(e) => {
                warn!(student_id = %id, code = e.code, "student summary skipped");
                failures.push(json!({ "studentId": id, "message": e.message }));
            }
        }
    }

    export::bundle_zip(&files)
        .and_then(|b| write_output(&out_path, &b))
        .map_err(export_failed)?;
    info!(
        path = %out_path.display(),
        succeeded = files.len(),
        failed = failures.len(),
        "student summaries bundled"
    );
    Ok(json!({
        "outPath": out_path.to_string_lossy(),
        "succeeded": files.len(),
        "failed": failures.len(),
        "failures": failures,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "export.attendance" => export_attendance(state, req),
        "export.marks" => export_marks(state, req),
        "export.studentSummary" => export_student_summary(state, req),
        "export.bulkSummaries" => export_bulk_summaries(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
