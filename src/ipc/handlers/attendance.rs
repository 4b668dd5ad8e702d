use crate::calc;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    get_opt_date, get_opt_str, get_required_date, get_required_str, get_str_list, require_db,
    to_json,
};
use crate::ipc::types::{AppState, Request};
use crate::model::AttendanceStatus;
use crate::repo::{AttendanceFilter, Repository, StudentFilter};
use crate::settings;
use chrono::NaiveDate;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

fn parse_status(params: &Value) -> Result<AttendanceStatus, HandlerErr> {
    let raw = get_required_str(params, "status")?;
    AttendanceStatus::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params("status must be one of: present, absent"))
}

/// Rejects direct writes to cells the open grid is still buffering.
fn ensure_not_buffered(state: &AppState, student_id: &str, date: NaiveDate) -> Result<(), HandlerErr> {
    let Some(session) = state.grid.as_ref() else {
        return Ok(());
    };
    if session
        .grid
        .pending()
        .any(|(k, _)| k.student_id == student_id && k.date == date)
    {
        return Err(HandlerErr::new(
            "unsaved_changes",
            "this cell has an unsaved change in the attendance grid",
        ));
    }
    Ok(())
}

/// Keeps an open grid's snapshot in step with a direct write.
fn sync_grid(state: &mut AppState, student_id: &str, date: NaiveDate, status: Option<AttendanceStatus>) {
    if let Some(session) = state.grid.as_mut() {
        if session.grid.apply_external(student_id, date, status) {
            debug!(student_id, date = %date, "attendance grid snapshot refreshed");
        }
    }
}

fn attendance_filter(params: &Value) -> Result<AttendanceFilter, HandlerErr> {
    let mut student_ids = match params.get("studentIds") {
        None | Some(Value::Null) => None,
        Some(_) => Some(get_str_list(params, "studentIds")?),
    };
    if let Some(id) = get_opt_str(params, "studentId")? {
        student_ids.get_or_insert_with(Vec::new).push(id);
    }
    let filter = AttendanceFilter {
        student_ids,
        from: get_opt_date(params, "from")?,
        to: get_opt_date(params, "to")?,
    };
    if let (Some(from), Some(to)) = (filter.from, filter.to) {
        if from > to {
            return Err(HandlerErr::bad_params("from must not be after to"));
        }
    }
    Ok(filter)
}

fn attendance_list(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let filter = attendance_filter(&req.params)?;
    let records = Repository::new(conn).list_attendance(&filter)?;
    Ok(json!({ "records": to_json(&records)? }))
}

fn attendance_mark(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(&req.params, "studentId")?;
    let date = get_required_date(&req.params, "date")?;
    let status = parse_status(&req.params)?;
    ensure_not_buffered(state, &student_id, date)?;
    let conn = require_db(state)?;
    let record = Repository::new(conn)
        .upsert_attendance(&student_id, date, status)
        .map_err(|e| HandlerErr::store(e, "db_insert_failed"))?;
    sync_grid(state, &student_id, date, Some(status));
    Ok(json!({ "record": to_json(&record)? }))
}

fn attendance_remove(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(&req.params, "studentId")?;
    let date = get_required_date(&req.params, "date")?;
    ensure_not_buffered(state, &student_id, date)?;
    let conn = require_db(state)?;
    let removed = Repository::new(conn)
        .remove_attendance(&student_id, date)
        .map_err(|e| HandlerErr::store(e, "db_delete_failed"))?;
    sync_grid(state, &student_id, date, None);
    Ok(json!({ "removed": removed }))
}

fn attendance_bulk_mark(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let student_ids = get_str_list(&req.params, "studentIds")?;
    let date = get_required_date(&req.params, "date")?;
    let status = parse_status(&req.params)?;
    let conn = require_db(state)?;
    let repo = Repository::new(conn);

    let mut marked = Vec::new();
    let mut failures = Vec::new();
    for id in &student_ids {
        let outcome = ensure_not_buffered(state, id, date).and_then(|_| {
            repo.upsert_attendance(id, date, status)
                .map_err(|e| HandlerErr::store(e, "db_insert_failed"))
        });
        match outcome {
            Ok(_) => marked.push(id.as_str()),
            Err(e) => {
                warn!(student_id = %id, code = e.code, "bulk attendance mark failed");
                failures.push(json!({ "studentId": id, "message": e.message }));
            }
        }
    }
    for id in &marked {
        sync_grid(state, id, date, Some(status));
    }
    let succeeded = marked.len();
    info!(
        date = %date,
        succeeded,
        failed = failures.len(),
        "bulk attendance marked"
    );
    Ok(json!({
        "succeeded": succeeded,
        "failed": failures.len(),
        "failures": failures,
    }))
}

fn attendance_summary(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let repo = Repository::new(conn);
    let students = match get_opt_str(&req.params, "studentId")? {
        Some(id) => vec![repo.get_student(&id)?],
        None => repo.list_students(&StudentFilter {
            class: get_opt_str(&req.params, "class")?,
            search: None,
        })?,
    };
    let filter = AttendanceFilter {
        student_ids: Some(students.iter().map(|s| s.id.clone()).collect()),
        from: get_opt_date(&req.params, "from")?,
        to: get_opt_date(&req.params, "to")?,
    };
    let records = repo.list_attendance(&filter)?;
    let thresholds = settings::band_thresholds(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let summaries: Vec<Value> = calc::attendance_summaries(&records, &students)
        .into_iter()
        .map(|s| {
            let band = calc::attendance_band(s.percentage, thresholds);
            let mut v = json!(s);
            v["band"] = json!(band);
            v["percentageRounded"] = json!(calc::round_1(s.percentage));
            v
        })
        .collect();
    Ok(json!({ "summaries": summaries }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "attendance.list" => attendance_list(state, req),
        "attendance.mark" => attendance_mark(state, req),
        "attendance.remove" => attendance_remove(state, req),
        "attendance.bulkMark" => attendance_bulk_mark(state, req),
        "attendance.summary" => attendance_summary(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
