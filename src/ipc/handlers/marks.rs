use crate::calc;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    get_opt_date, get_opt_i64, get_opt_str, get_required_str, parse_payload, require_db, today,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{NewMark, WeeklyTestMark, MAX_WEEK_NUMBER};
use crate::repo::{MarkFilter, Repository};
use chrono::Datelike;
use serde_json::{json, Value};
use tracing::info;

fn mark_json(m: &WeeklyTestMark) -> Value {
    let pct = m.percentage();
    let mut v = json!(m);
    v["percentage"] = json!(calc::round_1(pct));
    v["grade"] = json!(calc::grade_for(pct));
    v
}

fn marks_list(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let week_number = get_opt_i64(&req.params, "weekNumber")?
        .map(|w| u32::try_from(w).map_err(|_| HandlerErr::bad_params("weekNumber out of range")))
        .transpose()?;
    let year = get_opt_i64(&req.params, "year")?
        .map(|y| i32::try_from(y).map_err(|_| HandlerErr::bad_params("year out of range")))
        .transpose()?;
    let filter = MarkFilter {
        student_id: get_opt_str(&req.params, "studentId")?,
        subject: get_opt_str(&req.params, "subject")?,
        week_number,
        year,
    };
    let marks = Repository::new(conn).list_marks(&filter)?;
    Ok(json!({ "marks": marks.iter().map(mark_json).collect::<Vec<_>>() }))
}

fn marks_create(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let input: NewMark = parse_payload(&req.params, Some("mark"))?;
    let mark = Repository::new(conn)
        .create_mark(input)
        .map_err(|e| HandlerErr::store(e, "db_insert_failed"))?;
    info!(mark_id = %mark.id, student_id = %mark.student_id, "test mark recorded");
    Ok(json!({ "mark": mark_json(&mark) }))
}

fn marks_update(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let id = get_required_str(&req.params, "markId")?;
    let input: NewMark = parse_payload(&req.params, Some("mark"))?;
    let mark = Repository::new(conn)
        .update_mark(&id, input)
        .map_err(|e| HandlerErr::store(e, "db_update_failed"))?;
    Ok(json!({ "mark": mark_json(&mark) }))
}

fn marks_delete(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let id = get_required_str(&req.params, "markId")?;
    Repository::new(conn)
        .delete_mark(&id)
        .map_err(|e| HandlerErr::store(e, "db_delete_failed"))?;
    Ok(json!({ "deleted": true }))
}

fn marks_current_week(_state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let date = get_opt_date(&req.params, "date")?.unwrap_or_else(today);
    let week = date.iso_week();
    Ok(json!({
        "date": date,
        "weekNumber": week.week().min(MAX_WEEK_NUMBER),
        "isoWeek": week.week(),
        "year": week.year(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "marks.list" => marks_list(state, req),
        "marks.create" => marks_create(state, req),
        "marks.update" => marks_update(state, req),
        "marks.delete" => marks_delete(state, req),
        "marks.currentWeek" => marks_current_week(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
