use crate::grid::{AttendanceGrid, YearMonth};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{get_opt_str, get_required_date, get_required_str, require_db, to_json};
use crate::ipc::types::{AppState, GridSession, Request};
use crate::model::{AttendanceRecord, Student};
use crate::repo::{AttendanceFilter, Repository, StudentFilter};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::info;

fn parse_month(params: &Value) -> Result<YearMonth, HandlerErr> {
    let raw = get_required_str(params, "month")?;
    YearMonth::parse(&raw).ok_or_else(|| HandlerErr::bad_params("month must be YYYY-MM"))
}

fn load_month(
    conn: &Connection,
    month: YearMonth,
    class: Option<&str>,
    search: Option<&str>,
) -> Result<(Vec<Student>, Vec<AttendanceRecord>), HandlerErr> {
    let repo = Repository::new(conn);
    let students = repo.list_students(&StudentFilter {
        class: class.map(str::to_string),
        search: search.map(str::to_string),
    })?;
    let records = repo.list_attendance(&AttendanceFilter {
        student_ids: Some(students.iter().map(|s| s.id.clone()).collect()),
        from: Some(month.first_day()),
        to: Some(month.last_day()),
    })?;
    Ok((students, records))
}

fn session(state: &AppState) -> Result<&GridSession, HandlerErr> {
    state
        .grid
        .as_ref()
        .ok_or_else(|| HandlerErr::bad_params("no attendance grid is open; call grid.open first"))
}

fn session_mut(state: &mut AppState) -> Result<&mut GridSession, HandlerErr> {
    state
        .grid
        .as_mut()
        .ok_or_else(|| HandlerErr::bad_params("no attendance grid is open; call grid.open first"))
}

fn grid_state_json(grid: &AttendanceGrid) -> Result<Value, HandlerErr> {
    let days = grid.days();
    let rows = grid
        .students()
        .iter()
        .map(|s| {
            let cells: Vec<String> = days
                .iter()
                .map(|d| grid.status_at(&s.id, *d).code().to_string())
                .collect();
            Ok(json!({
                "student": { "id": s.id, "name": s.name, "class": s.class },
                "cells": cells,
                "stats": to_json(&grid.month_stats(&s.id))?,
            }))
        })
        .collect::<Result<Vec<_>, HandlerErr>>()?;
    Ok(json!({
        "month": grid.month().to_string(),
        "days": days
            .iter()
            .map(|d| json!({ "date": d, "weekday": d.format("%a").to_string() }))
            .collect::<Vec<_>>(),
        "rows": rows,
        "dirty": grid.is_dirty(),
        "pendingCount": grid.pending_count(),
    }))
}

fn grid_open(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let month = parse_month(&req.params)?;
    if let Some(s) = state.grid.as_ref() {
        s.grid.navigate(month)?;
    }
    let class = get_opt_str(&req.params, "class")?;
    let search = get_opt_str(&req.params, "search")?;
    let conn = require_db(state)?;
    let (students, records) = load_month(conn, month, class.as_deref(), search.as_deref())?;
    let grid = AttendanceGrid::load(month, students, &records);
    let payload = grid_state_json(&grid)?;
    info!(month = %month, students = grid.students().len(), "attendance grid opened");
    state.grid = Some(GridSession {
        grid,
        class,
        search,
    });
    Ok(payload)
}

fn grid_cycle(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(&req.params, "studentId")?;
    let date = get_required_date(&req.params, "date")?;
    let s = session_mut(state)?;
    let status = s.grid.cycle(&student_id, date)?;
    Ok(json!({
        "studentId": student_id,
        "date": date,
        "status": status,
        "code": status.code().to_string(),
        "stats": to_json(&s.grid.month_stats(&student_id))?,
        "dirty": s.grid.is_dirty(),
        "pendingCount": s.grid.pending_count(),
    }))
}

fn grid_navigate(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let current = session(state)?;
    let target = match get_opt_str(&req.params, "direction")?.as_deref() {
        Some("next") => current.grid.month().next(),
        Some("prev") => current.grid.month().prev(),
        Some(_) => return Err(HandlerErr::bad_params("direction must be next or prev")),
        None => parse_month(&req.params)?,
    };
    current.grid.navigate(target)?;
    let (class, search) = (current.class.clone(), current.search.clone());

    let conn = require_db(state)?;
    let (students, records) = load_month(conn, target, class.as_deref(), search.as_deref())?;
    let s = session_mut(state)?;
    s.grid.reload(target, students, &records)?;
    grid_state_json(&s.grid)
}

fn grid_save(state: &mut AppState, _req: &Request) -> Result<Value, HandlerErr> {
    session(state)?;
    require_db(state)?;
    // Disjoint borrows: the store reads `db` while the grid buffer is mutated.
    let AppState {
        db: Some(conn),
        grid: Some(s),
        ..
    } = state
    else {
        return Err(HandlerErr::bad_params("no attendance grid is open"));
    };
    let mut repo = Repository::new(conn);
    let report = s.grid.flush(&mut repo);
    info!(
        applied = report.applied,
        failed = report.failed.len(),
        "attendance grid saved"
    );
    Ok(json!({
        "applied": report.applied,
        "failed": to_json(&report.failed)?,
        "state": grid_state_json(&s.grid)?,
    }))
}

fn grid_discard(state: &mut AppState, _req: &Request) -> Result<Value, HandlerErr> {
    let s = session_mut(state)?;
    let discarded = s.grid.discard();
    Ok(json!({
        "discarded": discarded,
        "state": grid_state_json(&s.grid)?,
    }))
}

fn grid_state(state: &mut AppState, _req: &Request) -> Result<Value, HandlerErr> {
    grid_state_json(&session(state)?.grid)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "grid.open" => grid_open(state, req),
        "grid.cycle" => grid_cycle(state, req),
        "grid.navigate" => grid_navigate(state, req),
        "grid.save" => grid_save(state, req),
        "grid.discard" => grid_discard(state, req),
        "grid.state" => grid_state(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
