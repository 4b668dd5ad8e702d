use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{get_opt_str, get_required_str, parse_payload, require_db, to_json};
use crate::ipc::types::{AppState, Request};
use crate::model::{NewStudent, StudentPatch};
use crate::repo::{Repository, StoreError, StudentFilter};
use serde_json::{json, Value};
use tracing::info;

fn students_list(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let filter = StudentFilter {
        class: get_opt_str(&req.params, "class")?,
        search: get_opt_str(&req.params, "search")?,
    };
    let students = Repository::new(conn).list_students(&filter)?;
    Ok(json!({ "students": to_json(&students)? }))
}

fn students_get(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let id = get_required_str(&req.params, "studentId")?;
    let student = Repository::new(conn).get_student(&id)?;
    Ok(json!({ "student": to_json(&student)? }))
}

fn students_create(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let input: NewStudent = parse_payload(&req.params, Some("student"))?;
    let student = Repository::new(conn)
        .create_student(input)
        .map_err(|e| HandlerErr::store(e, "db_insert_failed"))?;
    info!(student_id = %student.id, class = %student.class, "student created");
    Ok(json!({ "student": to_json(&student)? }))
}

fn students_update(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let id = get_required_str(&req.params, "studentId")?;
    let patch: StudentPatch = parse_payload(&req.params, Some("patch"))?;
    let student = Repository::new(conn)
        .update_student(&id, patch)
        .map_err(|e| HandlerErr::store(e, "db_update_failed"))?;
    Ok(json!({ "student": to_json(&student)? }))
}

fn students_delete(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let id = get_required_str(&req.params, "studentId")?;
    if let Some(session) = state.grid.as_ref() {
        if session.grid.students().iter().any(|s| s.id == id) && session.grid.is_dirty() {
            return Err(HandlerErr::new(
                "unsaved_changes",
                "the attendance grid has unsaved changes for this class",
            ));
        }
    }
    let conn = require_db(state)?;
    Repository::new(conn)
        .delete_student(&id)
        .map_err(|e| HandlerErr::store(e, "db_delete_failed"))?;
    info!(student_id = %id, "student deleted");
    Ok(json!({ "deleted": true }))
}

fn staff_list(state: &mut AppState, _req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let staff = Repository::new(conn).list_staff()?;
    Ok(json!({ "staff": to_json(&staff)? }))
}

fn staff_create(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let full_name = get_required_str(&req.params, "fullName")?;
    let email = get_required_str(&req.params, "email")?;
    let staff = Repository::new(conn)
        .create_staff(&full_name, &email)
        .map_err(|e| match e {
            StoreError::Db(rusqlite::Error::SqliteFailure(f, _))
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                HandlerErr::new("validation_failed", "a staff member with this email already exists")
                    .with_details(json!({ "field": "email" }))
            }
            other => HandlerErr::store(other, "db_insert_failed"),
        })?;
    Ok(json!({ "staff": to_json(&staff)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => students_list(state, req),
        "students.get" => students_get(state, req),
        "students.create" => students_create(state, req),
        "students.update" => students_update(state, req),
        "students.delete" => students_delete(state, req),
        "staff.list" => staff_list(state, req),
        "staff.create" => staff_create(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
