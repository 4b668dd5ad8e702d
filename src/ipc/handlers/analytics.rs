use crate::calc;
use crate::groups::derive_groups;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{get_opt_date, get_opt_str, get_required_str, require_db, to_json, today};
use crate::ipc::types::{AppState, Request};
use crate::model::AttendanceStatus;
use crate::repo::{AttendanceFilter, MarkFilter, Repository, StudentFilter};
use crate::settings;
use crate::timetable::{next_saturday, weekend_tests};
use chrono::Duration;
use serde_json::{json, Value};
use std::collections::HashSet;

fn analytics_class(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let repo = Repository::new(conn);
    let class = get_opt_str(&req.params, "class")?;
    let subject = get_opt_str(&req.params, "subject")?;

    let students = repo.list_students(&StudentFilter {
        class: class.clone(),
        search: None,
    })?;
    let ids: HashSet<&str> = students.iter().map(|s| s.id.as_str()).collect();
    let marks: Vec<_> = repo
        .list_marks(&MarkFilter {
            subject: subject.clone(),
            ..Default::default()
        })?
        .into_iter()
        .filter(|m| ids.contains(m.student_id.as_str()))
        .collect();

    let performance = calc::class_performance(&marks, students.len());
    Ok(json!({
        "class": class,
        "subject": subject,
        "performance": to_json(&performance)?,
    }))
}

fn analytics_student(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let repo = Repository::new(conn);
    let student_id = get_required_str(&req.params, "studentId")?;
    let student = repo.get_student(&student_id)?;

    let marks = repo.list_marks(&MarkFilter {
        student_id: Some(student_id.clone()),
        ..Default::default()
    })?;
    let records = repo.list_attendance(&AttendanceFilter {
        student_ids: Some(vec![student_id.clone()]),
        ..Default::default()
    })?;
    let trend = calc::student_trend(&marks, &student_id);
    let attendance = calc::attendance_summary_for(&records, &student);
    let thresholds = settings::band_thresholds(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({
        "student": to_json(&student)?,
        "attendance": to_json(&attendance)?,
        "attendanceBand": calc::attendance_band(attendance.percentage, thresholds),
        "trend": to_json(&trend)?,
        "grade": calc::grade_for(trend.average_percentage),
    }))
}

fn dashboard_stats(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let repo = Repository::new(conn);
    let date = get_opt_date(&req.params, "date")?.unwrap_or_else(today);

    let students = repo.list_students(&StudentFilter::default())?;
    let groups = derive_groups(&students);
    let all_records = repo.list_attendance(&AttendanceFilter::default())?;
    let todays: Vec<_> = all_records.iter().filter(|r| r.date == date).collect();
    let present_today = todays
        .iter()
        .filter(|r| r.status == AttendanceStatus::Present)
        .count();
    let marked_today = todays.len();
    let overall_present = all_records
        .iter()
        .filter(|r| r.status == AttendanceStatus::Present)
        .count();

    let saturday = next_saturday(date);
    let weekend_end = saturday + Duration::days(1);
    let upcoming_tests = weekend_tests(&groups, date)
        .into_iter()
        .filter(|t| t.date <= weekend_end)
        .count();

    Ok(json!({
        "date": date,
        "totalStudents": students.len(),
        "totalGroups": groups.len(),
        "today": {
            "present": present_today,
            "absent": marked_today - present_today,
            "marked": marked_today,
            "attendanceRate": calc::round_1(calc::percentage_of(present_today, marked_today)),
        },
        "overallAttendanceRate": calc::round_1(calc::percentage_of(overall_present, all_records.len())),
        "upcomingWeekend": saturday,
        "upcomingTests": upcoming_tests,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "analytics.class" => analytics_class(state, req),
        "analytics.student" => analytics_student(state, req),
        "dashboard.stats" => dashboard_stats(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
