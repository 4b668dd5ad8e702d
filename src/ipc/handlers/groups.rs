use crate::groups::{derive_groups, Group};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{get_opt_date, get_opt_str, get_required_str, require_db, to_json, today};
use crate::ipc::types::{AppState, Request};
use crate::repo::{Repository, StudentFilter};
use crate::settings;
use crate::timetable::{self, Cohort, Policy};
use rand::thread_rng;
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::debug;

/// Groups are derived on every call; nothing about them is stored.
pub(crate) fn load_groups(conn: &Connection, class: Option<String>) -> Result<Vec<Group>, HandlerErr> {
    let students = Repository::new(conn).list_students(&StudentFilter {
        class,
        search: None,
    })?;
    Ok(derive_groups(&students))
}

fn find_group(groups: Vec<Group>, group_id: &str) -> Result<Group, HandlerErr> {
    groups
        .into_iter()
        .find(|g| g.id == group_id)
        .ok_or_else(|| HandlerErr::new("not_found", format!("group {group_id} not found")))
}

fn groups_list(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let groups = load_groups(conn, get_opt_str(&req.params, "class")?)?;
    Ok(json!({ "groups": to_json(&groups)? }))
}

fn groups_get(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let group_id = get_required_str(&req.params, "groupId")?;
    let group = find_group(load_groups(conn, None)?, &group_id)?;
    Ok(json!({ "group": to_json(&group)? }))
}

fn timetable_generate(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let (default_policy, seeded) = settings::timetable_settings(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let policy = match get_opt_str(&req.params, "policy")? {
        Some(raw) => Policy::parse(&raw)
            .ok_or_else(|| HandlerErr::bad_params("policy must be one of: roundRobin, fair"))?,
        None => default_policy,
    };
    let week_of = get_opt_date(&req.params, "week")?.unwrap_or_else(today);

    let cohort = match (
        get_opt_str(&req.params, "groupId")?,
        get_opt_str(&req.params, "class")?,
    ) {
        (Some(group_id), _) => Cohort::from_group(&find_group(load_groups(conn, None)?, &group_id)?),
        (None, Some(class)) => Cohort::from_class(&class, &load_groups(conn, Some(class.clone()))?),
        (None, None) => return Err(HandlerErr::bad_params("missing groupId or class")),
    };

    let table = if seeded {
        timetable::generate(&cohort, policy, week_of, &mut timetable::seeded_rng(&cohort.id, week_of))
    } else {
        timetable::generate(&cohort, policy, week_of, &mut thread_rng())
    };
    debug!(cohort = %cohort.id, policy = policy.as_str(), seeded, "timetable generated");
    Ok(json!({
        "timetable": to_json(&table)?,
        "timeSlots": timetable::TIME_SLOTS,
        "seeded": seeded,
    }))
}

fn tests_schedule(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let from = get_opt_date(&req.params, "from")?.unwrap_or_else(today);
    let mut groups = load_groups(conn, None)?;
    if let Some(group_id) = get_opt_str(&req.params, "groupId")? {
        groups = vec![find_group(groups, &group_id)?];
    }
    let sittings = timetable::weekend_tests(&groups, from);
    Ok(json!({
        "from": from,
        "weekend": timetable::next_saturday(from),
        "tests": to_json(&sittings)?,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "groups.list" => groups_list(state, req),
        "groups.get" => groups_get(state, req),
        "timetable.generate" => timetable_generate(state, req),
        "tests.schedule" => tests_schedule(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
