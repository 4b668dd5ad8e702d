use crate::calc;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::exports::summary_pdf;
use crate::ipc::helpers::{
    get_opt_bool, get_opt_f64, get_opt_str, get_required_str, get_str_list, require_db, to_json,
    today,
};
use crate::ipc::types::{AppState, Request};
use crate::model::Student;
use crate::notify::{
    self, BandFilter, BusinessApiClient, Channel, MessageSender, NotifyError, Prepared,
};
use crate::repo::{AttendanceFilter, OutboundMessage, Repository, StudentFilter};
use crate::settings::{self, NotificationSettings};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::{info, warn};

fn notification_settings(conn: &Connection) -> Result<NotificationSettings, HandlerErr> {
    settings::notification_settings(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn render_message(
    conn: &Connection,
    student: &Student,
    cfg: &NotificationSettings,
) -> Result<String, HandlerErr> {
    let repo = Repository::new(conn);
    let records = repo.list_attendance(&AttendanceFilter {
        student_ids: Some(vec![student.id.clone()]),
        ..Default::default()
    })?;
    let recent = repo.recent_marks(&student.id, cfg.recent_marks_count)?;
    let summary = calc::attendance_summary_for(&records, student);
    Ok(notify::progress_message(student, &summary, &recent, today()))
}

fn parent_phone(student: &Student, cfg: &NotificationSettings) -> Result<String, NotifyError> {
    let raw = student
        .parent_phone
        .as_deref()
        .ok_or_else(|| NotifyError::MissingPhone(student.name.clone()))?;
    notify::normalize_phone(raw, &cfg.country_code)
}

fn notify_preview(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let student = Repository::new(conn).get_student(&student_id)?;
    let cfg = notification_settings(conn)?;
    let message = render_message(conn, &student, &cfg)?;
    let phone = parent_phone(&student, &cfg).ok();
    let link = phone.as_deref().map(|p| notify::deep_link(p, &message));
    Ok(json!({
        "studentId": student.id,
        "message": message,
        "phone": phone,
        "link": link,
    }))
}

fn notify_recipients(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let repo = Repository::new(conn);
    let class = get_opt_str(&req.params, "class")?;
    let band = get_opt_str(&req.params, "band")?;
    let filter = BandFilter::parse(
        band.as_deref(),
        get_opt_f64(&req.params, "min")?,
        get_opt_f64(&req.params, "max")?,
    )
    .ok_or_else(|| HandlerErr::bad_params("band must be one of: all, low, medium, high, custom"))?;

    let students = repo.list_students(&StudentFilter {
        class: class.clone(),
        search: None,
    })?;
    let records = repo.list_attendance(&AttendanceFilter {
        student_ids: Some(students.iter().map(|s| s.id.clone()).collect()),
        ..Default::default()
    })?;
    let summaries = calc::attendance_summaries(&records, &students);
    let thresholds = settings::band_thresholds(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let recipients =
        notify::select_recipients(&students, &summaries, class.as_deref(), filter, thresholds);
    Ok(json!({ "recipients": to_json(&recipients)? }))
}

fn notify_send(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let cfg = notification_settings(conn)?;
    let student_ids = get_str_list(&req.params, "studentIds")?;
    let channel = match get_opt_str(&req.params, "channel")? {
        Some(raw) => Channel::parse(&raw)
            .ok_or_else(|| HandlerErr::bad_params("channel must be one of: link, business"))?,
        None => cfg.default_channel,
    };
    let attachment = get_opt_bool(&req.params, "attachment")?.unwrap_or(false);

    let client = match channel {
        Channel::Business => Some(BusinessApiClient::new(&state.config.whatsapp)?),
        Channel::Link => None,
    };
    let sender = client.as_ref().map(|c| c as &dyn MessageSender);
    let report_opts = if attachment && channel == Channel::Business {
        Some(
            settings::report_options(conn, today())
                .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?,
        )
    } else {
        None
    };

    let repo = Repository::new(conn);
    let mut outcomes = Vec::new();
    let mut succeeded = 0usize;
    for id in &student_ids {
        let result = send_one(conn, &repo, id, channel, sender, report_opts.as_ref(), &cfg);
        match result {
            Ok(v) => {
                succeeded += 1;
                outcomes.push(v);
            }
            Err(e) => {
                warn!(student_id = %id, code = e.code, "notification not sent");
                outcomes.push(json!({
                    "studentId": id,
                    "ok": false,
                    "error": { "code": e.code, "message": e.message },
                }));
            }
        }
    }
    let failed = student_ids.len() - succeeded;
    info!(channel = channel.as_str(), succeeded, failed, "parent notifications processed");
    Ok(json!({
        "channel": channel,
        "succeeded": succeeded,
        "failed": failed,
        "outcomes": outcomes,
    }))
}

fn send_one(
    conn: &Connection,
    repo: &Repository<'_>,
    student_id: &str,
    channel: Channel,
    sender: Option<&dyn MessageSender>,
    report_opts: Option<&crate::export::ReportOptions>,
    cfg: &NotificationSettings,
) -> Result<Value, HandlerErr> {
    let student = repo.get_student(student_id)?;
    let phone = parent_phone(&student, cfg)?;
    let text = render_message(conn, &student, cfg)?;
    let attachment = match report_opts {
        Some(opts) => Some((
            crate::export::summary_file_name(&student),
            summary_pdf(conn, &student, opts, cfg.recent_marks_count)?,
        )),
        None => None,
    };
    let delivery = notify::deliver(
        Prepared {
            student_name: student.name.clone(),
            phone: phone.clone(),
            text: text.clone(),
            attachment,
        },
        channel,
        sender,
    )?;

    if channel == Channel::Business {
        // The message went out; a failed log write is reported but not retried.
        if let Err(e) = repo.log_message(&OutboundMessage {
            phone_number: &phone,
            message: &text,
            student_name: Some(&student.name),
            status: "sent",
            provider_message_id: delivery.provider_message_id.as_deref(),
        }) {
            warn!(student_id = %student.id, error = %e, "failed to log outbound message");
        }
    }

    Ok(json!({
        "studentId": student.id,
        "ok": true,
        "phone": phone,
        "link": delivery.link,
        "messageId": delivery.provider_message_id,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "notify.preview" => notify_preview(state, req),
        "notify.recipients" => notify_recipients(state, req),
        "notify.send" => notify_send(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
