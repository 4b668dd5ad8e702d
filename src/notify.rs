//! Parent progress messages: text rendering, WhatsApp deep links and the Business API client.

use crate::calc::{attendance_band, AttendanceBand, AttendanceSummary, BandThresholds};
use crate::config::WhatsAppConfig;
use crate::export::{display_date, display_number};
use crate::model::{Student, WeeklyTestMark};
use chrono::NaiveDate;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::Write as _;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_COUNTRY_CODE: &str = "91";
pub const DEEP_LINK_BASE: &str = "https://wa.me";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("WhatsApp Business API credentials not configured")]
    NotConfigured,
    #[error("{0} has no parent phone number")]
    MissingPhone(String),
    #[error("invalid phone number: {0}")]
    InvalidPhone(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("WhatsApp API error ({status}): {body}")]
    Api { status: u16, body: String },
}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

pub fn progress_message(
    student: &Student,
    attendance: &AttendanceSummary,
    recent: &[WeeklyTestMark],
    today: NaiveDate,
) -> String {
    let mut marks = String::from("📝 *Recent Test Marks*");
    if recent.is_empty() {
        marks.push_str("\nNo recent test marks available");
    }
    for m in recent {
        let _ = write!(
            marks,
            "\n• {} (Week {}): {}/{} ({:.1}%)",
            m.subject,
            m.week_number,
            display_number(m.marks_obtained),
            display_number(m.total_marks),
            m.percentage()
        );
    }

    format!(
        "🎓 *Student Progress Report*\n\n\
         *Student:* {name}\n\
         *Class:* {class}\n\n\
         📊 *Attendance Summary*\n\
         Total Days: {total}\n\
         Present Days: {present}\n\
         Attendance Percentage: {pct:.1}%\n\n\
         {marks}\n\n\
         📱 Generated from School Management System\n\
         📅 Date: {date}",
        name = student.name,
        class = student.class,
        total = attendance.total_days,
        present = attendance.present_days,
        pct = attendance.percentage,
        marks = marks,
        date = display_date(today),
    )
}

/// Digits only, prefixed with the country code unless already present.
pub fn normalize_phone(raw: &str, country_code: &str) -> Result<String, NotifyError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 6 {
        return Err(NotifyError::InvalidPhone(raw.to_string()));
    }
    let cc: String = country_code.chars().filter(|c| c.is_ascii_digit()).collect();
    if cc.is_empty() || digits.starts_with(&cc) {
        Ok(digits)
    } else {
        Ok(format!("{cc}{digits}"))
    }
}

pub fn deep_link(phone: &str, message: &str) -> String {
    format!("{}/{}?text={}", DEEP_LINK_BASE, phone, urlencoding::encode(message))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Link,
    Business,
}

impl Channel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "link" => Some(Self::Link),
            "business" => Some(Self::Business),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Link => "link",
            Self::Business => "business",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub provider_message_id: Option<String>,
}

/// Outbound transport for rendered messages.
pub trait MessageSender {
    fn send_text(&self, to: &str, body: &str) -> Result<SentMessage, NotifyError>;

    fn send_document(
        &self,
        to: &str,
        file_name: &str,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<SentMessage, NotifyError>;
}

pub struct BusinessApiClient {
    client: Client,
    api_base: String,
    access_token: String,
    phone_number_id: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<MessageId>,
}

#[derive(Debug, Deserialize)]
struct MessageId {
    id: String,
}

impl BusinessApiClient {
    pub fn new(cfg: &WhatsAppConfig) -> Result<Self, NotifyError> {
        let (token, phone_number_id) = cfg.credentials().ok_or(NotifyError::NotConfigured)?;
        let client = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| NotifyError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_base: cfg.api_base.clone(),
            access_token: token.to_string(),
            phone_number_id: phone_number_id.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}/{}", self.api_base, self.phone_number_id, path)
    }

    fn read_json(resp: reqwest::blocking::Response) -> Result<serde_json::Value, NotifyError> {
        let status = resp.status();
        let body = resp.text()?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "whatsapp api rejected request");
            return Err(NotifyError::Api {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| NotifyError::Network(format!("bad response: {e}")))
    }

    fn post_message(&self, payload: serde_json::Value) -> Result<SentMessage, NotifyError> {
        let resp = self
            .client
            .post(self.endpoint("messages"))
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()?;
        let parsed: MessagesResponse = serde_json::from_value(Self::read_json(resp)?)
            .map_err(|e| NotifyError::Network(format!("bad response: {e}")))?;
        let id = parsed.messages.into_iter().next().map(|m| m.id);
        debug!(message_id = ?id, "whatsapp message accepted");
        Ok(SentMessage {
            provider_message_id: id,
        })
    }

    fn upload_media(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, NotifyError> {
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("application/pdf")?;
        let form = Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", "application/pdf")
            .part("file", part);
        let resp = self
            .client
            .post(self.endpoint("media"))
            .bearer_auth(&self.access_token)
            .multipart(form)
            .send()?;
        Self::read_json(resp)?
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| NotifyError::Network("media upload returned no id".to_string()))
    }
}

impl MessageSender for BusinessApiClient {
    fn send_text(&self, to: &str, body: &str) -> Result<SentMessage, NotifyError> {
        self.post_message(json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "text",
            "text": { "body": body },
        }))
    }

    fn send_document(
        &self,
        to: &str,
        file_name: &str,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<SentMessage, NotifyError> {
        let media_id = self.upload_media(file_name, bytes)?;
        self.post_message(json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "document",
            "document": { "id": media_id, "filename": file_name, "caption": caption },
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BandFilter {
    All,
    Band(AttendanceBand),
    Custom { min: f64, max: f64 },
}

impl BandFilter {
    pub fn parse(band: Option<&str>, min: Option<f64>, max: Option<f64>) -> Option<Self> {
        Some(match band.unwrap_or("all") {
            "all" => Self::All,
            "low" => Self::Band(AttendanceBand::Low),
            "medium" => Self::Band(AttendanceBand::Medium),
            "high" => Self::Band(AttendanceBand::High),
            "custom" => Self::Custom {
                min: min.unwrap_or(0.0),
                max: max.unwrap_or(100.0),
            },
            _ => return None,
        })
    }

    pub fn matches(self, percentage: f64, thresholds: BandThresholds) -> bool {
        match self {
            Self::All => true,
            Self::Band(b) => attendance_band(percentage, thresholds) == b,
            Self::Custom { min, max } => percentage >= min && percentage <= max,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub student_id: String,
    pub student_name: String,
    pub class: String,
    pub parent_phone: String,
    pub attendance_percentage: f64,
    pub band: AttendanceBand,
}

/// Students with a parent phone whose attendance falls in `filter`.
pub fn select_recipients(
    students: &[Student],
    summaries: &[AttendanceSummary],
    class: Option<&str>,
    filter: BandFilter,
    thresholds: BandThresholds,
) -> Vec<Recipient> {
    students
        .iter()
        .zip(summaries)
        .filter(|(s, _)| class.map_or(true, |c| s.class == c))
        .filter_map(|(s, summary)| {
            let phone = s.parent_phone.as_deref()?.trim();
            if phone.is_empty() || !filter.matches(summary.percentage, thresholds) {
                return None;
            }
            Some(Recipient {
                student_id: s.id.clone(),
                student_name: s.name.clone(),
                class: s.class.clone(),
                parent_phone: phone.to_string(),
                attendance_percentage: summary.percentage,
                band: attendance_band(summary.percentage, thresholds),
            })
        })
        .collect()
}

/// A rendered message ready for one parent.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub student_name: String,
    pub phone: String,
    pub text: String,
    pub attachment: Option<(String, Vec<u8>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub channel: Channel,
    pub link: Option<String>,
    pub provider_message_id: Option<String>,
}

pub fn deliver(
    prepared: Prepared,
    channel: Channel,
    sender: Option<&dyn MessageSender>,
) -> Result<Delivery, NotifyError> {
    match channel {
        Channel::Link => Ok(Delivery {
            channel,
            link: Some(deep_link(&prepared.phone, &prepared.text)),
            provider_message_id: None,
        }),
        Channel::Business => {
            let sender = sender.ok_or(NotifyError::NotConfigured)?;
            let sent = match prepared.attachment {
                Some((file_name, bytes)) => {
                    let caption = format!("Progress report for {}", prepared.student_name);
                    sender.send_document(&prepared.phone, &file_name, bytes, &caption)?
                }
                None => sender.send_text(&prepared.phone, &prepared.text)?,
            };
            Ok(Delivery {
                channel,
                link: None,
                provider_message_id: sent.provider_message_id,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Gender;
    use std::cell::RefCell;

    fn student(id: &str, class: &str, phone: Option<&str>) -> Student {
        Student {
            id: id.to_string(),
            name: format!("Student {id}"),
            class: class.to_string(),
            subjects: vec!["Maths".to_string()],
            gender: Gender::Female,
            parent_phone: phone.map(str::to_string),
            school_name: None,
            assigned_staff_id: None,
        }
    }

    fn summary(id: &str, total: usize, present: usize) -> AttendanceSummary {
        AttendanceSummary {
            student_id: id.to_string(),
            student_name: String::new(),
            total_days: total,
            present_days: present,
            percentage: crate::calc::percentage_of(present, total),
        }
    }

    #[derive(Default)]
    struct FakeSender {
        sent: RefCell<Vec<(String, String)>>,
    }

    impl MessageSender for FakeSender {
        fn send_text(&self, to: &str, body: &str) -> Result<SentMessage, NotifyError> {
            self.sent.borrow_mut().push((to.to_string(), body.to_string()));
            Ok(SentMessage {
                provider_message_id: Some("wamid.1".to_string()),
            })
        }

        fn send_document(
            &self,
            to: &str,
            file_name: &str,
            _bytes: Vec<u8>,
            _caption: &str,
        ) -> Result<SentMessage, NotifyError> {
            self.sent.borrow_mut().push((to.to_string(), file_name.to_string()));
            Ok(SentMessage {
                provider_message_id: Some("wamid.doc".to_string()),
            })
        }
    }

    #[test]
    fn message_keeps_field_order_and_labels() {
        let s = student("1", "10", None);
        let mark = WeeklyTestMark {
            id: "m".into(),
            student_id: "1".into(),
            subject: "Physics".into(),
            week_number: 12,
            year: 2026,
            marks_obtained: 18.0,
            total_marks: 20.0,
            test_date: NaiveDate::from_ymd_opt(2026, 3, 20).unwrap(),
            remarks: None,
        };
        let today = NaiveDate::from_ymd_opt(2026, 3, 28).unwrap();
        let text = progress_message(&s, &summary("1", 10, 8), &[mark], today);
        assert!(text.starts_with("🎓 *Student Progress Report*\n\n*Student:* Student 1\n*Class:* 10\n\n"));
        assert!(text.contains("Total Days: 10\nPresent Days: 8\nAttendance Percentage: 80.0%"));
        assert!(text.contains("• Physics (Week 12): 18/20 (90.0%)"));
        assert!(text.ends_with("📅 Date: 28/03/2026"));

        let text = progress_message(&s, &summary("1", 0, 0), &[], today);
        assert!(text.contains("No recent test marks available"));
        assert!(text.contains("Attendance Percentage: 0.0%"));
    }

    #[test]
    fn phones_get_country_code_once() {
        assert_eq!(normalize_phone("98765 43210", "91").unwrap(), "919876543210");
        assert_eq!(normalize_phone("+91 98765-43210", "91").unwrap(), "919876543210");
        assert!(normalize_phone("n/a", "91").is_err());
    }

    #[test]
    fn deep_link_encodes_text() {
        let link = deep_link("919876543210", "Hi *there*\nok");
        assert_eq!(link, "https://wa.me/919876543210?text=Hi%20%2Athere%2A%0Aok");
    }

    #[test]
    fn recipients_need_a_phone_and_matching_band() {
        let students = vec![
            student("1", "10", Some("9876543210")),
            student("2", "10", None),
            student("3", "10", Some("9876500000")),
            student("4", "9", Some("9876511111")),
        ];
        let summaries = vec![
            summary("1", 10, 6),
            summary("2", 10, 5),
            summary("3", 10, 10),
            summary("4", 10, 5),
        ];
        let t = BandThresholds::default();
        let low = select_recipients(
            &students,
            &summaries,
            Some("10"),
            BandFilter::parse(Some("low"), None, None).unwrap(),
            t,
        );
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].student_id, "1");

        let all = select_recipients(&students, &summaries, None, BandFilter::All, t);
        assert_eq!(all.len(), 3);

        let custom = BandFilter::parse(Some("custom"), Some(90.0), None).unwrap();
        let high = select_recipients(&students, &summaries, None, custom, t);
        assert_eq!(high[0].student_id, "3");
        assert!(BandFilter::parse(Some("weird"), None, None).is_none());
    }

    #[test]
    fn business_channel_uses_sender_and_link_does_not() {
        let fake = FakeSender::default();
        let prepared = Prepared {
            student_name: "Anu".into(),
            phone: "919876543210".into(),
            text: "hello".into(),
            attachment: None,
        };
        let d = deliver(prepared.clone(), Channel::Business, Some(&fake)).unwrap();
        assert_eq!(d.provider_message_id.as_deref(), Some("wamid.1"));
        let d = deliver(prepared.clone(), Channel::Link, Some(&fake)).unwrap();
        assert!(d.link.unwrap().starts_with("https://wa.me/919876543210?text=hello"));
        assert_eq!(fake.sent.borrow().len(), 1);

        let err = deliver(prepared, Channel::Business, None).unwrap_err();
        assert!(matches!(err, NotifyError::NotConfigured));
    }
}
