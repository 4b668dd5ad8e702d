//! Workspace setup sections stored as JSON in the `settings` table.
//!
//! Each section has defaults; saved values are merged over them through the
//! same validator used for `setup.update` patches.

use crate::calc::BandThresholds;
use crate::db;
use crate::export::ReportOptions;
use crate::notify::Channel;
use crate::timetable::Policy;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupSection {
    Attendance,
    Notifications,
    Timetable,
    Reports,
}

impl SetupSection {
    pub const ALL: [SetupSection; 4] = [
        Self::Attendance,
        Self::Notifications,
        Self::Timetable,
        Self::Reports,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "attendance" => Some(Self::Attendance),
            "notifications" => Some(Self::Notifications),
            "timetable" => Some(Self::Timetable),
            "reports" => Some(Self::Reports),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Attendance => "attendance",
            Self::Notifications => "notifications",
            Self::Timetable => "timetable",
            Self::Reports => "reports",
        }
    }

    fn key(self) -> String {
        format!("setup.{}", self.name())
    }
}

pub fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Attendance => json!({
            "lowThreshold": 75,
            "highThreshold": 90
        }),
        SetupSection::Notifications => json!({
            "countryCode": crate::notify::DEFAULT_COUNTRY_CODE,
            "recentMarksCount": 5,
            "defaultChannel": "link"
        }),
        SetupSection::Timetable => json!({
            "policy": "fair",
            "seeded": true
        }),
        SetupSection::Reports => json!({
            "schoolName": "",
            "showGeneratedAt": true
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

pub fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Attendance => match k.as_str() {
                "lowThreshold" | "highThreshold" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 100)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            SetupSection::Notifications => match k.as_str() {
                "countryCode" => {
                    let s = parse_string_max(v, k, 4)?;
                    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
                        return Err("countryCode must be 1-4 digits".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "recentMarksCount" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 20)?));
                }
                "defaultChannel" => {
                    let s = parse_string_max(v, k, 16)?.to_ascii_lowercase();
                    if Channel::parse(&s).is_none() {
                        return Err("defaultChannel must be one of: link, business".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                _ => return Err(format!("unknown notifications field: {}", k)),
            },
            SetupSection::Timetable => match k.as_str() {
                "policy" => {
                    let s = parse_string_max(v, k, 16)?;
                    let Some(policy) = Policy::parse(&s) else {
                        return Err("policy must be one of: roundRobin, fair".into());
                    };
                    obj.insert(k.clone(), Value::String(policy.as_str().to_string()));
                }
                "seeded" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown timetable field: {}", k)),
            },
            SetupSection::Reports => match k.as_str() {
                "schoolName" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "showGeneratedAt" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown reports field: {}", k)),
            },
        }
    }
    if section == SetupSection::Attendance {
        let low = obj.get("lowThreshold").and_then(Value::as_i64).unwrap_or(75);
        let high = obj.get("highThreshold").and_then(Value::as_i64).unwrap_or(90);
        if low > high {
            return Err("lowThreshold must not exceed highThreshold".into());
        }
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, &section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed saved values fall back to defaults field by field.
            let mut merged = current.clone();
            if merge_section_patch(section, &mut merged, saved_obj).is_ok() {
                current = merged;
            }
        }
    }
    Ok(current)
}

/// Validates `patch` against the stored section and saves the result.
pub fn update_section(
    conn: &Connection,
    section: SetupSection,
    patch: &Map<String, Value>,
) -> anyhow::Result<Result<Value, String>> {
    let mut current = load_section(conn, section)?;
    if let Err(msg) = merge_section_patch(section, &mut current, patch) {
        return Ok(Err(msg));
    }
    db::settings_set_json(conn, &section.key(), &current)?;
    Ok(Ok(current))
}

pub fn band_thresholds(conn: &Connection) -> anyhow::Result<BandThresholds> {
    let v = load_section(conn, SetupSection::Attendance)?;
    let d = BandThresholds::default();
    Ok(BandThresholds {
        low_below: v["lowThreshold"].as_f64().unwrap_or(d.low_below),
        high_from: v["highThreshold"].as_f64().unwrap_or(d.high_from),
    })
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub country_code: String,
    pub recent_marks_count: usize,
    pub default_channel: Channel,
}

pub fn notification_settings(conn: &Connection) -> anyhow::Result<NotificationSettings> {
    let v = load_section(conn, SetupSection::Notifications)?;
    Ok(NotificationSettings {
        country_code: v["countryCode"]
            .as_str()
            .unwrap_or(crate::notify::DEFAULT_COUNTRY_CODE)
            .to_string(),
        recent_marks_count: v["recentMarksCount"].as_u64().unwrap_or(5) as usize,
        default_channel: v["defaultChannel"]
            .as_str()
            .and_then(Channel::parse)
            .unwrap_or(Channel::Link),
    })
}

pub fn timetable_settings(conn: &Connection) -> anyhow::Result<(Policy, bool)> {
    let v = load_section(conn, SetupSection::Timetable)?;
    let policy = v["policy"].as_str().and_then(Policy::parse).unwrap_or(Policy::Fair);
    Ok((policy, v["seeded"].as_bool().unwrap_or(true)))
}

pub fn report_options(conn: &Connection, today: chrono::NaiveDate) -> anyhow::Result<ReportOptions> {
    let v = load_section(conn, SetupSection::Reports)?;
    Ok(ReportOptions {
        school_name: v["schoolName"].as_str().unwrap_or("").to_string(),
        show_generated_at: v["showGeneratedAt"].as_bool().unwrap_or(true),
        generated_on: today,
    })
}
