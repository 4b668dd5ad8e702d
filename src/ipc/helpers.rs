use crate::ipc::error::HandlerErr;
use crate::ipc::types::AppState;
use crate::model::parse_date;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Absent, null and blank strings all read as `None`.
pub fn get_opt_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok((!t.is_empty()).then(|| t.to_string()))
        }
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_opt_date(params: &Value, key: &'static str) -> Result<Option<NaiveDate>, HandlerErr> {
    match get_opt_str(params, key)? {
        None => Ok(None),
        Some(raw) => Ok(Some(parse_date(key, &raw)?)),
    }
}

pub fn get_required_date(params: &Value, key: &'static str) -> Result<NaiveDate, HandlerErr> {
    get_opt_date(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn get_opt_f64(params: &Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key))),
    }
}

pub fn get_opt_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn get_str_list(params: &Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let arr = params
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an array", key)))?;
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.trim().to_string())
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must contain strings", key)))
        })
        .collect()
}

/// Deserializes a camelCase payload from `params[key]` (or `params` itself when `key` is `None`).
pub fn parse_payload<T: DeserializeOwned>(params: &Value, key: Option<&str>) -> Result<T, HandlerErr> {
    let raw = match key {
        Some(k) => params
            .get(k)
            .cloned()
            .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", k)))?,
        None => params.clone(),
    };
    serde_json::from_value(raw).map_err(|e| HandlerErr::bad_params(e.to_string()))
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, HandlerErr> {
    serde_json::to_value(value).map_err(|e| HandlerErr::new("internal_error", e.to_string()))
}
