use crate::grid::GridError;
use crate::model::ValidationError;
use crate::notify::NotifyError;
use crate::repo::StoreError;
use serde_json::json;
use tracing::warn;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Error half of a handler result; rendered into the response envelope by
/// [`respond`].
#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    /// Maps a store failure, using `db_code` for database errors.
    pub fn store(e: StoreError, db_code: &'static str) -> Self {
        match e {
            StoreError::NotFound(what) => Self::new("not_found", format!("{what} not found")),
            StoreError::Validation(v) => v.into(),
            StoreError::Db(e) => {
                warn!(code = db_code, error = %e, "store call failed");
                Self::new(db_code, e.to_string())
            }
        }
    }
}

impl From<StoreError> for HandlerErr {
    fn from(e: StoreError) -> Self {
        Self::store(e, "db_query_failed")
    }
}

impl From<ValidationError> for HandlerErr {
    fn from(e: ValidationError) -> Self {
        Self::new("validation_failed", e.message.clone()).with_details(json!({ "field": e.field }))
    }
}

impl From<GridError> for HandlerErr {
    fn from(e: GridError) -> Self {
        match e {
            GridError::UnsavedChanges { count } => Self::new("unsaved_changes", e.to_string())
                .with_details(json!({ "pendingCount": count })),
            GridError::OutsideMonth { .. } | GridError::UnknownStudent(_) => {
                Self::bad_params(e.to_string())
            }
        }
    }
}

impl From<NotifyError> for HandlerErr {
    fn from(e: NotifyError) -> Self {
        match e {
            NotifyError::NotConfigured => Self::new("notify_not_configured", e.to_string()),
            NotifyError::MissingPhone(_) | NotifyError::InvalidPhone(_) => {
                Self::new("validation_failed", e.to_string())
                    .with_details(json!({ "field": "parentPhone" }))
            }
            NotifyError::Network(_) | NotifyError::Api { .. } => {
                warn!(error = %e, "notification failed");
                Self::new("notify_failed", e.to_string())
            }
        }
    }
}

pub fn respond(id: &str, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}
