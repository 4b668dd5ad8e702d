use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type Handler = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const HANDLERS: &[Handler] = &[
    handlers::core::try_handle,
    handlers::students::try_handle,
    handlers::attendance::try_handle,
    handlers::marks::try_handle,
    handlers::grid::try_handle,
    handlers::analytics::try_handle,
    handlers::groups::try_handle,
    handlers::exports::try_handle,
    handlers::notify::try_handle,
    handlers::setup::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    for handler in HANDLERS {
        if let Some(resp) = handler(state, &req) {
            return resp;
        }
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
