mod backup;
mod calc;
mod config;
mod db;
mod export;
mod grid;
mod groups;
mod ipc;
mod model;
mod notify;
mod repo;
mod settings;
mod timetable;

use std::io::{self, BufRead, Write};

use serde_json::json;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(filter: &str) {
    // stdout carries the protocol; logs go to stderr.
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn main() {
    let config = config::Config::from_env();
    init_logging(&config.log_filter);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        business_messaging = config.whatsapp.credentials().is_some(),
        "tuitiond starting"
    );

    let mut state = ipc::AppState::new(config);

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => {
                debug!(id = %req.id, method = %req.method, "request");
                ipc::handle_request(&mut state, req)
            }
            // Can't reply with an id.
            Err(e) => json!({
                "ok": false,
                "error": { "code": "bad_json", "message": e.to_string() },
            }),
        };
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    info!("tuitiond exiting");
}
