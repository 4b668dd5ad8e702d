use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

fn handle_backup_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let out = PathBuf::from(&out_path);
    let export = match backup::export_workspace_bundle(&workspace_path, &out) {
        Ok(v) => v,
        Err(e) => {
            warn!(path = %out_path, error = %format!("{e:#}"), "backup export failed");
            return err(
                &req.id,
                "backup_failed",
                format!("{e:#}"),
                Some(json!({ "path": out_path })),
            );
        }
    };
    info!(path = %out_path, bytes = export.db_bytes, "workspace backup written");

    ok(
        &req.id,
        json!({
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "dbSha256": export.db_sha256,
            "dbBytes": export.db_bytes,
        }),
    )
}

fn handle_backup_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing inPath", None),
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Some(session) = state.grid.as_ref() {
        if session.grid.is_dirty() {
            return err(
                &req.id,
                "unsaved_changes",
                "save or discard attendance grid changes before restoring a backup",
                Some(json!({ "pendingCount": session.grid.pending_count() })),
            );
        }
    }

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }

    // Drop open handle before replacing file.
    state.db = None;
    state.grid = None;

    let imported = backup::import_workspace_bundle(&src, &workspace_path);
    let reopened = db::open_db(&workspace_path);

    match (imported, reopened) {
        (Ok(import), Ok(conn)) => {
            state.db = Some(conn);
            info!(path = %in_path, "workspace restored from backup");
            ok(
                &req.id,
                json!({
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormat": import.bundle_format,
                    "exportedAt": import.exported_at,
                }),
            )
        }
        (Err(e), reopened) => {
            state.db = reopened.ok();
            warn!(path = %in_path, error = %format!("{e:#}"), "backup import failed");
            err(
                &req.id,
                "backup_failed",
                format!("{e:#}"),
                Some(json!({ "path": src.to_string_lossy() })),
            )
        }
        (Ok(_), Err(e)) => err(&req.id, "db_open_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.export" => Some(handle_backup_export(state, req)),
        "backup.import" => Some(handle_backup_import(state, req)),
        _ => None,
    }
}
