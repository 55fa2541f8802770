use crate::backup;
use crate::ipc::error::err;
use crate::ipc::helpers::{require_admin, respond, str_param, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::session::Ctx;
use serde_json::{json, Value};
use std::path::PathBuf;

fn handle_backup_export(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    require_admin(state, req)?;
    let out_path = str_param(req, "outPath")?;
    let Some(workspace_path) = state.workspace.clone() else {
        return Err(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let out = PathBuf::from(&out_path);
    let export = backup::export_workspace_bundle(&workspace_path, &out).map_err(|e| {
        err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": out_path })),
        )
    })?;

    if let (Some(conn), Some(who)) = (state.db.as_ref(), state.session.as_ref()) {
        Ctx::new(conn, Some(who)).log("BACKUP_EXPORT", &format!("path={}", out_path));
    }
    Ok(json!({
        "path": out_path,
        "bundleFormat": export.bundle_format,
        "recordCounts": export.record_counts
    }))
}

fn handle_backup_import(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    require_admin(state, req)?;
    let in_path = str_param(req, "inPath")?;
    let Some(workspace_path) = state.workspace.clone() else {
        return Err(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return Err(err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        ));
    }

    // Close the store before its file is replaced; the restored accounts
    // may differ, so the session goes too.
    state.db = None;
    state.session = None;

    let import = backup::import_workspace_bundle(&src, &workspace_path);
    let reopened = super::core::open_workspace(state, &workspace_path);
    let import = import.map_err(|e| {
        err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": src.to_string_lossy() })),
        )
    })?;
    reopened.map_err(|e| err(&req.id, "db_open_failed", e.to_string(), None))?;

    tracing::info!(path = %in_path, format = %import.bundle_format_detected, "workspace restored");
    Ok(json!({
        "workspacePath": workspace_path.to_string_lossy(),
        "bundleFormatDetected": import.bundle_format_detected,
        "recordCounts": import.record_counts
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.export" => Some(respond(req, handle_backup_export(state, req))),
        "backup.import" => Some(respond(req, handle_backup_import(state, req))),
        _ => None,
    }
}
