use crate::ipc::error::{db_err, err};
use crate::ipc::helpers::{bad_params, ctx, require_admin, require_db, respond, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::settings::{self, SetupError, SetupSection};
use serde_json::{json, Map, Value};

fn handle_setup_get(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let conn = require_db(state, req)?;
    let mut out = Map::new();
    for section in SetupSection::ALL {
        let v = settings::section_json(conn, section).map_err(|e| db_err(&req.id, e))?;
        out.insert(section.name().to_string(), v);
    }
    Ok(Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    require_admin(state, req)?;
    let ctx = ctx(state, req)?;
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return Err(bad_params(req, "missing section"));
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return Err(bad_params(req, "unknown section"));
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(bad_params(req, "patch must be an object"));
    };

    match settings::update_section(ctx.conn, section, patch_obj) {
        Ok(merged) => {
            ctx.log("SETUP_UPDATE", &format!("section={}", section.name()));
            Ok(json!({ "section": section.name(), "value": merged }))
        }
        Err(SetupError::Invalid(msg)) => Err(bad_params(req, msg)),
        Err(SetupError::Store(e)) => Err(err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "kind": "persistence" })),
        )),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(respond(req, handle_setup_get(state, req))),
        "setup.update" => Some(respond(req, handle_setup_update(state, req))),
        _ => None,
    }
}
