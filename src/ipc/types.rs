use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::domain::Identity;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Everything one sidecar session owns. Only the command worker touches it.
#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub session: Option<Identity>,
}
