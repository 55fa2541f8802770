use std::io::Write;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use serde_json::json;

use crate::ipc::{self, AppState, Request};

pub enum Job {
    Request(Request),
    /// A line that did not parse; answered in order with the other jobs.
    Malformed(String),
}

/// Starts the command worker. It owns the session state and the store
/// handle, runs one job at a time in arrival order and writes one response
/// line per job. Dropping the sender stops it; the join handle yields the
/// writer back.
pub fn spawn<W>(mut state: AppState, mut out: W) -> (Sender<Job>, JoinHandle<W>)
where
    W: Write + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Job>();
    let handle = thread::spawn(move || {
        for job in rx {
            let resp = match job {
                Job::Request(req) => ipc::handle_request(&mut state, req),
                Job::Malformed(message) => json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": message }
                }),
            };
            let line = serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string());
            if writeln!(out, "{}", line).and_then(|_| out.flush()).is_err() {
                tracing::warn!("response channel closed; stopping worker");
                break;
            }
        }
        out
    });
    (tx, handle)
}
