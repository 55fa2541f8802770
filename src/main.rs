mod activity;
mod auth;
mod backup;
mod courses;
mod db;
mod domain;
mod enrollment;
mod error;
mod grading;
mod ipc;
mod payments;
mod session;
mod settings;
mod worker;

use std::io::{self, BufRead};
use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

fn init_tracing() {
    // stdout carries the protocol; diagnostics go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("registrard=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

fn main() {
    init_tracing();

    let mut state = ipc::AppState::default();
    if let Some(path) = std::env::var_os("REGISTRARD_WORKSPACE").map(PathBuf::from) {
        if let Err(e) = ipc::open_workspace(&mut state, &path) {
            tracing::warn!(error = ?e, workspace = %path.display(), "startup workspace not opened");
        }
    }

    let (jobs, worker) = worker::spawn(state, io::stdout());
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "registrard ready");

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let job = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => worker::Job::Request(req),
            // Can't reply with an id; the worker answers without one.
            Err(e) => worker::Job::Malformed(e.to_string()),
        };
        if jobs.send(job).is_err() {
            break;
        }
    }

    drop(jobs);
    if worker.join().is_err() {
        tracing::warn!("command worker panicked");
    }
}
