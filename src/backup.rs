use anyhow::{anyhow, bail, Context};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::db::{self, DB_FILE_NAME, SCHEMA_VERSION};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/registrar.sqlite3";
pub const BUNDLE_FORMAT_V1: &str = "registrar-workspace-v1";

/// What a bundle claims to contain. Import checks the restored store
/// against it before replacing anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub format: String,
    pub schema_version: i64,
    pub app_version: String,
    pub exported_at: String,
    pub record_counts: BTreeMap<String, i64>,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub record_counts: BTreeMap<String, i64>,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub record_counts: BTreeMap<String, i64>,
}

/// Opens a store file that must already exist.
fn open_existing(path: &Path) -> anyhow::Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open {}", path.to_string_lossy()))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Writes a consistent snapshot of the workspace store to `out_path`.
///
/// The snapshot is taken with `VACUUM INTO`, so rows still sitting in the
/// WAL are included and other sidecars can keep writing meanwhile.
pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE_NAME);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let snapshot = sibling(out_path, ".snapshot");
    if snapshot.exists() {
        std::fs::remove_file(&snapshot)
            .with_context(|| format!("failed to remove {}", snapshot.to_string_lossy()))?;
    }
    let written = write_bundle(&db_path, &snapshot, out_path);
    if let Err(e) = std::fs::remove_file(&snapshot) {
        tracing::debug!(error = %e, "snapshot cleanup skipped");
    }
    let manifest = written?;

    tracing::info!(
        path = %out_path.display(),
        users = manifest.record_counts.get("users").copied().unwrap_or(0),
        payments = manifest.record_counts.get("payments").copied().unwrap_or(0),
        "workspace bundle written"
    );
    Ok(ExportSummary {
        bundle_format: manifest.format,
        record_counts: manifest.record_counts,
    })
}

fn write_bundle(db_path: &Path, snapshot: &Path, out_path: &Path) -> anyhow::Result<Manifest> {
    {
        let src = open_existing(db_path)?;
        src.execute("VACUUM INTO ?", [snapshot.to_string_lossy().to_string()])
            .context("failed to snapshot workspace database")?;
    }
    let manifest = {
        let snap = open_existing(snapshot)?;
        Manifest {
            format: BUNDLE_FORMAT_V1.to_string(),
            schema_version: db::schema_version(&snap)?,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            exported_at: db::now_rfc3339(),
            record_counts: db::record_counts(&snap)?,
        }
    };

    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create output file {}", out_path.to_string_lossy()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(snapshot)
        .with_context(|| format!("failed to open snapshot {}", snapshot.to_string_lossy()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;
    zip.finish().context("failed to finalize zip bundle")?;
    Ok(manifest)
}

fn read_manifest(archive: &mut ZipArchive<File>) -> anyhow::Result<Manifest> {
    let mut text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut text)
        .context("failed to read manifest.json")?;
    let manifest: Manifest = serde_json::from_str(&text).context("manifest.json is invalid")?;
    if manifest.format != BUNDLE_FORMAT_V1 {
        bail!("unsupported bundle format: {}", manifest.format);
    }
    if manifest.schema_version != SCHEMA_VERSION {
        bail!(
            "bundle schema version {} does not match this build ({})",
            manifest.schema_version,
            SCHEMA_VERSION
        );
    }
    Ok(manifest)
}

/// The extracted store must be intact and hold exactly the records the
/// manifest lists.
fn verify_restored(path: &Path, manifest: &Manifest) -> anyhow::Result<()> {
    let conn = open_existing(path)?;
    let check: String = conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
    if check != "ok" {
        bail!("bundled database failed integrity check: {}", check);
    }
    let version = db::schema_version(&conn)?;
    if version != manifest.schema_version {
        bail!(
            "bundled database is schema version {}, manifest says {}",
            version,
            manifest.schema_version
        );
    }
    let counts = db::record_counts(&conn).context("bundled database is missing record tables")?;
    for (table, expected) in &manifest.record_counts {
        let found = counts.get(table).copied().unwrap_or(0);
        if found != *expected {
            bail!(
                "{} holds {} rows but the manifest lists {}",
                table,
                found,
                expected
            );
        }
    }
    Ok(())
}

/// Replaces the workspace database with the one inside `in_path`.
/// The caller must have closed its connection first. Nothing in the
/// workspace changes unless the bundle verifies.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;
    let dst = workspace_path.join(DB_FILE_NAME);

    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;
    let manifest = read_manifest(&mut archive)?;

    let tmp_dst = sibling(&dst, ".importing");
    if tmp_dst.exists() {
        std::fs::remove_file(&tmp_dst)
            .with_context(|| format!("failed to remove {}", tmp_dst.to_string_lossy()))?;
    }
    {
        let mut db_out = File::create(&tmp_dst).with_context(|| {
            format!(
                "failed to create temp database {}",
                tmp_dst.to_string_lossy()
            )
        })?;
        let mut db_entry = archive
            .by_name(DB_ENTRY)
            .context("bundle missing db/registrar.sqlite3")?;
        std::io::copy(&mut db_entry, &mut db_out).context("failed to extract database entry")?;
        db_out
            .flush()
            .context("failed to flush extracted database")?;
    }

    if let Err(e) = verify_restored(&tmp_dst, &manifest) {
        let _ = std::fs::remove_file(&tmp_dst);
        return Err(e);
    }

    // A WAL left from the old file must not be replayed onto the restored one.
    for suffix in ["-wal", "-shm"] {
        let side = sibling(&dst, suffix);
        if side.exists() {
            std::fs::remove_file(&side)
                .with_context(|| format!("failed to remove {}", side.to_string_lossy()))?;
        }
    }
    std::fs::rename(&tmp_dst, &dst).with_context(|| {
        format!(
            "failed to move extracted database to {}",
            dst.to_string_lossy()
        )
    })?;

    Ok(ImportSummary {
        bundle_format_detected: manifest.format,
        record_counts: manifest.record_counts,
    })
}
