//! Persisted analysis documents under `<out_dir>/<dump_id>/`.
//!
//! Every document is pretty JSON with a trailing newline, written to a temporary file in
//! the same directory and renamed into place. Identical analyses produce identical bytes.

use super::Analysis;
use crate::classify::Verdict;
use crate::error::PipelineResult;
use crate::features::FeatureVector;
use crate::normalize::CanonicalImage;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

pub const IMAGE_FILE: &str = "image.json";
pub const IMAGE_FEATURES_FILE: &str = "features_image.json";
pub const PROCESS_FEATURES_FILE: &str = "features_process.json";
pub const WARNINGS_FILE: &str = "warnings.json";
pub const RUNS_FILE: &str = "runs.json";
pub const VERDICT_FILE: &str = "verdict.json";

/// Write every document of `analysis`; returns the analysis directory.
pub fn persist(analysis: &Analysis, out_dir: &Path) -> PipelineResult<PathBuf> {
    let dir = out_dir.join(&analysis.dump_id);
    std::fs::create_dir_all(&dir)?;

    for table in &analysis.parsed {
        write_json(&dir, &format!("{}.json", file_stem(&table.plugin)), table)?;
    }
    write_json(&dir, IMAGE_FILE, &analysis.image)?;
    write_json(&dir, IMAGE_FEATURES_FILE, &analysis.image_features)?;
    write_json(&dir, PROCESS_FEATURES_FILE, &analysis.process_features)?;
    write_json(&dir, WARNINGS_FILE, &analysis.warnings)?;
    write_json(&dir, RUNS_FILE, &analysis.plugin_runs)?;

    info!(dir = %dir.display(), tables = analysis.parsed.len(), "analysis persisted");
    Ok(dir)
}

pub fn persist_verdict(dir: &Path, verdict: &Verdict) -> PipelineResult<()> {
    write_json(dir, VERDICT_FILE, verdict)
}

pub fn load_image(dir: &Path) -> PipelineResult<CanonicalImage> {
    read_json(&dir.join(IMAGE_FILE))
}

/// Image vector and process vectors, as persisted.
pub fn load_features(dir: &Path) -> PipelineResult<(FeatureVector, Vec<FeatureVector>)> {
    Ok((
        read_json(&dir.join(IMAGE_FEATURES_FILE))?,
        read_json(&dir.join(PROCESS_FEATURES_FILE))?,
    ))
}

/// Verdict, if the analysis was classified.
pub fn load_verdict(dir: &Path) -> PipelineResult<Option<Verdict>> {
    let path = dir.join(VERDICT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    read_json(&path).map(Some)
}

/// Plugin names become file names; anything outside `[A-Za-z0-9._-]` is replaced.
fn file_stem(plugin: &str) -> String {
    plugin
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}

fn write_json<T: Serialize + ?Sized>(dir: &Path, name: &str, value: &T) -> PipelineResult<()> {
    let mut body = serde_json::to_vec_pretty(value)?;
    body.push(b'\n');
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(name)).map_err(|e| e.error)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> PipelineResult<T> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
