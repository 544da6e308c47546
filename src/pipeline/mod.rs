//! Pipeline orchestrator: one dump in, one canonical image and its feature vectors out.
//!
//! Plugins run concurrently on a bounded pool. Results are slotted by plugin index, so
//! the order tasks finish in never shows in the output. Parsing, normalization and
//! extraction start only after every plugin task has returned.

mod output;

pub use output::{load_features, load_image, load_verdict, persist, persist_verdict};

use crate::classify::{classify, Classifier, Explainer, Verdict};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::features::{FeatureExtractor, FeatureVector, Scope};
use crate::normalize::{CanonicalImage, Normalizer};
use crate::parser::{self, ParsedOutput, ParsedTables, TableStatus};
use crate::runner::{CancelToken, PluginResult, PluginRunner, ToolError};
use crate::storage::FeatureCache;
use crate::warning::Warning;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Dumps smaller than one page are rejected before any plugin runs.
pub const MIN_DUMP_BYTES: u64 = 4096;
/// Prefix of the dump hashed into its id.
const ID_PREFIX_BYTES: u64 = 1 << 20;

/// Per-plugin outcome, without timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginRun {
    pub plugin: String,
    pub exit_status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    pub table: TableStatus,
    pub rows: usize,
}

impl PluginRun {
    fn of(result: &PluginResult, parsed: &ParsedOutput) -> Self {
        Self {
            plugin: result.plugin.clone(),
            exit_status: result.exit_status,
            error: result.error.clone(),
            table: parsed.status,
            rows: parsed.rows.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub dump_id: String,
    pub dump_path: PathBuf,
    pub image: CanonicalImage,
    pub image_features: FeatureVector,
    pub process_features: Vec<FeatureVector>,
    pub warnings: Vec<Warning>,
    pub plugin_runs: Vec<PluginRun>,
    /// Cleaned per-plugin tables, in plugin order
    pub parsed: Vec<ParsedOutput>,
}

pub struct Pipeline {
    config: PipelineConfig,
    runner: Arc<PluginRunner>,
    cache: Option<FeatureCache>,
}

impl Pipeline {
    /// Build from config. A cache that cannot be opened is logged and disabled.
    pub fn new(config: PipelineConfig) -> Self {
        let cache = config.output.cache_path.as_deref().and_then(|path| {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!(path = %parent.display(), error = %e, "cannot create cache directory");
                }
            }
            match FeatureCache::open(path) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "feature cache disabled");
                    None
                }
            }
        });
        Self {
            runner: Arc::new(PluginRunner::new(config.tool.clone())),
            config,
            cache,
        }
    }

    pub fn with_cache(mut self, cache: FeatureCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&FeatureCache> {
        self.cache.as_ref()
    }

    /// Analyze with the configured plugin set and schema.
    pub async fn analyze_default(&self, dump: &Path, cancel: &CancelToken) -> PipelineResult<Analysis> {
        self.analyze(dump, &self.config.plugins, self.config.features.schema_version, cancel)
            .await
    }

    /// Run `plugins` against `dump` and build its image and feature vectors.
    ///
    /// Only a byte-level problem with the dump, an unknown schema or cancellation fails the
    /// run. Plugin failures become `missing_plugin` warnings and sentinel features.
    pub async fn analyze(
        &self,
        dump: &Path,
        plugins: &[String],
        schema_version: u16,
        cancel: &CancelToken,
    ) -> PipelineResult<Analysis> {
        let extractor = FeatureExtractor::new(schema_version)?;
        let dump_id = identify_dump(dump).await?;
        let plugins = dedup(plugins);
        info!(dump = %dump.display(), dump_id = %dump_id, plugins = plugins.len(), schema_version, "analysis started");
        for scope in [Scope::Image, Scope::Process] {
            let layout = extractor.schema().layout(scope);
            debug!(
                scope = ?layout.scope,
                features = layout.feature_count,
                layout_hash = %layout.hash,
                names = ?layout.feature_names,
                "feature layout"
            );
        }

        let scratch = tempfile::Builder::new().prefix("memfeat-").tempdir()?;
        let results = self.run_plugins(dump, &dump_id, &plugins, scratch.path(), cancel).await;
        if cancel.is_cancelled() {
            warn!(dump_id = %dump_id, "analysis cancelled; results discarded");
            return Err(PipelineError::Cancelled);
        }
        drop(scratch);

        let failed_plugins = results.iter().filter(|r| !r.is_ok()).count();
        let parsed: Vec<ParsedOutput> = results.iter().map(parser::parse).collect();
        let plugin_runs = results.iter().zip(&parsed).map(|(r, p)| PluginRun::of(r, p)).collect();
        let tables = ParsedTables::collect(&parsed);
        let image = Normalizer::new(plugins.iter().cloned()).normalize(&dump_id, &tables);
        let image_features = extractor.image(&image);
        let process_features = extractor.processes(&image);

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(&dump_id, &image_features, &process_features) {
                warn!(dump_id = %dump_id, error = %e, "feature cache write failed");
            }
        }

        info!(
            dump_id = %dump_id,
            processes = image.processes.len(),
            failed_plugins,
            warnings = image.extraction_warnings.len(),
            sentinels = image_features.sentinel_count(),
            "analysis complete"
        );
        Ok(Analysis {
            warnings: image.extraction_warnings.clone(),
            dump_id,
            dump_path: dump.to_path_buf(),
            image,
            image_features,
            process_features,
            plugin_runs,
            parsed,
        })
    }

    /// Analysis followed by classification of the image vector. A failed analysis never
    /// reaches the classifier.
    pub async fn analyze_and_classify(
        &self,
        dump: &Path,
        plugins: &[String],
        schema_version: u16,
        classifier: &dyn Classifier,
        explainer: &dyn Explainer,
        cancel: &CancelToken,
    ) -> PipelineResult<(Analysis, Verdict)> {
        let analysis = self.analyze(dump, plugins, schema_version, cancel).await?;
        let verdict = classify(classifier, explainer, &analysis.image_features)?;
        info!(
            dump_id = %analysis.dump_id,
            label = ?verdict.prediction.label,
            score = verdict.prediction.score,
            "dump classified"
        );
        Ok((analysis, verdict))
    }

    async fn run_plugins(
        &self,
        dump: &Path,
        dump_id: &str,
        plugins: &[String],
        workdir: &Path,
        cancel: &CancelToken,
    ) -> Vec<PluginResult> {
        let workers = self.config.runner.effective_workers();
        let timeout = Duration::from_secs(self.config.runner.timeout_secs);
        let semaphore = Arc::new(Semaphore::new(workers));
        debug!(workers, timeout_secs = timeout.as_secs(), "plugin pool");

        let mut set = JoinSet::new();
        for (index, plugin) in plugins.iter().enumerate() {
            let runner = Arc::clone(&self.runner);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let dump = dump.to_path_buf();
            let dump_id = dump_id.to_string();
            let plugin = plugin.clone();
            let workdir = workdir.to_path_buf();
            set.spawn(async move {
                let started = Instant::now();
                let permit = tokio::select! {
                    p = semaphore.acquire_owned() => p.ok(),
                    _ = cancel.cancelled() => None,
                };
                let result = match permit {
                    Some(_permit) => {
                        runner
                            .run(&dump, &dump_id, &plugin, timeout, Some(&workdir), &cancel)
                            .await
                    }
                    None => PluginResult::failed(&plugin, &dump_id, ToolError::Cancelled, started.elapsed()),
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<PluginResult>> = plugins.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => warn!(error = %e, "plugin task failed"),
            }
        }
        slots
            .into_iter()
            .zip(plugins)
            .map(|(slot, plugin)| {
                slot.unwrap_or_else(|| {
                    let err = ToolError::Io {
                        message: "plugin task aborted".to_string(),
                    };
                    PluginResult::failed(plugin, dump_id, err, Duration::ZERO)
                })
            })
            .collect()
    }
}

/// Deterministic dump id: SHA-256 over the file length and its first MiB.
pub async fn identify_dump(path: &Path) -> PipelineResult<String> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| PipelineError::fatal_input(path, e.to_string()))?;
    if !meta.is_file() {
        return Err(PipelineError::fatal_input(path, "not a regular file"));
    }
    if meta.len() < MIN_DUMP_BYTES {
        return Err(PipelineError::fatal_input(
            path,
            format!("{} bytes, smaller than one page", meta.len()),
        ));
    }

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| PipelineError::fatal_input(path, e.to_string()))?;
    let mut prefix = Vec::new();
    file.take(ID_PREFIX_BYTES)
        .read_to_end(&mut prefix)
        .await
        .map_err(|e| PipelineError::fatal_input(path, e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(meta.len().to_le_bytes());
    hasher.update(&prefix);
    Ok(hasher.finalize().iter().map(|b| format!("{b:02x}")).collect())
}

fn dedup(plugins: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    plugins.iter().filter(|p| seen.insert(p.as_str())).cloned().collect()
}
