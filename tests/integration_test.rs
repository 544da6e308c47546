//! Integration tests: the full pipeline against a fake extraction tool (a shell script
//! that prints canned plugin output), persisted documents, classification.
#![cfg(unix)]

use chrono::{TimeZone, Utc};
use memfeat::classify::{ClassifyError, Classifier, Contribution, Explainer, LinearModel, Prediction};
use memfeat::config::{PipelineConfig, RunnerConfig, ToolConfig};
use memfeat::features::{self, FeatureVector, Scope, SENTINEL};
use memfeat::parser::registry::{DLLLIST, HANDLES, PSLIST, PSSCAN};
use memfeat::parser::{ArtifactKind, TableStatus};
use memfeat::pipeline::{self, Pipeline};
use memfeat::runner::{CancelToken, ToolError};
use memfeat::{PipelineError, PluginRunner, Warning};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const PSLIST_OUT: &str = "Volatility 3 Framework 2.5.0\n\
\n\
PID\tPPID\tImageFileName\tOffset(V)\tThreads\tHandles\tSessionId\tWow64\tCreateTime\tExitTime\tFile output\n\
\n\
4\t0\tSystem\t0xfa8000c9e040\t92\t545\tN/A\tFalse\t2019-12-14 10:36:23.000000 UTC\tN/A\tDisabled\n\
304\t4\tsmss.exe\t0xfa8001a3b040\t2\t29\tN/A\tFalse\t2019-12-14 10:36:24.000000 UTC\tN/A\tDisabled\n\
600\t304\tcsrss.exe\t0xfa8001c1e060\t9\t410\t0\tFalse\t2019-12-14 10:36:30.000000 UTC\tN/A\tDisabled\n";

/// One handle of a listed process, one of pid 4242 which no process list reports.
const HANDLES_OUT: &str = "Volatility 3 Framework 2.5.0\n\
\n\
PID\tProcess\tOffset\tHandleValue\tType\tGrantedAccess\tName\n\
\n\
600\tcsrss.exe\t0xfa8001c1f000\t0x4\tFile\t0x100020\t\\Device\\HarddiskVolume1\n\
4242\tghost.exe\t0xfa8001c1f100\t0x8\tKey\t0x20019\tMACHINE\\SOFTWARE\n";

/// Same pid, parent and name as the pslist entry, created one second later.
const PSSCAN_OUT: &str = "Volatility 3 Framework 2.5.0\n\
\n\
PID\tPPID\tImageFileName\tOffset(V)\tThreads\tHandles\tSessionId\tWow64\tCreateTime\tExitTime\tFile output\n\
\n\
600\t304\tcsrss.exe\t0x7e1c1e060\t9\t410\t0\tFalse\t2019-12-14 10:36:31.000000 UTC\tN/A\tDisabled\n";

const DLLLIST_OUT: &str = "Volatility 3 Framework 2.5.0\n\
\n\
PID\tProcess\tBase\tSize\tName\tPath\tLoadTime\tFile output\n\
\n\
600\tcsrss.exe\t0x4a0a0000\t0x6000\tcsrss.exe\tC:\\Windows\\system32\\csrss.exe\tN/A\tDisabled\n\
7777\tgone.exe\t0x10000000\t0x1000\tgone.dll\tC:\\gone.dll\tN/A\tDisabled\n\
8888\tgone2.exe\t0x10000000\t0x1000\tgone2.dll\tC:\\gone2.dll\tN/A\tDisabled\n";

struct Fixture {
    dir: TempDir,
    dump: PathBuf,
    script: PathBuf,
}

impl Fixture {
    /// `cases`: plugin name → shell commands run for it. Unknown plugins exit 1.
    fn new(cases: &[(&str, String)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("host.mem");
        let bytes: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&dump, bytes).unwrap();

        let mut script = String::from("for last; do plugin=\"$last\"; done\ncase \"$plugin\" in\n");
        for (plugin, body) in cases {
            script.push_str(&format!("{plugin})\n{body}\n;;\n"));
        }
        script.push_str("*)\necho \"unsupported plugin $plugin\" >&2\nexit 1\n;;\nesac\n");
        let path = dir.path().join("fake-vol.sh");
        std::fs::write(&path, script).unwrap();
        Self { dir, dump, script: path }
    }

    fn config(&self, timeout_secs: u64) -> PipelineConfig {
        PipelineConfig {
            tool: ToolConfig {
                program: PathBuf::from("/bin/sh"),
                args: vec![self.script.display().to_string()],
                output_flag: None,
            },
            runner: RunnerConfig {
                timeout_secs,
                workers: 2,
            },
            ..PipelineConfig::default()
        }
    }

    fn out_dir(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

fn emit(output: &str) -> String {
    format!("cat <<'OUT'\n{output}OUT")
}

fn plugins(names: &[&str]) -> Vec<String> {
    names.iter().map(|p| p.to_string()).collect()
}

fn read_dir_sorted(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| {
            let e = e.unwrap();
            (e.file_name().to_string_lossy().into_owned(), std::fs::read(e.path()).unwrap())
        })
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn orphan_handle_is_counted_not_dropped() {
    let fx = Fixture::new(&[(PSLIST, emit(PSLIST_OUT)), (HANDLES, emit(HANDLES_OUT))]);
    let pipeline = Pipeline::new(fx.config(30));
    let analysis = pipeline
        .analyze(&fx.dump, &plugins(&[PSLIST, HANDLES]), 2, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(analysis.image.processes.len(), 3);
    let orphans: Vec<_> = analysis.warnings.iter().filter(|w| w.is_orphan()).collect();
    assert_eq!(orphans.len(), 1);
    assert!(matches!(
        orphans[0],
        Warning::OrphanReference { pid: Some(4242), artifact: ArtifactKind::Handles, .. }
    ));
    assert_eq!(analysis.image.unresolved.handles.len(), 1);
    assert_eq!(analysis.image_features.get("graph.unresolved_handles"), Some(1.0));
    assert_eq!(analysis.image_features.get("handles.nhandles"), Some(2.0));
    assert!(analysis.plugin_runs.iter().all(|r| r.error.is_none()));
}

#[tokio::test]
async fn timed_out_plugin_becomes_missing_with_sentinels() {
    let fx = Fixture::new(&[(PSLIST, emit(PSLIST_OUT)), (HANDLES, "sleep 30".to_string())]);
    let pipeline = Pipeline::new(fx.config(1));
    let started = Instant::now();
    let analysis = pipeline
        .analyze(&fx.dump, &plugins(&[PSLIST, HANDLES]), 2, &CancelToken::new())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(20));

    let run = analysis.plugin_runs.iter().find(|r| r.plugin == HANDLES).unwrap();
    assert_eq!(run.error, Some(ToolError::Timeout { secs: 1 }));
    assert!(analysis
        .warnings
        .contains(&Warning::MissingPlugin { plugin: HANDLES.to_string() }));

    let f = &analysis.image_features;
    for feature in f.features.iter().filter(|x| x.name.starts_with("handles.")) {
        assert_eq!(feature.value, SENTINEL, "{}", feature.name);
    }
    assert_eq!(f.get("graph.unresolved_handles"), Some(SENTINEL));
    assert_eq!(f.get("pslist.nproc"), Some(3.0));
    assert_eq!(analysis.process_features.len(), 3);
}

struct CountingModel {
    calls: AtomicUsize,
}

impl Classifier for CountingModel {
    fn predict(&self, _: &FeatureVector) -> Result<Prediction, ClassifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Prediction {
            label: memfeat::classify::Label::Benign,
            score: 0.0,
        })
    }
}

impl Explainer for CountingModel {
    fn explain(&self, _: &FeatureVector) -> Result<Vec<Contribution>, ClassifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn non_utf8_output_is_a_plugin_failure_not_a_fatal_one() {
    let garbled = format!("{}\nprintf '\\377\\376 broken\\n'", emit(PSLIST_OUT));
    let fx = Fixture::new(&[(PSLIST, garbled), (HANDLES, emit(HANDLES_OUT))]);

    let runner = PluginRunner::new(fx.config(30).tool);
    let result = runner
        .run(&fx.dump, "dump", PSLIST, Duration::from_secs(30), None, &CancelToken::new())
        .await;
    assert_eq!(result.exit_status, Some(0));
    assert_eq!(result.error, Some(ToolError::InvalidEncoding));
    assert!(result.raw_output.contains("smss.exe"));
    assert!(result.raw_output.contains('\u{FFFD}'));

    let pipeline = Pipeline::new(fx.config(30));
    let analysis = pipeline
        .analyze(&fx.dump, &plugins(&[PSLIST, HANDLES]), 2, &CancelToken::new())
        .await
        .unwrap();
    let run = analysis.plugin_runs.iter().find(|r| r.plugin == PSLIST).unwrap();
    assert_eq!(run.error, Some(ToolError::InvalidEncoding));
    assert_eq!(run.table, TableStatus::ToolFailed);
    assert!(analysis
        .warnings
        .contains(&Warning::MissingPlugin { plugin: PSLIST.to_string() }));
    assert_eq!(analysis.image_features.get("pslist.nproc"), Some(SENTINEL));
    assert_eq!(analysis.image_features.get("handles.nhandles"), Some(2.0));
}

#[tokio::test]
async fn unreadable_dump_is_fatal_and_never_classified() {
    let fx = Fixture::new(&[(PSLIST, emit(PSLIST_OUT))]);
    let truncated = fx.dir.path().join("truncated.raw");
    std::fs::write(&truncated, b"MDMP").unwrap();
    let model = CountingModel {
        calls: AtomicUsize::new(0),
    };
    let pipeline = Pipeline::new(fx.config(30));

    for dump in [truncated, fx.dir.path().join("missing.vmem")] {
        let err = pipeline
            .analyze_and_classify(&dump, &plugins(&[PSLIST]), 2, &model, &model, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::FatalInput { .. }), "{err}");
    }
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn same_process_seen_one_second_apart_is_merged() {
    let fx = Fixture::new(&[(PSLIST, emit(PSLIST_OUT)), (PSSCAN, emit(PSSCAN_OUT))]);
    let pipeline = Pipeline::new(fx.config(30));
    let analysis = pipeline
        .analyze(&fx.dump, &plugins(&[PSLIST, PSSCAN]), 2, &CancelToken::new())
        .await
        .unwrap();

    let csrss: Vec<_> = analysis.image.processes_by_pid(600).collect();
    assert_eq!(csrss.len(), 1);
    assert_eq!(
        csrss[0].create_time,
        Some(Utc.with_ymd_and_hms(2019, 12, 14, 10, 36, 31).unwrap())
    );
    assert!(csrss[0].sources.contains(PSLIST) && csrss[0].sources.contains(PSSCAN));
    assert_eq!(analysis.image.warnings_of("ambiguous_process_identity").count(), 0);
    assert_eq!(analysis.image.processes.len(), 3);
}

#[tokio::test]
async fn identical_runs_persist_identical_bytes() {
    let fx = Fixture::new(&[
        (PSLIST, emit(PSLIST_OUT)),
        (HANDLES, emit(HANDLES_OUT)),
        (DLLLIST, emit(DLLLIST_OUT)),
    ]);
    let pipeline = Pipeline::new(fx.config(30));
    let set = plugins(&[PSLIST, HANDLES, DLLLIST, PSSCAN]);

    let first = pipeline.analyze(&fx.dump, &set, 2, &CancelToken::new()).await.unwrap();
    let second = pipeline.analyze(&fx.dump, &set, 2, &CancelToken::new()).await.unwrap();
    let a = pipeline::persist(&first, &fx.out_dir("a")).unwrap();
    let b = pipeline::persist(&second, &fx.out_dir("b")).unwrap();

    assert_eq!(a.file_name(), b.file_name());
    let files = read_dir_sorted(&a);
    let names: Vec<_> = files.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "features_image.json",
            "features_process.json",
            "image.json",
            "runs.json",
            "warnings.json",
            "windows.dlllist.json",
            "windows.handles.json",
            "windows.pslist.json",
            "windows.psscan.json",
        ]
    );
    assert_eq!(files, read_dir_sorted(&b));
}

#[tokio::test]
async fn shape_is_fixed_even_when_every_plugin_fails() {
    let fx = Fixture::new(&[]);
    let pipeline = Pipeline::new(fx.config(30));
    for version in features::schema::versions() {
        let analysis = pipeline
            .analyze(&fx.dump, &plugins(&[PSLIST, HANDLES]), version, &CancelToken::new())
            .await
            .unwrap();
        let schema = features::schema(version).unwrap();
        let f = &analysis.image_features;
        assert_eq!(f.names().collect::<Vec<_>>(), schema.names(Scope::Image));
        assert_eq!(f.layout_hash, schema.layout_hash(Scope::Image));
        assert_eq!(f.get("pslist.nproc"), Some(SENTINEL));
        assert!(f.features.iter().all(|x| x.value.is_finite()));
        assert!(analysis.process_features.is_empty());
        assert_eq!(analysis.image.warnings_of("missing_plugin").count(), 2);
    }
}

#[tokio::test]
async fn every_warning_reaches_the_persisted_documents() {
    let malformed = format!("{PSLIST_OUT}900\t4\tbroken.exe\n777\t4\tbad.exe\t0x1\tmany\t1\t0\tFalse\tN/A\tN/A\tDisabled\n");
    let fx = Fixture::new(&[
        (PSLIST, emit(&malformed)),
        (HANDLES, emit(HANDLES_OUT)),
        (DLLLIST, "echo 'Volatility 3 Framework 2.5.0'\necho 'Unsatisfied requirement'".to_string()),
    ]);
    let pipeline = Pipeline::new(fx.config(30));
    let analysis = pipeline
        .analyze(&fx.dump, &plugins(&[PSLIST, HANDLES, DLLLIST, PSSCAN]), 2, &CancelToken::new())
        .await
        .unwrap();

    let kinds: Vec<_> = analysis.warnings.iter().map(Warning::kind).collect();
    for expected in ["malformed_row", "invalid_value", "header_not_found", "missing_plugin", "orphan_reference"] {
        assert!(kinds.contains(&expected), "{expected} not in {kinds:?}");
    }
    assert_eq!(analysis.image.warnings_of("missing_plugin").count(), 1);

    let dir = pipeline::persist(&analysis, &fx.out_dir("out")).unwrap();
    let persisted: Vec<Warning> =
        serde_json::from_str(&std::fs::read_to_string(dir.join("warnings.json")).unwrap()).unwrap();
    assert_eq!(persisted, analysis.warnings);
    assert_eq!(pipeline::load_image(&dir).unwrap().extraction_warnings, analysis.warnings);
}

#[tokio::test]
async fn orphans_stay_on_the_image() {
    let fx = Fixture::new(&[
        (PSLIST, emit(PSLIST_OUT)),
        (HANDLES, emit(HANDLES_OUT)),
        (DLLLIST, emit(DLLLIST_OUT)),
    ]);
    let pipeline = Pipeline::new(fx.config(30));
    let analysis = pipeline
        .analyze(&fx.dump, &plugins(&[PSLIST, HANDLES, DLLLIST]), 2, &CancelToken::new())
        .await
        .unwrap();
    let image = &analysis.image;

    for kind in [ArtifactKind::Handles, ArtifactKind::Modules] {
        let count = image.count(kind);
        let warned = analysis
            .warnings
            .iter()
            .filter(|w| matches!(w, Warning::OrphanReference { artifact, .. } if *artifact == kind))
            .count();
        assert_eq!(count.orphaned, warned, "{kind:?}");
        assert_eq!(count.total, count.resolved + count.orphaned, "{kind:?}");
    }
    assert_eq!(image.unresolved.modules.len(), 2);
    assert_eq!(image.unresolved.handles.len(), 1);
    assert_eq!(analysis.image_features.get("graph.unresolved_modules"), Some(2.0));
}

#[tokio::test]
async fn cancellation_discards_the_run() {
    let fx = Fixture::new(&[(PSLIST, "sleep 30".to_string()), (HANDLES, "sleep 30".to_string())]);
    let pipeline = Pipeline::new(fx.config(60));
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = pipeline
        .analyze(&fx.dump, &plugins(&[PSLIST, HANDLES]), 2, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(20));
}

#[tokio::test]
async fn classified_analysis_with_cache_and_linear_model() {
    let fx = Fixture::new(&[(PSLIST, emit(PSLIST_OUT)), (HANDLES, emit(HANDLES_OUT))]);
    let model: LinearModel = serde_json::from_str(
        r#"{"schema_version": 2, "bias": -2.0, "weights": {"graph.unresolved_handles": 3.0, "pslist.nproc": 0.1}}"#,
    )
    .unwrap();
    let cache = memfeat::FeatureCache::open_in_memory().unwrap();
    let pipeline = Pipeline::new(fx.config(30)).with_cache(cache);

    let (analysis, verdict) = pipeline
        .analyze_and_classify(&fx.dump, &plugins(&[PSLIST, HANDLES]), 2, &model, &model, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(verdict.key_id, analysis.dump_id);
    assert_eq!(verdict.prediction.label, memfeat::classify::Label::Malware);
    assert_eq!(verdict.contributions[0].feature_name, "graph.unresolved_handles");

    let cached = pipeline.cache().unwrap().vectors(&analysis.dump_id, 2).unwrap();
    assert_eq!(cached.len(), 1 + analysis.process_features.len());
    assert_eq!(cached[0], analysis.image_features);
}

#[test]
fn config_defaults_when_file_missing() {
    let c = PipelineConfig::load(Path::new("nonexistent-memfeat.json"));
    assert_eq!(c.features.schema_version, features::CURRENT_SCHEMA_VERSION);
    assert_eq!(c.plugins.len(), memfeat::parser::registry::DEFAULT_PLUGINS.len());
    assert!(c.assistant.endpoint.is_none());
}
