//! memfeat entrypoint.
//!
//! `memfeat analyze [DUMP]` runs the pipeline on one dump (default: newest dump in the
//! configured dumps directory), persists the documents and prints a one-line summary.
//! `memfeat ask <ANALYSIS_DIR> [QUESTION...]` asks the configured assistant about a
//! persisted analysis; without a question it reads questions from stdin.

use memfeat::{
    assistant::{Assistant, ConversationContext, OllamaAssistant},
    classify::{LinearModel, Verdict},
    config::PipelineConfig,
    logging::StructuredLogger,
    pipeline::{self, Pipeline},
    runner::CancelToken,
};
use serde_json::json;
use std::error::Error;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};
use walkdir::WalkDir;

type CliResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

const USAGE: &str = "usage: memfeat [analyze [DUMP] | ask <ANALYSIS_DIR> [QUESTION...]]";
const DUMP_EXTENSIONS: &[&str] = &["mem", "raw", "vmem"];

/// Most recently modified dump under `dir`.
fn newest_dump(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|x| x.to_str())
                .map(|x| DUMP_EXTENSIONS.iter().any(|d| x.eq_ignore_ascii_case(d)))
                .unwrap_or(false)
        })
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, e.into_path()))
        })
        .max()
        .map(|(_, path)| path)
}

fn analyze(config: PipelineConfig, dump: Option<PathBuf>) -> CliResult<()> {
    let dump = match dump {
        Some(path) => path,
        None => newest_dump(&config.output.dumps_dir)
            .ok_or_else(|| format!("no dump found in {}", config.output.dumps_dir.display()))?,
    };
    let model = config
        .classifier
        .model_path
        .as_deref()
        .map(LinearModel::load)
        .transpose()?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || cancel.cancel()) {
            warn!(error = %e, "cannot install Ctrl+C handler");
        }
    }

    let output_dir = config.output.output_dir.clone();
    let plugins = config.plugins.clone();
    let schema_version = config.features.schema_version;
    let pipeline = Pipeline::new(config);
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let (analysis, verdict): (_, Option<Verdict>) = runtime.block_on(async {
        match &model {
            Some(m) => pipeline
                .analyze_and_classify(&dump, &plugins, schema_version, m, m, &cancel)
                .await
                .map(|(a, v)| (a, Some(v))),
            None => pipeline.analyze_default(&dump, &cancel).await.map(|a| (a, None)),
        }
    })?;

    let dir = pipeline::persist(&analysis, &output_dir)?;
    if let Some(v) = &verdict {
        pipeline::persist_verdict(&dir, v)?;
    }

    let summary = json!({
        "dump_id": analysis.dump_id,
        "dump": analysis.dump_path,
        "analysis_dir": dir,
        "schema_version": analysis.image_features.schema_version,
        "processes": analysis.image.processes.len(),
        "warnings": analysis.warnings.len(),
        "missing_plugins": analysis.image.warnings_of("missing_plugin").count(),
        "sentinel_features": analysis.image_features.sentinel_count(),
        "verdict": verdict.map(|v| v.prediction),
    });
    StructuredLogger::emit_json(&summary, &mut std::io::stdout().lock())?;
    Ok(())
}

fn ask(config: PipelineConfig, dir: PathBuf, question: String) -> CliResult<()> {
    let image = pipeline::load_image(&dir)?;
    let (image_features, process_features) = pipeline::load_features(&dir)?;
    let verdict = pipeline::load_verdict(&dir)?;
    let mut context = ConversationContext::new(
        &image,
        &image_features,
        &process_features,
        verdict,
        config.assistant.max_processes,
    );
    let assistant = OllamaAssistant::new(&config.assistant)?;
    info!(dump_id = %image.dump_id, model = %config.assistant.model, "assistant session");

    if !question.trim().is_empty() {
        println!("{}", assistant.respond(&context, &question)?);
        return Ok(());
    }
    for line in std::io::stdin().lock().lines() {
        let question = line?;
        let question = question.trim();
        if question.is_empty() {
            continue;
        }
        if matches!(question, "exit" | "quit") {
            break;
        }
        match assistant.respond(&context, question) {
            Ok(answer) => {
                println!("{answer}");
                context.record(question, &answer);
            }
            Err(e) => warn!(error = %e, "assistant failed"),
        }
    }
    Ok(())
}

fn main() -> CliResult<()> {
    let config_path = std::env::var("MEMFEAT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("memfeat.json"));
    let config = PipelineConfig::load(&config_path);
    StructuredLogger::init(config.log.json, &config.log.level);

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => analyze(config, None),
        Some("analyze") => analyze(config, args.next().map(PathBuf::from)),
        Some("ask") => {
            let dir = args.next().ok_or(USAGE)?;
            let question = args.collect::<Vec<_>>().join(" ");
            ask(config, PathBuf::from(dir), question)
        }
        Some("-h") | Some("--help") => {
            println!("{USAGE}");
            Ok(())
        }
        Some(other) => Err(format!("unknown command {other}\n{USAGE}").into()),
    }
}
