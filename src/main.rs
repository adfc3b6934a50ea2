use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use epub_translator::epub::chunk::{chunk_blocks, DEFAULT_CHUNK_CHAR_BUDGET};
use epub_translator::epub::extract::{extract_blocks, BlockKind};
use epub_translator::epub::manifest::resolve_spine;
use epub_translator::epub::package::EpubArchive;
use epub_translator::epub::tree::Document;
use epub_translator::pipeline::{init_default_config, CliOverrides, JobController, RunConfig};
use epub_translator::progress::ConsoleProgress;
use epub_translator::service::GeminiService;

#[derive(Parser, Debug)]
#[command(name = "epub-translator")]
#[command(about = "EPUB translator backed by a structured-generation service", long_about = None)]
struct Args {
    /// Generate default config + prompt files, then exit
    #[arg(long)]
    init_config: bool,

    /// Directory to write config/prompt files (default: current directory)
    #[arg(long, value_name = "DIR")]
    init_config_dir: Option<PathBuf>,

    /// Overwrite existing config/prompt files when used with --init-config
    #[arg(long)]
    force: bool,

    /// Input .epub
    #[arg(value_name = "EPUB")]
    input: Option<PathBuf>,

    /// Output .epub (default: <input_stem>_translated.epub)
    #[arg(short, long, value_name = "EPUB")]
    output: Option<PathBuf>,

    /// Config file path (default: search for epub-translator.toml upwards)
    #[arg(long)]
    config: Option<PathBuf>,

    /// replace | bilingual
    #[arg(long)]
    mode: Option<String>,

    /// Free-text target language instruction, e.g. "Translate into German."
    #[arg(long)]
    target_language: Option<String>,

    /// Model id sent to the generation service
    #[arg(long)]
    model: Option<String>,

    /// Override the generation service base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Service credential (default: $GEMINI_API_KEY or [service] api_key)
    #[arg(long)]
    api_key: Option<String>,

    /// Max paragraphs per request (0 = unbounded)
    #[arg(long)]
    max_blocks: Option<usize>,

    /// Write the partial archive after every document
    #[arg(long)]
    autosave: bool,

    /// Print the reading order and exit (no service calls)
    #[arg(long)]
    list_spine: bool,

    /// Write extracted blocks and chunk boundaries as JSON, then exit (no service calls)
    #[arg(long, value_name = "JSON")]
    extract_blocks: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let progress = Arc::new(ConsoleProgress::new(true));

    if args.init_config {
        let dir = args
            .init_config_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let cfg_path = init_default_config(&dir, args.force).context("init default config")?;
        eprintln!("Wrote config: {}", cfg_path.display());
        return Ok(());
    }

    let input = match args.input.clone() {
        Some(p) => p,
        None => {
            let mut cmd = Args::command();
            cmd.print_help().context("print help")?;
            eprintln!(
                "\n\nUSAGE:\n  epub-translator <book.epub>\n\nTIPS:\n  - Default config search: epub-translator.toml (upwards), or set EPUB_TRANSLATOR_CONFIG.\n  - Credential: --api-key, $GEMINI_API_KEY, or [service] api_key.\n"
            );
            return Ok(());
        }
    };

    if args.list_spine {
        let archive = EpubArchive::read(&input)?;
        for path in resolve_spine(&archive)?.iter() {
            println!("{path}");
        }
        return Ok(());
    }

    if let Some(json_path) = args.extract_blocks.clone() {
        let max_blocks = args.max_blocks.filter(|n| *n > 0);
        write_block_report(&input, &json_path, max_blocks)?;
        progress.info(format!("Wrote blocks: {}", json_path.display()));
        return Ok(());
    }

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| sibling_with_suffix(&input, "_translated.epub"));

    let run = RunConfig::from_paths_and_args(
        &input,
        &output,
        CliOverrides {
            config_path: args.config,
            mode: args.mode,
            target_language: args.target_language,
            model: args.model,
            base_url: args.base_url,
            api_key: args.api_key,
            max_blocks: args.max_blocks,
            autosave: args.autosave,
        },
    )
    .context("build config")?;
    if let Some(p) = run.config_path.as_ref() {
        progress.info(format!("Config: {}", p.display()));
    }
    let autosave_path = sibling_with_suffix(&input, &run.autosave_suffix);

    let service = GeminiService::new(
        run.job.service_base_url.as_deref(),
        &run.job.credential,
        run.job.request_timeout,
    )?;

    progress.info(format!("Read EPUB: {}", input.display()));
    let bytes = std::fs::read(&input).with_context(|| format!("read {}", input.display()))?;

    let autosave = run.autosave;
    let cb_progress = progress.clone();
    let cb_autosave = autosave_path.clone();
    let controller = JobController::new(run.job, service).on_progress(move |snapshot| {
        cb_progress.snapshot(snapshot);
        if autosave {
            if let Err(e) = std::fs::write(&cb_autosave, snapshot.partial_archive.as_slice()) {
                tracing::warn!(path = %cb_autosave.display(), error = %e, "autosave failed");
            }
        }
    });
    let handle = controller.handle();

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            signal_handle.request_cancel();
        }
    });

    match controller.start(&bytes).await {
        Ok(report) => {
            std::fs::write(&output, &report.archive)
                .with_context(|| format!("write {}", output.display()))?;
            for note in &report.notes {
                progress.info(format!("Note: {note}"));
            }
            progress.info(report.status_text());
            progress.info(format!("Wrote: {}", output.display()));
            if autosave && autosave_path.exists() {
                let _ = std::fs::remove_file(&autosave_path);
            }
            Ok(())
        }
        Err(e) => {
            if let Some(partial) = handle.partial_archive() {
                std::fs::write(&autosave_path, partial.as_slice())
                    .with_context(|| format!("write {}", autosave_path.display()))?;
                progress.info(format!("Partial output: {}", autosave_path.display()));
            }
            if e.is_cancelled() {
                anyhow::bail!("cancelled");
            }
            Err(e.into())
        }
    }
}

fn sibling_with_suffix(input: &Path, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output")
        .to_string();
    input.with_file_name(format!("{stem}{suffix}"))
}

#[derive(Serialize)]
struct BlockReport {
    document: String,
    chunks: usize,
    blocks: Vec<BlockEntry>,
}

#[derive(Serialize)]
struct BlockEntry {
    chunk: usize,
    kind: BlockKind,
    tag: String,
    text: String,
}

fn write_block_report(input: &Path, json_path: &Path, max_blocks: Option<usize>) -> anyhow::Result<()> {
    let archive = EpubArchive::read(input)?;
    let spine = resolve_spine(&archive)?;
    let mut out = Vec::with_capacity(spine.len());
    for path in spine.iter() {
        let Some(bytes) = archive.read_entry(path) else {
            tracing::warn!(document = path, "missing from archive");
            continue;
        };
        let doc = match Document::parse(path, bytes) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(document = path, error = %format!("{e:#}"), "unparsable");
                continue;
            }
        };
        let chunks = chunk_blocks(&extract_blocks(&doc), DEFAULT_CHUNK_CHAR_BUDGET, max_blocks);
        let blocks = chunks
            .iter()
            .enumerate()
            .flat_map(|(i, c)| {
                c.blocks.iter().map(move |b| BlockEntry {
                    chunk: i,
                    kind: b.kind,
                    tag: b.tag.clone(),
                    text: b.text.clone(),
                })
            })
            .collect();
        out.push(BlockReport {
            document: path.to_string(),
            chunks: chunks.len(),
            blocks,
        });
    }
    let json = serde_json::to_vec_pretty(&out).context("serialize blocks")?;
    std::fs::write(json_path, json).with_context(|| format!("write {}", json_path.display()))?;
    Ok(())
}
