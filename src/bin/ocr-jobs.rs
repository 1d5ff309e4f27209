//! CLI binary for edgequake-ocr-jobs.
//!
//! A thin shim over the library crate: builds an in-process orchestrator
//! from CLI flags, submits every input document as a job, renders one
//! progress bar per job while polling status, and copies the artifacts of
//! completed jobs into the output directory.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_ocr_jobs::pipeline::llm::{resolve_provider, LlmRecognitionModel};
use edgequake_ocr_jobs::pipeline::render::PdfiumRasterizer;
use edgequake_ocr_jobs::{
    ArtifactKind, JobId, JobState, Orchestrator, OrchestratorConfig, SubmitOptions,
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  ocr-jobs report.pdf
  ocr-jobs -o out/ --max-jobs 2 --max-recognitions 1 a.pdf b.pdf c.pdf
  ocr-jobs --no-crop-mode --keep-repeats scan.pdf
  ocr-jobs --provider openai --model gpt-4.1-mini invoice.pdf

OUTPUT (per document, in <output-dir>/<name>/):
  <name>.md            clean Markdown, pages split by <--- Page Split --->
  <name>_det.md        same text with reference/detection tags
  <name>_layouts.pdf   pages with layout boxes drawn
  images.zip           extracted figures
  manifest.json        per-page outcome record

ENVIRONMENT:
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model
  RUST_LOG                Tracing filter (e.g. edgequake_ocr_jobs=debug)
"#;

/// Run PDF documents through the OCR job pipeline.
#[derive(Parser, Debug)]
#[command(
    name = "ocr-jobs",
    version,
    about = "Run PDF documents through a gated OCR job pipeline",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// PDF files to process.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Directory receiving one sub-directory of artifacts per document.
    #[arg(short, long, env = "OCR_JOBS_OUTPUT_DIR", default_value = "ocr-output")]
    output_dir: PathBuf,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    /// Jobs processed at once (job gate).
    #[arg(long, env = "OCR_JOBS_MAX_JOBS", default_value_t = 8)]
    max_jobs: usize,

    /// Recognition calls at once (accelerator gate).
    #[arg(long, env = "OCR_JOBS_MAX_RECOGNITIONS", default_value_t = 4)]
    max_recognitions: usize,

    /// Seconds a job may wait for either gate before failing.
    #[arg(long, env = "OCR_JOBS_GATE_TIMEOUT")]
    gate_timeout: Option<u64>,

    /// Rendering DPI (72–400).
    #[arg(long, env = "OCR_JOBS_DPI", default_value_t = 144,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Generation budget per crop.
    #[arg(long, env = "OCR_JOBS_MAX_TOKENS", default_value_t = 8192)]
    max_tokens: usize,

    /// Send each page whole instead of tiling it.
    #[arg(long, env = "OCR_JOBS_NO_CROP_MODE")]
    no_crop_mode: bool,

    /// Keep runaway pages as placeholders instead of omitting them.
    #[arg(long, env = "OCR_JOBS_KEEP_REPEATS")]
    keep_repeats: bool,

    /// Prompt sent with every crop.
    #[arg(long, env = "OCR_JOBS_PROMPT")]
    prompt: Option<String>,

    /// Disable progress bars.
    #[arg(long, env = "OCR_JOBS_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "OCR_JOBS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "OCR_JOBS_QUIET")]
    quiet: bool,
}

struct Submitted {
    id: JobId,
    name: String,
    /// Output sub-directory, unique across this run.
    dir: PathBuf,
    bar: Option<ProgressBar>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Progress bars replace INFO-level logs unless --verbose is given.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build orchestrator ───────────────────────────────────────────────
    let config = build_config(&cli)?;
    let provider = resolve_provider(cli.provider.as_deref(), cli.model.as_deref())
        .context("Failed to configure LLM provider")?;
    let orchestrator = Orchestrator::new(
        config.clone(),
        Arc::new(PdfiumRasterizer::new(config.render_dpi)),
        Arc::new(LlmRecognitionModel::new(provider, config.max_tokens)),
    );

    // ── Submit ───────────────────────────────────────────────────────────
    let multi = MultiProgress::new();
    let mut jobs = Vec::with_capacity(cli.inputs.len());
    let mut used_dirs = HashSet::new();
    for path in &cli.inputs {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());

        let mut options = SubmitOptions::default().document_name(name.clone());
        if let Some(ref prompt) = cli.prompt {
            options = options.prompt(prompt.clone());
        }
        let id = orchestrator
            .submit(bytes, options)
            .await
            .with_context(|| format!("Failed to submit {}", path.display()))?;

        let dir = cli.output_dir.join(unique_dir_name(&mut used_dirs, &stem(&name)));
        let bar = show_progress.then(|| job_bar(&multi, &name));
        jobs.push(Submitted { id, name, dir, bar });
    }

    // ── Poll until every job is terminal ─────────────────────────────────
    let mut failures = 0;
    for job in &jobs {
        let status = loop {
            let status = orchestrator.status(job.id)?;
            if let Some(ref bar) = job.bar {
                if let Some(total) = status.page_count {
                    bar.set_length(total as u64);
                }
                bar.set_position(status.pages_done as u64);
                bar.set_message(match status.queue_position {
                    Some(pos) => format!("queued #{pos}"),
                    None => status.state.to_string(),
                });
            }
            if status.state.is_terminal() {
                break status;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        };

        match status.state {
            JobState::Completed => {
                copy_artifacts(&orchestrator, job.id, &config, &job.name, &job.dir).await?;
                finish(job, &green("✔"), &job.dir.display().to_string());
            }
            _ => {
                failures += 1;
                let reason = status
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                finish(job, &red("✘"), &reason);
            }
        }
    }

    if !cli.quiet {
        let stats = orchestrator.stats();
        eprintln!(
            "{} jobs: {} completed, {} failed",
            bold(&stats.jobs.total.to_string()),
            stats.jobs.completed,
            stats.jobs.failed
        );
    }
    if failures > 0 {
        anyhow::bail!("{} of {} jobs failed", failures, jobs.len());
    }
    Ok(())
}

/// Map CLI args to `OrchestratorConfig`.
fn build_config(cli: &Cli) -> Result<OrchestratorConfig> {
    let mut builder = OrchestratorConfig::builder()
        .max_concurrent_jobs(cli.max_jobs)
        .max_concurrent_recognitions(cli.max_recognitions)
        .render_dpi(cli.dpi)
        .max_tokens(cli.max_tokens)
        .crop_mode(!cli.no_crop_mode)
        .skip_repeat(!cli.keep_repeats);
    if let Some(secs) = cli.gate_timeout {
        builder = builder
            .job_gate_timeout(Duration::from_secs(secs))
            .accelerator_gate_timeout(Duration::from_secs(secs));
    }
    builder.build().context("Invalid configuration")
}

fn job_bar(multi: &MultiProgress, name: &str) -> ProgressBar {
    let style = ProgressStyle::with_template(
        "{spinner:.cyan} {prefix:.bold}  [{bar:32.green/238}] {pos:>3}/{len} pages  {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ")
    .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

    let bar = multi.add(ProgressBar::new(0));
    bar.set_style(style);
    bar.set_prefix(name.to_string());
    bar.set_message("queued");
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

fn finish(job: &Submitted, mark: &str, detail: &str) {
    let line = format!("{} {}  {}", mark, bold(&job.name), dim(detail));
    match job.bar {
        Some(ref bar) => bar.finish_with_message(line),
        None => eprintln!("{line}"),
    }
}

fn stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

/// `stem`, or `stem_2`, `stem_3`, … if an earlier input already took it.
fn unique_dir_name(used: &mut HashSet<String>, stem: &str) -> String {
    let mut candidate = stem.to_string();
    let mut n = 1;
    while !used.insert(candidate.clone()) {
        n += 1;
        candidate = format!("{stem}_{n}");
    }
    candidate
}

async fn copy_artifacts(
    orchestrator: &Orchestrator,
    id: JobId,
    config: &OrchestratorConfig,
    name: &str,
    dir: &Path,
) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let stem = SubmitOptions::default()
        .document_name(name)
        .resolve(config)
        .document_name;
    for kind in ArtifactKind::ALL {
        let bytes = orchestrator.artifact(id, kind).await?;
        let target = dir.join(kind.file_name(&stem));
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("Failed to write {}", target.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_file_name_gets_distinct_dirs() {
        let mut used = HashSet::new();
        assert_eq!(unique_dir_name(&mut used, &stem("a/x.pdf")), "x");
        assert_eq!(unique_dir_name(&mut used, &stem("b/x.pdf")), "x_2");
        assert_eq!(unique_dir_name(&mut used, &stem("c/x.pdf")), "x_3");
        assert_eq!(unique_dir_name(&mut used, &stem("y.pdf")), "y");
    }

    #[test]
    fn provider_flag_reads_documented_env_var() {
        let cmd = <Cli as clap::CommandFactory>::command();
        let provider = cmd
            .get_arguments()
            .find(|a| a.get_id() == "provider")
            .unwrap();
        assert_eq!(
            provider.get_env().and_then(|e| e.to_str()),
            Some("EDGEQUAKE_LLM_PROVIDER")
        );
        assert!(AFTER_HELP.contains("EDGEQUAKE_LLM_PROVIDER"));
    }
}
