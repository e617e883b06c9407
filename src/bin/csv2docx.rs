//! CLI binary for csv2docx.
//!
//! A thin shim over the library crate that maps CLI flags to the
//! generation and orchestrator configs, queues one task per input file and
//! prints results.

use anyhow::{Context, Result};
use clap::Parser;
use csv2docx::{
    read_records, ConversionTask, GenerationConfig, OrchestratorConfig, TaskOrchestrator,
    TaskProgressCallback, TaskStatus, TemplateRegistry,
};
use indicatif::{ProgressBar, ProgressStyle};
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
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar over all tasks, plus a log line per finished attempt. Tasks
/// finish out of order, so every line names its file.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new(total: usize) -> Arc<Self> {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} files  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        let bar = ProgressBar::new(total as u64);
        bar.set_style(style);
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

fn file_label(task: &ConversionTask) -> String {
    task.source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| task.source.display().to_string())
}

impl TaskProgressCallback for CliProgress {
    fn on_task_started(&self, task: &ConversionTask) {
        self.bar.set_message(file_label(task));
    }

    fn on_task_completed(&self, task: &ConversionTask) {
        let detail = task
            .stats
            .as_ref()
            .map(|s| {
                format!(
                    "{} records  {} images  {} links",
                    s.records_emitted, s.images_embedded, s.hyperlinks_created
                )
            })
            .unwrap_or_default();
        let secs = task
            .duration()
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);
        self.bar.println(format!(
            "  {} {:<32} {}  {}",
            green("✓"),
            file_label(task),
            dim(&detail),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_task_failed(&self, task: &ConversionTask, will_retry: bool) {
        let error = task.error.clone().unwrap_or_default();
        // Truncate very long error messages to keep output tidy.
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error
        };
        if will_retry {
            self.bar.println(format!(
                "  {} {:<32} {}  {}",
                yellow("↻"),
                file_label(task),
                msg,
                dim(&format!("retry {}", task.retry_count)),
            ));
            return;
        }
        self.bar.println(format!("  {} {:<32} {}", red("✗"), file_label(task), red(&msg)));
        self.bar.inc(1);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one file with the default template
  csv2docx week.csv -o week.docx

  # Convert a batch with a named template, four at a time
  csv2docx data/*.csv -t weekly --output-dir reports/ --concurrency 4

  # Keep image URLs as text (no network)
  csv2docx week.csv --no-images

  # List the templates in a configuration file
  csv2docx --config templates_config.yaml --list-templates

  # Check that files decode and parse, without converting
  csv2docx data/*.csv --validate-only

RECORD COLUMNS:
  heading_1   level-1 heading, written once per document
  heading_2   level-2 heading
  heading_3   level-3 heading (wins over title)
  title       level-3 heading decorated as 【…】
  content     body text; image URLs are downloaded and embedded
  source      attribution, printed with the date
  date        publication date

ENVIRONMENT VARIABLES:
  CSV2DOCX_CONFIG     Template configuration file
  CSV2DOCX_TEMPLATE   Template name
  RUST_LOG            Log filter, overrides -v / -q / --log-level
"#;

/// Turn CSV records into styled Word documents.
#[derive(Parser, Debug)]
#[command(
    name = "csv2docx",
    version,
    about = "Turn CSV records into styled Word documents",
    long_about = "Turn CSV records into styled Word documents using a named template: \
headings, body paragraphs with embedded images, source lines and return-to-index links. \
Several files are converted concurrently.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Input CSV files.
    #[arg(required_unless_present = "list_templates")]
    inputs: Vec<PathBuf>,

    /// Template configuration (YAML).
    #[arg(short, long, env = "CSV2DOCX_CONFIG", default_value = "templates_config.yaml")]
    config: PathBuf,

    /// Template name.
    #[arg(short, long, env = "CSV2DOCX_TEMPLATE", default_value = "default")]
    template: String,

    /// Output file; only valid with a single input.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory for generated documents.
    #[arg(long, default_value = "./outputs/")]
    output_dir: PathBuf,

    /// Directory for downloaded images.
    #[arg(long, default_value = "temp-images")]
    scratch_dir: PathBuf,

    /// Leave image URLs as text instead of downloading them.
    #[arg(long)]
    no_images: bool,

    /// Timeout of the first image download attempt in seconds.
    #[arg(long, default_value_t = 20)]
    image_timeout: u64,

    /// Download attempts per image (1–5).
    #[arg(long, default_value_t = 5,
          value_parser = clap::value_parser!(u32).range(1..=5))]
    image_attempts: u32,

    /// Files converted at the same time.
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Retries per file after a failed conversion.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Per-file timeout in seconds.
    #[arg(long, default_value_t = 300)]
    task_timeout: u64,

    /// Show a marker where the index bookmark was placed.
    #[arg(long)]
    visible_bookmark: bool,

    /// Print a JSON summary of every task to stdout.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long)]
    no_progress: bool,

    /// Only check that the inputs decode and parse.
    #[arg(long)]
    validate_only: bool,

    /// List templates in the configuration and exit.
    #[arg(long)]
    list_templates: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,

    /// Log level when neither -v nor -q is given.
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless -v asks for them.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.validate_only;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        cli.log_level.as_filter()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Templates ────────────────────────────────────────────────────────
    let registry = TemplateRegistry::from_path(&cli.config)
        .with_context(|| format!("Failed to load templates from {}", cli.config.display()))?;

    if cli.list_templates {
        for name in registry.list_names() {
            let t = registry.resolve(&name)?;
            println!("{:<16} {}", bold(&name), t.display_name);
        }
        return Ok(());
    }
    // Fail fast on an unknown template, before any file is read.
    registry.resolve(&cli.template)?;

    if cli.output.is_some() && cli.inputs.len() > 1 {
        anyhow::bail!("--output takes a single input; use --output-dir for several");
    }

    // ── Validate-only mode ───────────────────────────────────────────────
    if cli.validate_only {
        let mut bad = 0;
        for input in &cli.inputs {
            match read_records(input).await {
                Ok(records) => {
                    let with_content = records.iter().filter(|r| r.has_content()).count();
                    println!(
                        "{} {}  {} records ({} with content)",
                        green("✓"),
                        input.display(),
                        records.len(),
                        with_content
                    );
                }
                Err(e) => {
                    bad += 1;
                    println!("{} {}  {}", red("✗"), input.display(), e);
                }
            }
        }
        if bad > 0 {
            anyhow::bail!("{bad} of {} files failed validation", cli.inputs.len());
        }
        return Ok(());
    }

    // ── Build configs ────────────────────────────────────────────────────
    let generation = GenerationConfig::builder()
        .scratch_dir(&cli.scratch_dir)
        .download_images(!cli.no_images)
        .fetch_timeout_secs(cli.image_timeout)
        .max_fetch_attempts(cli.image_attempts)
        .visible_bookmark(cli.visible_bookmark)
        .build()
        .context("Invalid configuration")?;
    let orchestration = OrchestratorConfig::builder()
        .max_concurrent_tasks(cli.concurrency)
        .max_retries(cli.max_retries)
        .task_timeout_secs(cli.task_timeout)
        .build()
        .context("Invalid configuration")?;

    let orchestrator = TaskOrchestrator::new(Arc::new(registry), generation, orchestration);
    let progress = show_progress.then(|| CliProgress::new(cli.inputs.len()));
    if let Some(cb) = &progress {
        orchestrator.add_progress_callback(Arc::clone(cb) as Arc<dyn TaskProgressCallback>);
    }

    // ── Run ──────────────────────────────────────────────────────────────
    for input in &cli.inputs {
        let destination = match &cli.output {
            Some(path) => path.clone(),
            None => output_path_for(input, &cli.output_dir),
        };
        orchestrator.submit(input, destination, &cli.template);
    }
    orchestrator.run_all().await;
    if let Some(cb) = &progress {
        cb.finish();
    }

    let tasks = orchestrator.tasks();
    let summary = orchestrator.summary();

    if cli.json {
        let json = serde_json::json!({ "summary": summary, "tasks": tasks });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).context("Failed to serialise summary")?
        );
    } else if !cli.quiet {
        for task in tasks.iter().filter(|t| t.status == TaskStatus::Completed) {
            eprintln!("  {}  {}", dim("→"), task.destination.display());
        }
        eprintln!(
            "{}  {}/{} files converted  ({:.1}% success)",
            if summary.failed == 0 { green("✔") } else { red("✘") },
            bold(&summary.completed.to_string()),
            summary.total,
            summary.success_rate,
        );
    }

    if summary.failed > 0 {
        let first = tasks
            .iter()
            .find(|t| t.status == TaskStatus::Failed)
            .and_then(|t| t.error.clone())
            .unwrap_or_default();
        anyhow::bail!("{} of {} files failed: {first}", summary.failed, summary.total);
    }
    Ok(())
}

/// `<output_dir>/<input stem>.docx`.
fn output_path_for(input: &Path, output_dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output_dir.join(format!("{stem}.docx"))
}
