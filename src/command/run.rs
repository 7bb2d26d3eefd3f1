use crate::{
    command::PROGRESS_CHARS,
    controller::{self, Completed, ItemOutcome, OutputTarget, RunConfig, RunSummary, Written},
    device::{self, Backend, SystemProbe},
    float::TerseF64,
    matcher::{self, DEFAULT_REF_SUFFIXES, MatchConfig},
    metric::ffmpeg::{VmafFilters, VmafScale},
    provision::Provisioner,
    registry::REGISTRY,
    scorer::ScorerAdapter,
    temporary,
};
use anyhow::{Context, ensure};
use clap::Parser;
use console::style;
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use log::{info, warn};
use std::{
    io::IsTerminal,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

/// Score distorted videos with one or more metrics.
///
/// References are paired with distorted files by closest file name.
/// Each (video, mode) result is written to `<base_name>.<mode>.json`,
/// or printed to stdout as a json line if no output is given.
#[derive(Parser, Clone)]
#[clap(verbatim_doc_comment)]
#[group(skip)]
pub struct Args {
    /// Distorted video file or directory.
    #[arg(short, long)]
    pub distorted: PathBuf,

    /// Reference video file or directory.
    ///
    /// A file is paired with every distorted video.
    #[arg(short, long)]
    pub reference: Option<PathBuf>,

    /// Metric mode(s), repeatable or comma separated. See `vqcheck modes`.
    #[arg(short, long = "mode", value_delimiter = ',', default_value = "vmaf4k-full")]
    pub modes: Vec<String>,

    /// Result output directory. Without a value results are written next to
    /// each distorted video.
    #[arg(short, long, num_args = 0..=1)]
    pub output: Option<Option<PathBuf>>,

    /// Max distorted videos scored concurrently.
    #[arg(long, env = "VQCHECK_JOBS", default_value_t = 1)]
    pub jobs: usize,

    /// Per (video, mode) time limit, e.g. "10m". Exceeding it fails the item.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Preferred compute backends in order, e.g. "cuda,vulkan".
    /// By default available accelerators are probed. cpu is always the last fallback.
    #[arg(long, env = "VQCHECK_DEVICE", value_delimiter = ',')]
    pub device: Vec<Backend>,

    /// Where metric tools & models are provisioned.
    ///
    /// [default: <data dir>/vqcheck]
    #[arg(long, env = "VQCHECK_TOOLKIT")]
    pub toolkit: Option<PathBuf>,

    /// Never provision, modes not already set up fail.
    #[arg(long)]
    pub offline: bool,

    /// Search distorted & reference directories recursively.
    #[arg(long)]
    pub recursive: bool,

    /// Max file name edit distance, relative to the longer name, for a reference to match.
    /// Unlimited by default.
    #[arg(long)]
    pub max_name_distance: Option<f64>,

    /// Reference name suffix ignored when matching, repeatable.
    ///
    /// [default: _ref -ref .ref _reference _src _source _orig _original]
    #[arg(long = "ref-suffix")]
    pub ref_suffixes: Vec<String>,

    /// Frames per second sampled by per-frame modes, overriding each mode's default.
    #[arg(long)]
    pub sample_fps: Option<f32>,

    /// Scale distorted & reference to this size for vmaf modes, e.g. "1920x1080".
    /// A width alone keeps the aspect ratio.
    #[arg(long)]
    pub vmaf_scale: Option<VmafScale>,

    /// Convert distorted & reference to this frame rate for vmaf modes.
    #[arg(long)]
    pub vmaf_fps: Option<f32>,

    /// Keep existing valid result files instead of rescoring.
    #[arg(long)]
    pub skip_existing: bool,

    #[arg(skip)]
    pub quiet: bool,
}

impl Args {
    fn output_target(&self) -> OutputTarget {
        match &self.output {
            None => OutputTarget::Stdout,
            Some(None) => OutputTarget::Alongside,
            Some(Some(dir)) => OutputTarget::Dir(dir.clone()),
        }
    }

    fn match_config(&self) -> MatchConfig {
        let ref_suffixes = match self.ref_suffixes.is_empty() {
            true => DEFAULT_REF_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            false => self.ref_suffixes.clone(),
        };
        MatchConfig {
            recursive: self.recursive,
            max_distance: self.max_name_distance,
            ref_suffixes,
        }
    }
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    let start = Instant::now();
    let registry = &*REGISTRY;
    let (modes, unknown) = controller::known_modes(registry, &args.modes)?;
    for err in &unknown {
        warn!("{err}, skipping");
    }

    let pairings = matcher::pair(
        &args.distorted,
        args.reference.as_deref(),
        &args.match_config(),
    )?;
    let output = args.output_target();
    controller::ensure_distinct_outputs(&pairings, &modes, &output)?;

    let device = device::resolve(&args.device, &SystemProbe);
    info!("device {device}");

    let toolkit = match args.toolkit.clone() {
        Some(dir) => dir,
        None => default_toolkit()?,
    };
    let adapter = ScorerAdapter::new(
        registry,
        Provisioner::new(toolkit, args.offline),
        temporary::process_dir().await?,
    )
    .with_sample_fps(args.sample_fps)
    .with_vmaf_filters(VmafFilters {
        scale: args.vmaf_scale,
        fps: args.vmaf_fps,
    });

    let config = RunConfig {
        output,
        jobs: args.jobs,
        timeout: args.timeout,
        skip_existing: args.skip_existing,
    };

    let total = pairings.len() * modes.len();
    let bar = match args.quiet || !std::io::stderr().is_terminal() {
        true => ProgressBar::hidden(),
        false => ProgressBar::new(total as u64).with_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan.bold} {elapsed_precise:.bold} {wide_bar:.cyan/blue} ({pos}/{len}, eta {eta})")?
                .progress_chars(PROGRESS_CHARS),
        ),
    };
    bar.enable_steady_tick(Duration::from_millis(100));

    let on_item = |outcome: &ItemOutcome| {
        bar.inc(1);
        if !args.quiet {
            bar.println(item_line(outcome));
        }
    };
    let mut summary =
        controller::run(&adapter, &pairings, &modes, &device, &config, &on_item).await;
    bar.finish_and_clear();
    summary.record_unknown(unknown);

    eprint_summary(&summary, start.elapsed(), args.quiet);
    ensure!(
        summary.is_success(),
        "{} failed, {} succeeded",
        summary.failures.len(),
        summary.succeeded
    );
    Ok(())
}

fn default_toolkit() -> anyhow::Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("vqcheck"))
        .context("no data dir found, use --toolkit")
}

fn file_name(path: &Path) -> std::borrow::Cow<'_, str> {
    path.file_name().unwrap_or(path.as_os_str()).to_string_lossy()
}

fn item_line(outcome: &ItemOutcome) -> String {
    let name = file_name(&outcome.distorted);
    match &outcome.status {
        Ok(Completed {
            written: Written::Skipped(_),
            ..
        }) => style(format!("- {name} {} exists, skipped", outcome.mode))
            .dim()
            .to_string(),
        Ok(Completed { result, .. }) => {
            let headline = result
                .as_ref()
                .and_then(|r| r.headline())
                .map(|s| format!(" {}", TerseF64(s)))
                .unwrap_or_default();
            let lossless = match result.as_ref().and_then(|r| r.lossless_match) {
                Some(true) => " (lossless)",
                _ => "",
            };
            style(format!("- {name} {}{headline}{lossless}", outcome.mode))
                .dim()
                .to_string()
        }
        Err(err) => format!(
            "{} {name} {}: {err}",
            style("-").red(),
            style(outcome.mode).red()
        ),
    }
}

fn eprint_summary(summary: &RunSummary, took: Duration, quiet: bool) {
    if !quiet {
        let mut line = format!(
            "{} {} {}",
            style(summary.succeeded).bold().green(),
            style("succeeded").dim(),
            style(format!("in {}", HumanDuration(took))).dim(),
        );
        if summary.skipped > 0 {
            line += &style(format!(", {} skipped", summary.skipped)).dim().to_string();
        }
        if summary.properties_checked > 0 {
            line += &style(format!(
                ", properties matched {}/{}",
                summary.properties_matched, summary.properties_checked
            ))
            .dim()
            .to_string();
        }
        if summary.lossless_checked > 0 {
            line += &style(format!(
                ", lossless {}/{}",
                summary.lossless, summary.lossless_checked
            ))
            .dim()
            .to_string();
        }
        eprintln!("{line}");
    }

    if summary.failures.is_empty() {
        return;
    }
    eprintln!(
        "{} {}",
        style(summary.failures.len()).bold().red(),
        style("failed").red()
    );
    for failure in &summary.failures {
        let name = match &failure.distorted {
            Some(path) => format!("{} ", file_name(path)),
            None => String::new(),
        };
        eprintln!(
            "  {name}{} {}: {}",
            failure.mode,
            style(failure.kind).red(),
            failure.reason
        );
    }
}
