use crate::aggregate::{self, ConsolidatedReport};
use anyhow::ensure;
use clap::Parser;
use console::style;
use log::info;
use std::path::PathBuf;

/// Merge result json files into a single report keyed by video then method.
///
/// Entries of an existing report are kept unless replaced by a newer result
/// for the same video & method.
#[derive(Parser, Clone)]
#[clap(verbatim_doc_comment)]
#[group(skip)]
pub struct Args {
    /// Directory searched recursively for `<base_name>.<method>.json` files.
    #[arg(short, long)]
    pub metrics_dir: PathBuf,

    /// Report output file.
    #[arg(short, long)]
    pub output_file: PathBuf,

    /// Existing report to merge into. May be the same as the output file.
    #[arg(short, long)]
    pub existing: Option<PathBuf>,

    #[arg(skip)]
    pub quiet: bool,
}

pub async fn aggregate(
    Args {
        metrics_dir,
        output_file,
        existing,
        quiet,
    }: Args,
) -> anyhow::Result<()> {
    ensure!(
        metrics_dir.is_dir(),
        "{} is not a directory",
        metrics_dir.display()
    );
    let existing = match &existing {
        Some(path) => ConsolidatedReport::load_or_empty(path).await,
        None => ConsolidatedReport::default(),
    };

    let files = aggregate::discover(&metrics_dir).await?;
    info!("found {} result files in {}", files.len(), metrics_dir.display());
    let agg = aggregate::aggregate(existing, &files).await;
    agg.report.write(&output_file).await?;

    if !quiet {
        eprintln!(
            "{} {} {}, {} {}, {} {}",
            style(agg.found).bold(),
            style("found").dim(),
            style(agg.loaded).bold().green(),
            style("loaded").dim(),
            style(agg.malformed.len()).bold().red(),
            style("failed").dim(),
            style(format!("-> {}", output_file.display())).dim(),
        );
        eprintln!(
            "{} {}, {} {}, {} {}",
            style(agg.report.0.len()).bold(),
            style("videos").dim(),
            style(agg.new_videos.len()).bold(),
            style("new").dim(),
            style(agg.updated_videos.len()).bold(),
            style("updated").dim(),
        );
        for (video, missing) in agg.report.missing_methods() {
            eprintln!(
                "  {video} {} {}",
                style("missing").yellow(),
                missing.join(", ")
            );
        }
    }
    for err in &agg.malformed {
        eprintln!("{} {err}", style("-").red());
    }
    Ok(())
}
