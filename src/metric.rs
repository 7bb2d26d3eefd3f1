//! Native scorer implementations.
pub mod check;
pub mod ffmpeg;
pub mod jpegxl;
pub mod model;
pub mod xpsnr;

use crate::{
    matcher::VideoAsset,
    process::{Chunks, CommandExt, ffmpeg_run},
    scorer::Job,
};
use log::info;
use std::path::Path;
use tokio::process::Command;

/// Run `ffmpeg -i distorted -i reference -lavfi <lavfi> -f null -`.
async fn ffmpeg_compare(
    job: &Job<'_>,
    reference: &VideoAsset,
    lavfi: &str,
    name: &'static str,
) -> anyhow::Result<Chunks> {
    info!(
        "{} {} vs reference {}",
        job.mode,
        file_name(&job.distorted.path),
        file_name(&reference.path),
    );

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg2("-i", &job.distorted.path)
        .arg2("-i", &reference.path)
        .arg2("-lavfi", lavfi)
        .arg2("-f", "null")
        .arg("-");

    let total = job.distorted.info().await.duration.clone().ok();
    ffmpeg_run(cmd, name, total).await
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

/// Escape a path for use as a filter option value.
fn lavfi_path(path: &Path) -> String {
    let path = path.to_string_lossy();
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '\\' => out.push('/'),
            ':' | '\'' | ',' | ';' | '[' | ']' => {
                out.push_str("\\\\");
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

#[test]
fn lavfi_path_escapes() {
    assert_eq!(lavfi_path(Path::new("/tmp/a.json")), "/tmp/a.json");
    assert_eq!(lavfi_path(Path::new(r"C:\tmp\a.json")), r"C\\:/tmp/a.json");
}
