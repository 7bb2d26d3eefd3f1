//! JPEG XL project image metrics applied to sampled frames.
use crate::{
    process::{CommandExt, ensure_success, ffmpeg_run},
    result::{Score, Scores},
    scorer::{Job, Normalized, ScoreError, Scorer, mean},
    temporary,
};
use anyhow::Context;
use futures_util::{FutureExt, future::LocalBoxFuture};
use log::{debug, info};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Default frames sampled per second of video.
pub const SAMPLE_FPS: f32 = 2.0;

pub static SSIMULACRA2: JpegXl = JpegXl {
    name: "ssimulacra2",
    program: "ssimulacra2",
};
pub static BUTTERAUGLI: JpegXl = JpegXl {
    name: "butteraugli",
    program: "butteraugli_main",
};

/// Scores each sampled frame pair with `program <reference.png> <distorted.png>`.
#[derive(Debug)]
pub struct JpegXl {
    name: &'static str,
    program: &'static str,
}

impl Scorer for JpegXl {
    fn score<'a>(&'a self, job: &'a Job<'a>) -> LocalBoxFuture<'a, Result<Normalized, ScoreError>> {
        async move {
            let reference = job.reference()?;
            let fps = job.sample_fps.unwrap_or(SAMPLE_FPS);

            let dist_dir = job.temp_file("dist");
            let ref_dir = job.temp_file("ref");
            let (dist_frames, ref_frames) = tokio::try_join!(
                extract_frames(&job.distorted.path, &dist_dir, fps),
                extract_frames(&reference.path, &ref_dir, fps),
            )?;
            ScoreError::ensure_computation(
                dist_frames.len() == ref_frames.len(),
                format_args!(
                    "sampled frame count mismatch, distorted {} vs reference {}",
                    dist_frames.len(),
                    ref_frames.len()
                ),
            )?;
            ScoreError::ensure_computation(!dist_frames.is_empty(), "no frames sampled")?;

            info!("{} {} frames", self.name, dist_frames.len());
            let mut frames = Vec::with_capacity(dist_frames.len());
            for (dist, refr) in dist_frames.iter().zip(&ref_frames) {
                frames.push(self.score_frame(refr, dist).await?);
            }
            Ok(summarize(self.name, frames).into())
        }
        .boxed_local()
    }
}

impl JpegXl {
    async fn score_frame(&self, reference: &Path, distorted: &Path) -> anyhow::Result<f64> {
        let mut cmd = Command::new(self.program);
        cmd.kill_on_drop(true).arg(reference).arg(distorted);
        debug!("cmd `{}`", cmd.to_cmd_str());
        let out = cmd.output().await.with_context(|| self.program.to_owned())?;
        ensure_success(self.program, &out)?;
        let stdout = String::from_utf8_lossy(&out.stdout);
        first_float(&stdout).with_context(|| format!("{} output `{}`", self.program, stdout.trim()))
    }
}

/// Decode `fps` frames per second of `video` into numbered pngs.
async fn extract_frames(video: &Path, dir: &Path, fps: f32) -> anyhow::Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dir).await?;
    temporary::add(dir);

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg2("-i", video)
        .arg2("-vf", format!("fps={fps}"))
        .arg(dir.join("%06d.png"));
    ffmpeg_run(cmd, "ffmpeg frames", None).await?;

    let mut frames = vec![];
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "png") {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

fn first_float(out: &str) -> Option<f64> {
    out.split_whitespace()
        .find_map(|w| w.trim_end_matches([',', ';']).parse::<f64>().ok())
}

fn summarize(name: &str, frames: Vec<f64>) -> Scores {
    let mut scores = Scores::new();
    if let Some(mean) = mean(&frames) {
        scores.insert(name.to_owned(), Score::Value(mean));
    }
    let min = frames.iter().copied().reduce(f64::min);
    let max = frames.iter().copied().reduce(f64::max);
    if let (Some(min), Some(max)) = (min, max) {
        scores.insert(format!("{name}_min"), Score::Value(min));
        scores.insert(format!("{name}_max"), Score::Value(max));
    }
    scores.insert(format!("{name}_frames"), Score::Series(frames));
    scores
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_tool_output() {
        assert_eq!(first_float("83.1245910\n"), Some(83.124591));
        assert_eq!(first_float("1.2345678\n3-norm: 0.634\n"), Some(1.2345678));
        assert_eq!(first_float("error: bad png"), None);
    }

    #[test]
    fn frame_summary() {
        let scores = summarize("ssimulacra2", vec![80.0, 90.0, 70.0]);
        assert_eq!(scores["ssimulacra2"], Score::Value(80.0));
        assert_eq!(scores["ssimulacra2_min"], Score::Value(70.0));
        assert_eq!(scores["ssimulacra2_max"], Score::Value(90.0));
        assert_eq!(
            scores["ssimulacra2_frames"],
            Score::Series(vec![80.0, 90.0, 70.0])
        );
    }
}
