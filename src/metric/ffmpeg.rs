//! ffmpeg psnr & libvmaf scorers.
use super::{ffmpeg_compare, lavfi_path};
use crate::{
    process::{CommandExt, ensure_success},
    result::{Score, Scores},
    scorer::{Job, Normalized, ScoreError, Scorer, mean},
    temporary,
};
use anyhow::{Context, anyhow, ensure};
use futures_util::{FutureExt, future::LocalBoxFuture};
use log::debug;
use serde::Deserialize;
use std::{collections::HashMap, fmt, path::Path, process::Stdio, str::FromStr};
use tokio::process::Command;

/// Per-frame psnr of identical frames is infinite, recorded as this instead.
pub const PSNR_CAP: f64 = 100.0;

pub static PSNR: Psnr = Psnr;
pub static VMAF: Vmaf = Vmaf {
    model: "vmaf_v0.6.1",
    neg_model: None,
};
pub static VMAF_4K: Vmaf = Vmaf {
    model: "vmaf_4k_v0.6.1",
    neg_model: None,
};
pub static VMAF_FULL: Vmaf = Vmaf {
    model: "vmaf_v0.6.1",
    neg_model: Some("vmaf_v0.6.1neg"),
};
pub static VMAF_4K_FULL: Vmaf = Vmaf {
    model: "vmaf_4k_v0.6.1",
    neg_model: Some("vmaf_4k_v0.6.1neg"),
};

/// ffmpeg `psnr` filter with an exact frame hash comparison for `lossless_match`.
#[derive(Debug)]
pub struct Psnr;

impl Scorer for Psnr {
    fn score<'a>(&'a self, job: &'a Job<'a>) -> LocalBoxFuture<'a, Result<Normalized, ScoreError>> {
        async move {
            let reference = job.reference()?;
            let stats = job.temp_file("log");
            temporary::add(&stats);

            let lavfi = format!("psnr='stats_file={}'", lavfi_path(&stats));
            ffmpeg_compare(job, reference, &lavfi, "ffmpeg psnr").await?;

            let stats_text = tokio::fs::read_to_string(&stats)
                .await
                .context("reading psnr stats")?;
            let mut scores = parse_psnr_stats(&stats_text)?;

            let (dist_md5, ref_md5) =
                tokio::try_join!(frame_md5s(&job.distorted.path), frame_md5s(&reference.path))?;
            let lossless_match = !dist_md5.is_empty() && dist_md5 == ref_md5;
            debug!("psnr lossless_match={lossless_match}");

            if lossless_match {
                scores.insert("psnr".into(), Score::Value(PSNR_CAP));
            }

            Ok(Normalized {
                scores,
                lossless_match: Some(lossless_match),
                properties_match: None,
            })
        }
        .boxed_local()
    }
}

/// Parse `stats_file` lines like
/// `n:1 mse_avg:0.52 mse_y:0.61 mse_u:0.31 mse_v:0.33 psnr_avg:50.97 psnr_y:50.27 psnr_u:53.20 psnr_v:52.89`
fn parse_psnr_stats(stats: &str) -> anyhow::Result<Scores> {
    let mut series: HashMap<&str, Vec<f64>> = HashMap::new();
    for line in stats.lines().filter(|l| l.starts_with("n:")) {
        for field in line.split_whitespace() {
            let Some((key, val)) = field.split_once(':') else {
                continue;
            };
            if !key.starts_with("psnr_") {
                continue;
            }
            let val = match val {
                "inf" => PSNR_CAP,
                v => v
                    .parse::<f64>()
                    .with_context(|| format!("invalid {key} `{v}`"))?
                    .min(PSNR_CAP),
            };
            series.entry(key).or_default().push(val);
        }
    }

    let frames = series.remove("psnr_avg").unwrap_or_default();
    ensure!(!frames.is_empty(), "no psnr frames in stats file");

    let mut scores = Scores::new();
    for (key, values) in series {
        if let Some(mean) = mean(&values) {
            scores.insert(key.to_owned(), Score::Value(mean));
        }
    }
    if let Some(mean) = mean(&frames) {
        scores.insert("psnr".into(), Score::Value(mean));
    }
    scores.insert("psnr_frames".into(), Score::Series(frames));
    Ok(scores)
}

/// Video frame hashes in decode order.
async fn frame_md5s(path: &Path) -> anyhow::Result<Vec<String>> {
    let mut cmd = Command::new("ffmpeg");
    cmd.kill_on_drop(true)
        .stdin(Stdio::null())
        .arg("-hide_banner")
        .arg2("-i", path)
        .arg2("-map", "0:v:0")
        .arg2("-f", "framemd5")
        .arg("-");
    debug!("cmd `{}`", cmd.to_cmd_str());
    let out = cmd.output().await.context("ffmpeg framemd5")?;
    ensure_success("ffmpeg framemd5", &out)?;
    Ok(parse_framemd5(&String::from_utf8_lossy(&out.stdout)))
}

/// Hash column of framemd5 output, ignoring timestamps so container differences don't matter.
fn parse_framemd5(out: &str) -> Vec<String> {
    out.lines()
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.rsplit(',').next())
        .map(|h| h.trim().to_owned())
        .filter(|h| !h.is_empty())
        .collect()
}

/// Frame size both streams are bicubic scaled to before vmaf analysis.
/// Without a height the aspect ratio is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmafScale {
    pub width: u32,
    pub height: Option<u32>,
}

impl FromStr for VmafScale {
    type Err = anyhow::Error;

    /// `1920x1080` or `1920`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = match s.split_once(['x', ':']) {
            Some((w, h)) => (w, Some(h)),
            None => (s, None),
        };
        let width = w.trim().parse().map_err(|_| anyhow!("invalid width `{w}`"))?;
        let height = h
            .map(|h| h.trim().parse().map_err(|_| anyhow!("invalid height `{h}`")))
            .transpose()?;
        ensure!(width > 0 && height != Some(0), "scale must be non-zero");
        Ok(Self { width, height })
    }
}

impl fmt::Display for VmafScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.height {
            Some(h) => write!(f, "{}x{h}", self.width),
            None => write!(f, "{}", self.width),
        }
    }
}

/// Filters applied to distorted & reference streams before libvmaf.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct VmafFilters {
    pub scale: Option<VmafScale>,
    /// Frame rate both streams are converted to.
    pub fps: Option<f32>,
}

impl VmafFilters {
    fn lavfi_prefix(&self) -> String {
        let mut chain = vec![];
        if let Some(VmafScale { width, height }) = self.scale {
            let h = height.map_or(-1, i64::from);
            chain.push(format!("scale={width}:{h}:flags=bicubic"));
        }
        if let Some(fps) = self.fps {
            chain.push(format!("fps={fps}"));
        }
        if chain.is_empty() {
            return String::new();
        }
        let chain = chain.join(",");
        format!("[0:v]{chain}[dis];[1:v]{chain}[ref];[dis][ref]")
    }
}

/// ffmpeg `libvmaf` with psnr, ssim & ms-ssim features.
#[derive(Debug)]
pub struct Vmaf {
    pub model: &'static str,
    /// Additional "no enhancement gain" model.
    pub neg_model: Option<&'static str>,
}

impl Vmaf {
    fn lavfi(&self, log_path: &Path, filters: &VmafFilters) -> String {
        let mut models = format!("version={}\\:name=vmaf", self.model);
        if let Some(neg) = self.neg_model {
            models += &format!("|version={neg}\\:name=vmaf_neg");
        }
        format!(
            "{}libvmaf='model={models}:feature=name=psnr|name=float_ssim|name=float_ms_ssim\
             :log_fmt=json:n_threads={}:log_path={}'",
            filters.lavfi_prefix(),
            num_cpus::get(),
            lavfi_path(log_path),
        )
    }
}

impl Scorer for Vmaf {
    fn score<'a>(&'a self, job: &'a Job<'a>) -> LocalBoxFuture<'a, Result<Normalized, ScoreError>> {
        async move {
            let reference = job.reference()?;
            let log_path = job.temp_file("json");
            temporary::add(&log_path);

            let lavfi = self.lavfi(&log_path, &job.vmaf);
            ffmpeg_compare(job, reference, &lavfi, "ffmpeg vmaf").await?;

            let log = tokio::fs::read(&log_path).await.context("reading vmaf log")?;
            let log: VmafLog = serde_json::from_slice(&log).context("parsing vmaf log")?;
            Ok(log.into_scores(self.neg_model.is_some())?.into())
        }
        .boxed_local()
    }
}

#[derive(Debug, Deserialize)]
struct VmafLog {
    #[serde(default)]
    frames: Vec<VmafFrame>,
    pooled_metrics: HashMap<String, Pooled>,
}

#[derive(Debug, Deserialize)]
struct VmafFrame {
    metrics: HashMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct Pooled {
    mean: f64,
}

impl VmafLog {
    fn into_scores(self, neg: bool) -> anyhow::Result<Scores> {
        let pooled = |key: &str| {
            self.pooled_metrics
                .get(key)
                .map(|p| p.mean)
                .with_context(|| format!("vmaf log missing pooled {key}"))
        };

        let psnr_y = pooled("psnr_y")?;
        let psnr_cb = pooled("psnr_cb")?;
        let psnr_cr = pooled("psnr_cr")?;

        let mut scores = Scores::from([
            ("vmaf".to_owned(), Score::Value(pooled("vmaf")?)),
            (
                "psnr".to_owned(),
                Score::Value((6.0 * psnr_y + psnr_cb + psnr_cr) / 8.0),
            ),
            ("psnr_y".to_owned(), Score::Value(psnr_y)),
            ("psnr_cb".to_owned(), Score::Value(psnr_cb)),
            ("psnr_cr".to_owned(), Score::Value(psnr_cr)),
            ("ssim".to_owned(), Score::Value(pooled("float_ssim")?)),
            ("ms_ssim".to_owned(), Score::Value(pooled("float_ms_ssim")?)),
        ]);
        if neg {
            scores.insert("vmaf_neg".into(), Score::Value(pooled("vmaf_neg")?));
        }

        let frames: Vec<f64> = self
            .frames
            .iter()
            .filter_map(|f| f.metrics.get("vmaf").copied())
            .collect();
        if !frames.is_empty() {
            scores.insert("vmaf_frames".into(), Score::Series(frames));
        }
        Ok(scores)
    }
}
